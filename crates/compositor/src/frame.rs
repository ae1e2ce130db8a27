//! Per-frame phase ordering.

use std::fmt;

use crate::layer::LayerId;

/// Scene frames are uploaded every other frame unless configured otherwise.
pub const DEFAULT_SCENE_UPLOAD_INTERVAL: u32 = 2;

/// One step of a frame, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Layer(LayerId),
    /// Layers beneath the effects slot composited into the scratch target.
    PartialComposite,
    FullComposite,
}

impl Phase {
    /// Effects reads the partial composite, so that strictly precedes it;
    /// the full composite strictly follows everything else.
    pub const ALL: [Phase; 9] = [
        Phase::Layer(LayerId::Background),
        Phase::Layer(LayerId::Media),
        Phase::Layer(LayerId::Scene),
        Phase::Layer(LayerId::Av),
        Phase::PartialComposite,
        Phase::Layer(LayerId::Effects),
        Phase::Layer(LayerId::Text),
        Phase::Layer(LayerId::Overlay),
        Phase::FullComposite,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Layer(id) => write!(f, "layer:{id}"),
            Phase::PartialComposite => f.write_str("partial-composite"),
            Phase::FullComposite => f.write_str("composite"),
        }
    }
}

/// Frame counter and the scene upload cadence.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    frame: u64,
    scene_upload_interval: u32,
}

impl FrameScheduler {
    pub fn new(scene_upload_interval: u32) -> Self {
        Self {
            frame: 0,
            scene_upload_interval: scene_upload_interval.max(1),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn phases(&self) -> &'static [Phase] {
        &Phase::ALL
    }

    /// Whether the external scene is rendered and uploaded on `frame`.
    pub fn uploads_scene(&self, frame: u64) -> bool {
        frame % u64::from(self.scene_upload_interval) == 0
    }

    pub fn advance(&mut self) -> u64 {
        let current = self.frame;
        self.frame += 1;
        current
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SCENE_UPLOAD_INTERVAL)
    }
}
