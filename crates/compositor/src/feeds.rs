//! External inputs consumed by the renderer.
//!
//! Audio and landmark producers run on their own threads and publish
//! immutable snapshots over a channel; the render thread drains to the most
//! recent one at frame start. A missing or stale feed reads as neutral.
//! Scene and media providers are polled synchronously on the render thread.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Spectrum bins expected from the audio analyser.
pub const SPECTRUM_BINS: usize = 128;

/// Band levels in `0..1`. The default is silence.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioLevels {
    pub level: f32,
    pub bass: f32,
    pub mid: f32,
    pub high: f32,
}

impl AudioLevels {
    /// Band split: RMS over every bin, bass 0..=15, mid 16..=80, high 81..
    pub fn from_spectrum(bins: &[u8]) -> Self {
        if bins.is_empty() {
            return Self::default();
        }
        let rms = (bins.iter().map(|&b| (b as f32) * (b as f32)).sum::<f32>() / bins.len() as f32)
            .sqrt()
            / 255.0;
        let band = |range: std::ops::Range<usize>| {
            let end = range.end.min(bins.len());
            let start = range.start.min(end);
            if start == end {
                return 0.0;
            }
            bins[start..end].iter().map(|&b| b as f32).sum::<f32>() / ((end - start) as f32 * 255.0)
        };
        Self {
            level: rms,
            bass: band(0..16),
            mid: band(16..81),
            high: band(81..bins.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioSnapshot {
    pub levels: AudioLevels,
    /// Byte magnitudes, uploaded as a one-row texture.
    pub spectrum: Option<Arc<[u8]>>,
    pub captured_at: Instant,
}

impl AudioSnapshot {
    pub fn from_spectrum(bins: Vec<u8>) -> Self {
        Self {
            levels: AudioLevels::from_spectrum(&bins),
            spectrum: Some(bins.into()),
            captured_at: Instant::now(),
        }
    }
}

/// Latest-value view over a producer channel.
#[derive(Debug)]
pub struct SnapshotFeed<T> {
    rx: Receiver<T>,
    latest: Option<T>,
    stale_after: Duration,
}

pub trait Timestamped {
    fn captured_at(&self) -> Instant;
}

impl Timestamped for AudioSnapshot {
    fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl<T: Timestamped> SnapshotFeed<T> {
    pub fn channel(stale_after: Duration) -> (Sender<T>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            tx,
            Self {
                rx,
                latest: None,
                stale_after,
            },
        )
    }

    /// Drains pending snapshots and returns the newest one that is still fresh.
    pub fn poll(&mut self, now: Instant) -> Option<&T> {
        if let Some(newest) = self.rx.try_iter().last() {
            self.latest = Some(newest);
        }
        self.latest
            .as_ref()
            .filter(|snapshot| now.saturating_duration_since(snapshot.captured_at()) <= self.stale_after)
    }
}

pub type AudioFeed = SnapshotFeed<AudioSnapshot>;
pub type LandmarkFeed = SnapshotFeed<LandmarkFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandmarkGroup {
    Hand,
    Face,
    Pose,
}

impl FromStr for LandmarkGroup {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hand" => Ok(LandmarkGroup::Hand),
            "face" => Ok(LandmarkGroup::Face),
            "pose" | "body" => Ok(LandmarkGroup::Pose),
            other => Err(format!("unknown landmark group '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            other => Err(format!("unknown axis '{other}'")),
        }
    }
}

/// Normalised point, `y = 1` at the top of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub fn axis(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// One tracker update. Empty groups are inactive.
#[derive(Debug, Clone)]
pub struct LandmarkFrame {
    pub hand: Vec<Landmark>,
    pub face: Vec<Landmark>,
    pub pose: Vec<Landmark>,
    pub hand_count: u32,
    pub captured_at: Instant,
}

impl Timestamped for LandmarkFrame {
    fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// Landmark used as the hand position.
pub const PALM_CENTER: usize = 9;

impl LandmarkFrame {
    pub fn point(&self, group: LandmarkGroup, index: usize) -> Option<Landmark> {
        let points = match group {
            LandmarkGroup::Hand => &self.hand,
            LandmarkGroup::Face => &self.face,
            LandmarkGroup::Pose => &self.pose,
        };
        points.get(index).copied()
    }

    pub fn hand_position(&self) -> Option<Landmark> {
        if self.hand_count == 0 {
            return None;
        }
        self.point(LandmarkGroup::Hand, PALM_CENTER)
    }
}

/// Maps a tracked coordinate onto a declared input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandmarkBinding {
    pub input: String,
    pub group: LandmarkGroup,
    pub index: usize,
    pub axis: Axis,
}

const HAND_PARTS: &[(&str, usize)] = &[
    ("Wrist", 0),
    ("Thumb Tip", 4),
    ("Index Tip", 8),
    ("Middle Tip", 12),
    ("Ring Tip", 16),
    ("Pinky Tip", 20),
    ("Palm Center", PALM_CENTER),
];

const FACE_PARTS: &[(&str, usize)] = &[
    ("Nose Tip", 1),
    ("Left Eye", 33),
    ("Right Eye", 263),
    ("Mouth Center", 13),
    ("Chin", 152),
    ("Forehead", 10),
    ("Left Ear", 234),
    ("Right Ear", 454),
    ("Left Eyebrow", 70),
    ("Right Eyebrow", 300),
    ("Upper Lip", 0),
    ("Lower Lip", 17),
    ("Left Cheek", 123),
    ("Right Cheek", 352),
    ("Nose Bridge", 6),
];

const POSE_PARTS: &[(&str, usize)] = &[
    ("Nose", 0),
    ("Left Eye Inner", 1),
    ("Left Eye", 2),
    ("Left Eye Outer", 3),
    ("Right Eye Inner", 4),
    ("Right Eye", 5),
    ("Right Eye Outer", 6),
    ("Left Ear", 7),
    ("Right Ear", 8),
    ("Left Shoulder", 11),
    ("Right Shoulder", 12),
    ("Left Elbow", 13),
    ("Right Elbow", 14),
    ("Left Wrist", 15),
    ("Right Wrist", 16),
    ("Left Pinky", 17),
    ("Right Pinky", 18),
    ("Left Index", 19),
    ("Right Index", 20),
    ("Left Thumb", 21),
    ("Right Thumb", 22),
    ("Left Hip", 23),
    ("Right Hip", 24),
    ("Left Knee", 25),
    ("Right Knee", 26),
    ("Left Ankle", 27),
    ("Right Ankle", 28),
    ("Left Heel", 29),
    ("Right Heel", 30),
    ("Left Foot Index", 31),
    ("Right Foot Index", 32),
];

pub fn body_parts(group: LandmarkGroup) -> &'static [(&'static str, usize)] {
    match group {
        LandmarkGroup::Hand => HAND_PARTS,
        LandmarkGroup::Face => FACE_PARTS,
        LandmarkGroup::Pose => POSE_PARTS,
    }
}

/// Looks up a named body part (case-insensitive).
pub fn body_part(group: LandmarkGroup, name: &str) -> Option<usize> {
    body_parts(group)
        .iter()
        .find(|(part, _)| part.eq_ignore_ascii_case(name.trim()))
        .map(|(_, index)| *index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// RGBA8 pixels, rows top to bottom.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
    /// Changes whenever the pixels change.
    pub serial: u64,
}

pub trait MediaSource {
    fn ids(&self) -> Vec<String>;
    fn frame(&self, id: &str) -> Option<MediaFrame>;
}

/// Borrowed RGBA8 frame, rows top to bottom.
#[derive(Debug, Clone, Copy)]
pub struct PixelFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

/// Externally rendered 3D scene.
pub trait SceneSource {
    fn render(&mut self);
    fn frame(&self) -> Option<PixelFrame<'_>>;
}

/// Providers polled on the render thread for one frame.
#[derive(Default)]
pub struct FrameInputs<'a> {
    pub scene: Option<&'a mut dyn SceneSource>,
    pub media: Option<&'a dyn MediaSource>,
}
