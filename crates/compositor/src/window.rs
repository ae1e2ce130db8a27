//! Windowed presentation loop driving an [`Engine`] on a [`WgpuDevice`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowBuilder};

use crate::engine::{DeviceState, Engine, EngineConfig, FrameOutcome};
use crate::feeds::FrameInputs;
use crate::gpu::{GpuOptions, WgpuDevice};

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub engine: EngineConfig,
    pub gpu: GpuOptions,
    /// `None` renders as fast as presentation allows.
    pub target_fps: Option<f32>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "shaderdeck".to_owned(),
            engine: EngineConfig::default(),
            gpu: GpuOptions::default(),
            target_fps: None,
        }
    }
}

/// Application hooks called from the event loop.
pub trait Driver {
    /// Runs once after the engine is created.
    fn setup(&mut self, engine: &mut Engine<WgpuDevice>) -> Result<()>;

    /// Runs before every frame, e.g. to apply reloaded sources.
    fn before_frame(&mut self, engine: &mut Engine<WgpuDevice>);

    /// External scene and media for the coming frame.
    fn frame_inputs(&mut self) -> FrameInputs<'_> {
        FrameInputs::default()
    }
}

struct FramePacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FramePacer {
    fn new(target_fps: Option<f32>) -> Self {
        let interval = target_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f32(1.0 / fps));
        Self { interval, last: None }
    }

    fn ready_for_frame(&self, now: Instant) -> bool {
        match (self.interval, self.last) {
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
            _ => true,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        Some(self.last? + self.interval?)
    }

    fn mark_rendered(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Normalised, bottom-up cursor position.
fn normalise_cursor(position: PhysicalPosition<f64>, size: PhysicalSize<u32>) -> [f32; 2] {
    let width = f64::from(size.width.max(1));
    let height = f64::from(size.height.max(1));
    [
        (position.x / width).clamp(0.0, 1.0) as f32,
        (1.0 - position.y / height).clamp(0.0, 1.0) as f32,
    ]
}

/// The engine's surface borrows the window; fields drop in declaration order.
struct Session {
    engine: Engine<WgpuDevice>,
    window: Arc<Window>,
}

/// Opens a window and renders until it is closed or Escape is pressed.
pub fn run_window<D: Driver>(config: WindowConfig, mut driver: D) -> Result<()> {
    let event_loop = EventLoopBuilder::new()
        .build()
        .map_err(|err| anyhow!("failed to create event loop: {err}"))?;

    let size = PhysicalSize::new(config.engine.width, config.engine.height);
    let window = WindowBuilder::new()
        .with_title(config.title.clone())
        .with_inner_size(size)
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create window: {err}"))?;
    let window = Arc::new(window);

    let device = WgpuDevice::new(window.as_ref(), window.inner_size(), config.gpu)?;
    let mut engine = Engine::new(device, config.engine.clone())?;
    driver.setup(&mut engine)?;

    let mut pacer = FramePacer::new(config.target_fps);
    let mut last_state = engine.device_state();
    window.request_redraw();
    let mut session = Session { engine, window };

    let run_result = event_loop.run(move |event, elwt| {
        let Session { engine, window } = &mut session;
        match event {
            Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
                WindowEvent::CloseRequested | WindowEvent::Destroyed => elwt.exit(),
                WindowEvent::KeyboardInput { event, .. } => {
                    if event.state == ElementState::Pressed && matches!(event.logical_key, Key::Named(NamedKey::Escape)) {
                        elwt.exit();
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    engine.set_mouse(normalise_cursor(position, window.inner_size()));
                }
                WindowEvent::Resized(new_size) => engine.device_mut().resize(new_size),
                WindowEvent::RedrawRequested => {
                    let now = Instant::now();
                    driver.before_frame(engine);
                    match engine.render_frame(driver.frame_inputs()) {
                        Ok(FrameOutcome::Rendered) => pacer.mark_rendered(now),
                        Ok(FrameOutcome::Skipped) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "frame failed");
                            elwt.exit();
                        }
                    }
                    let state = engine.device_state();
                    if state != last_state {
                        tracing::info!(from = %last_state, to = %state, "device state changed");
                        last_state = state;
                    }
                }
                _ => {}
            },
            Event::AboutToWait => {
                let now = Instant::now();
                if last_state != DeviceState::Normal || pacer.ready_for_frame(now) {
                    window.request_redraw();
                    elwt.set_control_flow(ControlFlow::Wait);
                } else if let Some(deadline) = pacer.next_deadline() {
                    elwt.set_control_flow(ControlFlow::WaitUntil(deadline));
                } else {
                    elwt.set_control_flow(ControlFlow::Wait);
                }
            }
            _ => {}
        }
    });

    run_result.map_err(|err| anyhow!("window event loop error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_normalised_bottom_up() {
        let size = PhysicalSize::new(200, 100);
        assert_eq!(normalise_cursor(PhysicalPosition::new(50.0, 25.0), size), [0.25, 0.75]);
        assert_eq!(normalise_cursor(PhysicalPosition::new(-5.0, 500.0), size), [0.0, 0.0]);
    }

    #[test]
    fn pacer_waits_for_the_interval() {
        let mut pacer = FramePacer::new(Some(4.0));
        let start = Instant::now();
        assert!(pacer.ready_for_frame(start));
        pacer.mark_rendered(start);
        assert!(!pacer.ready_for_frame(start + Duration::from_millis(100)));
        assert!(pacer.ready_for_frame(start + Duration::from_millis(250)));
        assert_eq!(pacer.next_deadline(), Some(start + Duration::from_millis(250)));
    }

    #[test]
    fn uncapped_pacer_is_always_ready() {
        let pacer = FramePacer::new(None);
        assert!(pacer.ready_for_frame(Instant::now()));
        assert_eq!(pacer.next_deadline(), None);
        assert!(FramePacer::new(Some(0.0)).interval.is_none());
    }
}
