//! Seven-layer real-time shader compositor.
//!
//! Every layer runs an ISF-style fragment shader into its own offscreen
//! target; a generated compositor shader then blends the targets over a
//! background onto the window surface. The flow for one frame is:
//!
//! ```text
//!   audio / landmark feeds ──┐
//!                            ▼
//!   Engine::render_frame ──▶ layers 0..3 ──▶ partial composite ──▶ effects (4)
//!          │                                                          │
//!          │                 text (5), overlay (6) ◀──────────────────┘
//!          ▼                          │
//!   device-loss check                 └──▶ full composite ──▶ surface
//! ```
//!
//! All GPU work goes through the [`device::GpuDevice`] trait. The production
//! backend is [`gpu::WgpuDevice`]; [`window::run_window`] wires it to a winit
//! event loop.

pub mod composite;
pub mod device;
pub mod engine;
pub mod feeds;
pub mod frame;
pub mod gpu;
pub mod layer;
pub mod program;
pub mod render;
pub mod targets;
pub mod window;

#[cfg(test)]
mod testing;

pub use composite::{Background, OverlayTransform};
pub use device::{DeviceError, GpuDevice};
pub use engine::{AuxTexture, BackgroundFill, DeviceState, Engine, EngineConfig, EngineError, FrameOutcome};
pub use feeds::{
    AudioFeed, AudioSnapshot, Axis, FrameInputs, LandmarkBinding, LandmarkFeed, LandmarkFrame, LandmarkGroup, MediaFrame,
    MediaKind, MediaSource, PixelFrame, SceneSource,
};
pub use gpu::{GpuOptions, WgpuDevice};
pub use layer::{BlendMode, LayerError, LayerId, LayerStatus, LAYER_COUNT};
pub use program::CompileError;
pub use window::{run_window, Driver, WindowConfig};
