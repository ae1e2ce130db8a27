//! Offscreen render targets and the ping-pong pairs used for feedback.

use crate::device::{DeviceError, GpuDevice, TargetFormat, TargetId, TextureId};

/// Edge length of the throwaway target used to probe high-precision support.
const PROBE_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: TargetId,
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
}

/// Which half of a [`PingPongTarget`] is readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingPongPhase {
    #[default]
    ReadAWriteB,
    ReadBWriteA,
}

impl PingPongPhase {
    pub fn flipped(self) -> Self {
        match self {
            PingPongPhase::ReadAWriteB => PingPongPhase::ReadBWriteA,
            PingPongPhase::ReadBWriteA => PingPongPhase::ReadAWriteB,
        }
    }
}

/// Two targets alternated per frame so a pass can read its own previous
/// output while writing the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongTarget {
    a: RenderTarget,
    b: RenderTarget,
    phase: PingPongPhase,
}

impl PingPongTarget {
    pub fn phase(&self) -> PingPongPhase {
        self.phase
    }

    pub fn read(&self) -> &RenderTarget {
        match self.phase {
            PingPongPhase::ReadAWriteB => &self.a,
            PingPongPhase::ReadBWriteA => &self.b,
        }
    }

    pub fn write(&self) -> &RenderTarget {
        match self.phase {
            PingPongPhase::ReadAWriteB => &self.b,
            PingPongPhase::ReadBWriteA => &self.a,
        }
    }

    /// Makes the half just written readable.
    pub fn flip(&mut self) {
        self.phase = self.phase.flipped();
    }

    pub fn halves(&self) -> [&RenderTarget; 2] {
        [&self.a, &self.b]
    }
}

/// Allocates targets and remembers whether high-precision feedback
/// buffers work on the current device.
#[derive(Debug, Default)]
pub struct TargetPool {
    high_precision: Option<bool>,
}

impl TargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of the precision probe, once it has run.
    pub fn high_precision(&self) -> Option<bool> {
        self.high_precision
    }

    pub fn create_target<D: GpuDevice + ?Sized>(
        &self,
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<RenderTarget, DeviceError> {
        allocate(device, width, height, TargetFormat::Rgba8)
    }

    /// Allocates a feedback pair, in 16-bit float when the device supports
    /// rendering to it and 8-bit otherwise.
    pub fn create_ping_pong<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<PingPongTarget, DeviceError> {
        let format = self.feedback_format(device);
        let a = allocate(device, width, height, format)?;
        let b = match allocate(device, width, height, format) {
            Ok(target) => target,
            Err(err) => {
                device.destroy_target(a.id);
                return Err(err);
            }
        };
        Ok(PingPongTarget {
            a,
            b,
            phase: PingPongPhase::default(),
        })
    }

    pub fn destroy<D: GpuDevice + ?Sized>(&self, device: &mut D, target: &RenderTarget) {
        device.destroy_target(target.id);
    }

    pub fn destroy_ping_pong<D: GpuDevice + ?Sized>(&self, device: &mut D, target: &PingPongTarget) {
        for half in target.halves() {
            device.destroy_target(half.id);
        }
    }

    fn feedback_format<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> TargetFormat {
        let supported = *self.high_precision.get_or_insert_with(|| {
            match device.create_target(PROBE_SIZE, PROBE_SIZE, TargetFormat::Rgba16Float) {
                Ok(probe) => {
                    device.destroy_target(probe);
                    tracing::debug!("16-bit float feedback targets available");
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "16-bit float targets unavailable; feedback buffers fall back to 8-bit"
                    );
                    false
                }
            }
        });
        if supported {
            TargetFormat::Rgba16Float
        } else {
            TargetFormat::Rgba8
        }
    }
}

fn allocate<D: GpuDevice + ?Sized>(
    device: &mut D,
    width: u32,
    height: u32,
    format: TargetFormat,
) -> Result<RenderTarget, DeviceError> {
    let width = width.max(1);
    let height = height.max(1);
    let id = device.create_target(width, height, format)?;
    let texture = match device.target_texture(id) {
        Some(texture) => texture,
        None => {
            device.destroy_target(id);
            return Err(DeviceError::Incomplete {
                width,
                height,
                format,
            });
        }
    };
    Ok(RenderTarget {
        id,
        texture,
        width,
        height,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevice;

    #[test]
    fn ping_pong_halves_alternate() {
        let mut device = RecordingDevice::new();
        let mut pool = TargetPool::new();
        let mut pair = pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");

        let (first_read, first_write) = (pair.read().id, pair.write().id);
        assert_ne!(first_read, first_write);
        assert_eq!(pair.phase(), PingPongPhase::ReadAWriteB);

        pair.flip();
        assert_eq!(pair.read().id, first_write);
        assert_eq!(pair.write().id, first_read);
        pair.flip();
        assert_eq!(pair.read().id, first_read);
    }

    #[test]
    fn probes_precision_once_and_prefers_float() {
        let mut device = RecordingDevice::new();
        let mut pool = TargetPool::new();
        let pair = pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");
        pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");

        assert_eq!(pool.high_precision(), Some(true));
        assert_eq!(pair.read().format, TargetFormat::Rgba16Float);
        assert_eq!(device.float_probes(), 1);
    }

    #[test]
    fn falls_back_to_8bit_when_float_is_incomplete() {
        let mut device = RecordingDevice::new();
        device.disable_float_targets();
        let mut pool = TargetPool::new();

        let pair = pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");
        let again = pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");

        assert_eq!(pool.high_precision(), Some(false));
        assert_eq!(pair.write().format, TargetFormat::Rgba8);
        assert_eq!(again.read().format, TargetFormat::Rgba8);
        assert_eq!(device.float_probes(), 1);
    }

    #[test]
    fn destroy_releases_both_halves() {
        let mut device = RecordingDevice::new();
        let mut pool = TargetPool::new();
        let pair = pool.create_ping_pong(&mut device, 8, 8).expect("ping-pong");
        let single = pool.create_target(&mut device, 8, 8).expect("target");
        assert_eq!(device.live_targets(), 3);

        pool.destroy_ping_pong(&mut device, &pair);
        pool.destroy(&mut device, &single);
        assert_eq!(device.live_targets(), 0);
    }
}
