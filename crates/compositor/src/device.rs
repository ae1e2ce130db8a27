//! The GPU seam.
//!
//! Everything above this module talks to the GPU through [`GpuDevice`], a
//! small immediate-mode API shaped after program/texture/framebuffer style
//! drivers. [`crate::gpu::WgpuDevice`] is the production implementation; the
//! unit tests run the engine against a recording double.

use isf::UniformData;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// A compiled (unlinked) shader stage.
    StageId
);
handle!(
    /// A linked vertex + fragment program.
    ProgramId
);
handle!(
    /// An offscreen colour target.
    TargetId
);
handle!(
    /// A sampleable texture, either standalone or backing a target.
    TextureId
);
handle!(
    /// Device-assigned uniform slot inside one program.
    UniformLocation
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    /// 8 bits per channel, always available.
    Rgba8,
    /// 16-bit float per channel, used for feedback buffers when supported.
    Rgba16Float,
}

/// Value written to a uniform location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Uniform {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// `None` binds a neutral transparent texture.
    Texture(Option<TextureId>),
}

impl From<UniformData> for Uniform {
    fn from(value: UniformData) -> Self {
        match value {
            UniformData::Float(v) => Uniform::Float(v),
            UniformData::Int(v) => Uniform::Int(v),
            UniformData::Vec2(v) => Uniform::Vec2(v),
            UniformData::Vec3(v) => Uniform::Vec3(v),
            UniformData::Vec4(v) => Uniform::Vec4(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutput {
    Target(TargetId),
    /// The presentable surface acquired by [`GpuDevice::begin_frame`].
    Surface,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadAction {
    Clear([f32; 4]),
    Load,
}

pub const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];
pub const OPAQUE_BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("render target {width}x{height} with format {format:?} is incomplete")]
    Incomplete {
        width: u32,
        height: u32,
        format: TargetFormat,
    },
    #[error("GPU device lost")]
    Lost,
    #[error("surface unavailable: {0}")]
    Surface(String),
    #[error("{0}")]
    Backend(String),
}

pub trait GpuDevice {
    /// Compiles one stage. `Err` carries the compiler log, one
    /// `ERROR: 0:<line>: <message>` entry per line.
    fn compile_stage(&mut self, stage: ShaderStage, source: &str) -> Result<StageId, String>;
    /// Links two compiled stages. `Err` carries the linker log.
    fn link_program(&mut self, vertex: StageId, fragment: StageId) -> Result<ProgramId, String>;
    fn release_stage(&mut self, stage: StageId);
    fn destroy_program(&mut self, program: ProgramId);

    /// `None` when the program does not declare `name`.
    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation>;
    fn set_uniform(&mut self, program: ProgramId, location: UniformLocation, value: Uniform);

    fn create_target(
        &mut self,
        width: u32,
        height: u32,
        format: TargetFormat,
    ) -> Result<TargetId, DeviceError>;
    fn destroy_target(&mut self, target: TargetId);
    fn target_texture(&self, target: TargetId) -> Option<TextureId>;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError>;
    /// Replaces the contents of `texture` with tightly packed RGBA8 rows,
    /// first row at the top. The texture is resized when dimensions differ.
    fn upload_texture(&mut self, texture: TextureId, width: u32, height: u32, rgba: &[u8]);
    fn destroy_texture(&mut self, texture: TextureId);

    fn begin_frame(&mut self) -> Result<(), DeviceError>;
    /// Draws a full-screen triangle with `program` into `output`.
    fn draw(&mut self, program: ProgramId, output: RenderOutput, load: LoadAction);
    fn end_frame(&mut self);

    fn is_lost(&self) -> bool;
    /// Attempts to bring a lost device back. Every handle issued before the
    /// loss is invalid afterwards.
    fn try_restore(&mut self) -> Result<bool, DeviceError>;
}
