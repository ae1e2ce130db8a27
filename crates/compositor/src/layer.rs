//! The seven fixed layer slots and the state each one owns.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use isf::{InputDecl, InputKind, InputValue, MetadataError, PassDescriptor, VERTEX_SHADER};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, GpuDevice, ProgramId, TextureId};
use crate::feeds::{LandmarkBinding, MediaKind};
use crate::program::{self, CompileError, ProgramSlot};
use crate::targets::{PingPongTarget, RenderTarget, TargetPool};

pub const LAYER_COUNT: usize = 7;

/// Layer identity, bottom to top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerId {
    Background,
    Media,
    /// Externally rendered 3D scene.
    #[serde(rename = "3d", alias = "scene")]
    Scene,
    Av,
    /// Receives a partial composite of the four layers beneath it.
    Effects,
    Text,
    /// Topmost slot; the only one the overlay transform applies to.
    Overlay,
}

impl LayerId {
    pub const ALL: [LayerId; LAYER_COUNT] = [
        LayerId::Background,
        LayerId::Media,
        LayerId::Scene,
        LayerId::Av,
        LayerId::Effects,
        LayerId::Text,
        LayerId::Overlay,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerId::Background => "background",
            LayerId::Media => "media",
            LayerId::Scene => "3d",
            LayerId::Av => "av",
            LayerId::Effects => "effects",
            LayerId::Text => "text",
            LayerId::Overlay => "overlay",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        if wanted == "scene" {
            return Ok(LayerId::Scene);
        }
        LayerId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| format!("unknown layer '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
    Overlay,
}

impl BlendMode {
    /// Value of the compositor's `blendMode<i>` uniform.
    pub fn code(self) -> f32 {
        match self {
            BlendMode::Normal => 0.0,
            BlendMode::Add => 1.0,
            BlendMode::Multiply => 2.0,
            BlendMode::Screen => 3.0,
            BlendMode::Overlay => 4.0,
        }
    }
}

impl FromStr for BlendMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(BlendMode::Normal),
            "add" => Ok(BlendMode::Add),
            "multiply" => Ok(BlendMode::Multiply),
            "screen" => Ok(BlendMode::Screen),
            "overlay" => Ok(BlendMode::Overlay),
            other => Err(format!("unknown blend mode '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("layer does not declare an input named '{0}'")]
    UnknownInput(String),
    #[error("input '{name}' is a {expected} input, got {found}")]
    InputKind {
        name: String,
        expected: InputKind,
        found: InputKind,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Where a pass draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutput {
    /// The final pass writes the layer's primary target.
    Primary,
    /// Transient named pass, cleared before every draw.
    Single(RenderTarget),
    /// Persistent named pass, double-buffered for one-frame feedback.
    PingPong(PingPongTarget),
}

#[derive(Debug, Clone)]
pub struct PassState {
    pub descriptor: PassDescriptor,
    pub output: PassOutput,
    pub width: u32,
    pub height: u32,
}

impl PassState {
    /// Texture other passes sample under this pass's name.
    pub fn readable(&self) -> Option<TextureId> {
        match &self.output {
            PassOutput::Primary => None,
            PassOutput::Single(target) => Some(target.texture),
            PassOutput::PingPong(pair) => Some(pair.read().texture),
        }
    }
}

/// External media bound to an image input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub media_id: String,
    pub kind: MediaKind,
    /// `None` until uploaded, and again after device loss.
    pub texture: Option<TextureId>,
    pub serial: Option<u64>,
}

impl TextureBinding {
    pub fn new(media_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            media_id: media_id.into(),
            kind,
            texture: None,
            serial: None,
        }
    }
}

/// Snapshot reported to editors and remote controllers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatus {
    pub id: LayerId,
    pub compiled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub visible: bool,
    pub opacity: f32,
    pub blend: BlendMode,
    pub passes: usize,
}

#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    pub(crate) visible: bool,
    pub(crate) opacity: f32,
    pub(crate) blend: BlendMode,
    pub(crate) transparent_bg: bool,
    pub(crate) hand_as_mouse: bool,
    pub(crate) flip_h: bool,
    pub(crate) flip_v: bool,
    pub(crate) program: ProgramSlot,
    pub(crate) target: Option<RenderTarget>,
    pub(crate) passes: Vec<PassState>,
    inputs: Vec<InputDecl>,
    pub(crate) values: BTreeMap<String, InputValue>,
    pub(crate) textures: BTreeMap<String, TextureBinding>,
    pub(crate) landmarks: Vec<LandmarkBinding>,
    texture_names: Vec<String>,
    description: Option<String>,
    source: Option<String>,
    last_error: Option<String>,
}

impl Layer {
    pub fn new(id: LayerId) -> Self {
        Self {
            id,
            visible: true,
            opacity: 1.0,
            blend: BlendMode::Normal,
            transparent_bg: matches!(id, LayerId::Text | LayerId::Overlay),
            hand_as_mouse: false,
            flip_h: false,
            flip_v: false,
            program: ProgramSlot::new(),
            target: None,
            passes: Vec::new(),
            inputs: Vec::new(),
            values: BTreeMap::new(),
            textures: BTreeMap::new(),
            landmarks: Vec::new(),
            texture_names: Vec::new(),
            description: None,
            source: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    pub fn is_compiled(&self) -> bool {
        self.program.is_compiled()
    }

    pub fn program_id(&self) -> Option<ProgramId> {
        self.program.id()
    }

    pub fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    pub fn passes(&self) -> &[PassState] {
        &self.passes
    }

    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|input| input.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&InputValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, InputValue> {
        &self.values
    }

    pub fn texture_names(&self) -> &[String] {
        &self.texture_names
    }

    /// Last source that compiled.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> LayerStatus {
        LayerStatus {
            id: self.id,
            compiled: self.is_compiled(),
            error: self.last_error.clone(),
            description: self.description.clone(),
            visible: self.visible,
            opacity: self.opacity,
            blend: self.blend,
            passes: self.passes.len(),
        }
    }

    /// Allocates the primary target if the layer has none yet.
    pub fn ensure_target<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &mut TargetPool,
        width: u32,
        height: u32,
    ) -> Result<RenderTarget, DeviceError> {
        if let Some(target) = self.target {
            return Ok(target);
        }
        let target = pool.create_target(device, width, height)?;
        self.target = Some(target);
        Ok(target)
    }

    /// Rebuilds, recompiles and reallocates the layer for `text`.
    ///
    /// On any failure the previous program, pass targets and values stay in
    /// place and the error is kept for [`Layer::status`].
    pub fn set_source<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &mut TargetPool,
        width: u32,
        height: u32,
        text: &str,
    ) -> Result<(), LayerError> {
        let result = self.try_set_source(device, pool, width, height, text);
        match &result {
            Ok(()) => {
                self.last_error = None;
                tracing::info!(
                    layer = %self.id,
                    inputs = self.inputs.len(),
                    passes = self.passes.len(),
                    "layer compiled"
                );
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                tracing::warn!(layer = %self.id, error = %err, "layer source rejected; keeping previous program");
            }
        }
        result
    }

    fn try_set_source<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &mut TargetPool,
        width: u32,
        height: u32,
        text: &str,
    ) -> Result<(), LayerError> {
        let built = isf::build(text)?;
        self.ensure_target(device, pool, width, height)?;
        let program = program::compile(device, VERTEX_SHADER, &built.source, built.header_line_count)?;

        let passes = match allocate_passes(device, pool, &built.passes, width, height) {
            Ok(passes) => passes,
            Err(err) => {
                device.destroy_program(program);
                return Err(err.into());
            }
        };

        release_passes(device, pool, &self.passes);
        self.passes = passes;
        self.program.install(device, program);

        let previous = std::mem::take(&mut self.values);
        self.values = built
            .inputs
            .iter()
            .filter_map(|decl| {
                let value = previous
                    .get(&decl.name)
                    .and_then(|value| value.carry_over(decl))
                    .or_else(|| InputValue::default_for(decl))?;
                Some((decl.name.clone(), value))
            })
            .collect();

        let mut stale = Vec::new();
        self.textures.retain(|name, binding| {
            let keep = built
                .inputs
                .iter()
                .any(|decl| decl.name == *name && decl.kind == InputKind::Image);
            if !keep {
                stale.extend(binding.texture);
            }
            keep
        });
        for texture in stale {
            device.destroy_texture(texture);
        }
        self.landmarks.retain(|binding| {
            built
                .inputs
                .iter()
                .any(|decl| decl.name == binding.input && matches!(decl.kind, InputKind::Float | InputKind::Long))
        });

        self.texture_names = built.texture_names();
        self.description = built.description;
        self.inputs = built.inputs;
        self.source = Some(text.to_owned());
        Ok(())
    }

    /// Updates one declared input. Text is refitted to the declared length.
    pub fn set_input(&mut self, name: &str, value: InputValue) -> Result<(), LayerError> {
        let decl = self
            .input(name)
            .ok_or_else(|| LayerError::UnknownInput(name.to_owned()))?;
        let value = value.carry_over(decl).ok_or_else(|| LayerError::InputKind {
            name: name.to_owned(),
            expected: decl.kind,
            found: value.kind(),
        })?;
        self.values.insert(name.to_owned(), value);
        Ok(())
    }

    pub fn bind_landmark(&mut self, binding: LandmarkBinding) -> Result<(), LayerError> {
        let decl = self
            .input(&binding.input)
            .ok_or_else(|| LayerError::UnknownInput(binding.input.clone()))?;
        if !matches!(decl.kind, InputKind::Float | InputKind::Long) {
            return Err(LayerError::InputKind {
                name: binding.input,
                expected: InputKind::Float,
                found: decl.kind,
            });
        }
        self.landmarks.retain(|existing| existing.input != binding.input);
        self.landmarks.push(binding);
        Ok(())
    }

    /// Attaches media to an image input. The previous texture, if any, is
    /// returned for the caller to destroy.
    pub fn bind_texture(&mut self, name: &str, binding: TextureBinding) -> Result<Option<TextureId>, LayerError> {
        let decl = self
            .input(name)
            .ok_or_else(|| LayerError::UnknownInput(name.to_owned()))?;
        if decl.kind != InputKind::Image {
            return Err(LayerError::InputKind {
                name: name.to_owned(),
                expected: InputKind::Image,
                found: decl.kind,
            });
        }
        Ok(self
            .textures
            .insert(name.to_owned(), binding)
            .and_then(|old| old.texture))
    }

    /// Image inputs with nothing bound, in declaration order.
    pub fn unbound_images(&self) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|decl| decl.kind == InputKind::Image && !self.textures.contains_key(&decl.name))
            .map(|decl| decl.name.clone())
            .collect()
    }

    /// Destroys every GPU object the layer owns.
    pub fn release_gpu<D: GpuDevice + ?Sized>(&mut self, device: &mut D, pool: &mut TargetPool) {
        self.program.release(device);
        release_passes(device, pool, &self.passes);
        self.passes.clear();
        if let Some(target) = self.target.take() {
            pool.destroy(device, &target);
        }
        for binding in self.textures.values_mut() {
            if let Some(texture) = binding.texture.take() {
                device.destroy_texture(texture);
            }
            binding.serial = None;
        }
    }

    /// Drops every GPU handle without touching the device; sources, values
    /// and bindings survive.
    pub fn forget_gpu(&mut self) {
        self.program.forget();
        self.passes.clear();
        self.target = None;
        for binding in self.textures.values_mut() {
            binding.texture = None;
            binding.serial = None;
        }
    }

    /// Recreates GPU state from the retained source after device loss.
    pub fn restore<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &mut TargetPool,
        width: u32,
        height: u32,
    ) -> Result<(), LayerError> {
        self.ensure_target(device, pool, width, height)?;
        match self.source.clone() {
            Some(source) => self.set_source(device, pool, width, height, &source),
            None => Ok(()),
        }
    }
}

fn allocate_passes<D: GpuDevice + ?Sized>(
    device: &mut D,
    pool: &mut TargetPool,
    descriptors: &[PassDescriptor],
    width: u32,
    height: u32,
) -> Result<Vec<PassState>, DeviceError> {
    let mut passes: Vec<PassState> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let (pass_width, pass_height) = if descriptor.is_final() {
            (width, height)
        } else {
            descriptor.resolve_size(width, height)
        };
        let output = if descriptor.is_final() {
            Ok(PassOutput::Primary)
        } else if descriptor.persistent {
            pool.create_ping_pong(device, pass_width, pass_height)
                .map(PassOutput::PingPong)
        } else {
            pool.create_target(device, pass_width, pass_height)
                .map(PassOutput::Single)
        };
        match output {
            Ok(output) => passes.push(PassState {
                descriptor: descriptor.clone(),
                output,
                width: pass_width,
                height: pass_height,
            }),
            Err(err) => {
                release_passes(device, pool, &passes);
                return Err(err);
            }
        }
    }
    Ok(passes)
}

fn release_passes<D: GpuDevice + ?Sized>(device: &mut D, pool: &mut TargetPool, passes: &[PassState]) {
    for pass in passes {
        match &pass.output {
            PassOutput::Primary => {}
            PassOutput::Single(target) => pool.destroy(device, target),
            PassOutput::PingPong(pair) => pool.destroy_ping_pong(device, pair),
        }
    }
}
