//! The engine: seven layers, the compositor, feeds and the device-loss
//! state machine, driven one frame at a time from the render thread.

use std::fmt;
use std::time::{Duration, Instant};

use isf::{InputDecl, InputValue};
use serde::Serialize;

use crate::composite::{Background, Compositor, CompositorUniformSet, OverlayTransform, SlotUniforms};
use crate::device::{DeviceError, GpuDevice, TextureId};
use crate::feeds::{AudioFeed, AudioLevels, FrameInputs, LandmarkBinding, LandmarkFeed, LandmarkFrame, MediaKind, MediaSource};
use crate::frame::{FrameScheduler, Phase, DEFAULT_SCENE_UPLOAD_INTERVAL};
use crate::layer::{BlendMode, Layer, LayerError, LayerId, LayerStatus, TextureBinding, LAYER_COUNT};
use crate::program::CompileError;
use crate::render::{self, FrameEnvironment};
use crate::targets::{RenderTarget, TargetPool};

/// Layers composited beneath the effects layer's input image.
const PARTIAL_SLOTS: usize = LayerId::Effects as usize;
const MOUSE_DELTA_SCALE: f32 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Resolution of every layer and pass target.
    pub width: u32,
    pub height: u32,
    pub scene_upload_interval: u32,
    pub audio_stale_after: Duration,
    pub landmark_stale_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            scene_upload_interval: DEFAULT_SCENE_UPLOAD_INTERVAL,
            audio_stale_after: Duration::from_millis(250),
            landmark_stale_after: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Normal,
    Lost,
    Recovering,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Normal => "normal",
            DeviceState::Lost => "lost",
            DeviceState::Recovering => "recovering",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered,
    /// Nothing was presented, typically while the device is lost.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to build the compositor shader: {0}")]
    Compositor(#[from] CompileError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

/// Text-rendering textures shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxTexture {
    VarFont,
    FontAtlas,
}

/// What the compositor draws beneath slot 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BackgroundFill {
    #[default]
    None,
    Transparent,
    Color([f32; 3]),
    /// Media id resolved through the frame's [`MediaSource`].
    Media(String),
}

#[derive(Debug)]
struct AuxImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    texture: Option<TextureId>,
}

pub struct Engine<D: GpuDevice> {
    device: D,
    config: EngineConfig,
    state: DeviceState,
    pool: TargetPool,
    compositor: Compositor,
    layers: Vec<Layer>,
    scratch: Option<RenderTarget>,
    scheduler: FrameScheduler,
    started: Instant,
    mouse: [f32; 2],
    last_mouse: [f32; 2],
    overlay: OverlayTransform,
    background: BackgroundFill,
    background_binding: Option<TextureBinding>,
    audio: Option<AudioFeed>,
    audio_texture: Option<TextureId>,
    landmarks: Option<LandmarkFeed>,
    scene_texture: Option<TextureId>,
    aux: [Option<AuxImage>; 2],
    stats: FrameStats,
}

#[derive(Debug)]
struct FrameStats {
    window_start: Instant,
    frames: u32,
}

impl<D: GpuDevice> Engine<D> {
    /// Builds the compositor, scratch target and one primary target per
    /// layer. Failure here is the only fatal engine error.
    pub fn new(mut device: D, config: EngineConfig) -> Result<Self, EngineError> {
        let mut pool = TargetPool::new();
        let compositor = Compositor::new(&mut device, LAYER_COUNT)?;
        let scratch = pool.create_target(&mut device, config.width, config.height)?;
        let mut layers: Vec<Layer> = LayerId::ALL.into_iter().map(Layer::new).collect();
        for layer in &mut layers {
            layer.ensure_target(&mut device, &mut pool, config.width, config.height)?;
        }
        tracing::info!(width = config.width, height = config.height, "engine ready");

        Ok(Self {
            device,
            scheduler: FrameScheduler::new(config.scene_upload_interval),
            config,
            state: DeviceState::Normal,
            pool,
            compositor,
            layers,
            scratch: Some(scratch),
            started: Instant::now(),
            mouse: [0.5, 0.5],
            last_mouse: [0.5, 0.5],
            overlay: OverlayTransform::IDENTITY,
            background: BackgroundFill::None,
            background_binding: None,
            audio: None,
            audio_texture: None,
            landmarks: None,
            scene_texture: None,
            aux: [None, None],
            stats: FrameStats {
                window_start: Instant::now(),
                frames: 0,
            },
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.index()]
    }

    fn layer_mut(&mut self, id: LayerId) -> &mut Layer {
        &mut self.layers[id.index()]
    }

    /// Full composites presented so far.
    pub fn frame_index(&self) -> u64 {
        self.compositor.frame_index()
    }

    pub fn status(&self, id: LayerId) -> LayerStatus {
        self.layer(id).status()
    }

    /// Declared inputs of the layer's current program.
    pub fn inputs(&self, id: LayerId) -> &[InputDecl] {
        self.layer(id).inputs()
    }

    pub fn values(&self, id: LayerId) -> impl Iterator<Item = (&str, &InputValue)> {
        self.layer(id).values().iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Primary target texture, for readback or streaming.
    pub fn layer_texture(&self, id: LayerId) -> Option<TextureId> {
        self.layer(id).target().map(|target| target.texture)
    }

    pub fn set_source(&mut self, id: LayerId, text: &str) -> Result<(), LayerError> {
        if self.state != DeviceState::Normal {
            return Err(LayerError::Device(DeviceError::Lost));
        }
        let (width, height) = (self.config.width, self.config.height);
        let layer = &mut self.layers[id.index()];
        layer.set_source(&mut self.device, &mut self.pool, width, height, text)
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) {
        self.layer_mut(id).visible = visible;
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) {
        self.layer_mut(id).opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn set_blend(&mut self, id: LayerId, blend: BlendMode) {
        self.layer_mut(id).blend = blend;
    }

    pub fn set_transparent_bg(&mut self, id: LayerId, transparent: bool) {
        self.layer_mut(id).transparent_bg = transparent;
    }

    pub fn set_hand_as_mouse(&mut self, id: LayerId, enabled: bool) {
        self.layer_mut(id).hand_as_mouse = enabled;
    }

    pub fn set_input(&mut self, id: LayerId, name: &str, value: InputValue) -> Result<(), LayerError> {
        self.layer_mut(id).set_input(name, value)
    }

    pub fn bind_landmark(&mut self, id: LayerId, binding: LandmarkBinding) -> Result<(), LayerError> {
        self.layer_mut(id).bind_landmark(binding)
    }

    /// Binds `media_id` to an image input and uploads it right away.
    pub fn bind_media(
        &mut self,
        id: LayerId,
        input: &str,
        media_id: &str,
        media: &dyn MediaSource,
    ) -> Result<(), LayerError> {
        let kind = media.frame(media_id).map_or(MediaKind::Image, |frame| frame.kind);
        let layer = &mut self.layers[id.index()];
        if let Some(old) = layer.bind_texture(input, TextureBinding::new(media_id, kind))? {
            self.device.destroy_texture(old);
        }
        if self.state == DeviceState::Normal {
            if let Some(binding) = layer.textures.get_mut(input) {
                render::refresh_binding(&mut self.device, binding, media)?;
            }
        }
        Ok(())
    }

    /// Assigns media ids to unbound image inputs in declaration order,
    /// skipping ids already bound on the layer. Returns the pairs bound.
    pub fn auto_bind_media(&mut self, id: LayerId, media: &dyn MediaSource) -> Vec<(String, String)> {
        let layer = self.layer(id);
        let used: Vec<String> = layer.textures.values().map(|binding| binding.media_id.clone()).collect();
        let pairs: Vec<(String, String)> = layer
            .unbound_images()
            .into_iter()
            .zip(media.ids().into_iter().filter(|media_id| !used.contains(media_id)))
            .collect();

        let mut bound = Vec::new();
        for (input, media_id) in pairs {
            match self.bind_media(id, &input, &media_id, media) {
                Ok(()) => bound.push((input, media_id)),
                Err(err) => tracing::warn!(layer = %id, input = %input, error = %err, "auto-bind failed"),
            }
        }
        bound
    }

    /// Flips applied to the scene layer in the full composite.
    pub fn set_scene_flip(&mut self, flip_h: bool, flip_v: bool) {
        let scene = self.layer_mut(LayerId::Scene);
        scene.flip_h = flip_h;
        scene.flip_v = flip_v;
    }

    pub fn set_overlay_transform(&mut self, transform: OverlayTransform) {
        self.overlay = transform;
    }

    pub fn set_background(&mut self, background: BackgroundFill) {
        if let Some(texture) = self.background_binding.take().and_then(|binding| binding.texture) {
            self.device.destroy_texture(texture);
        }
        if let BackgroundFill::Media(media_id) = &background {
            self.background_binding = Some(TextureBinding::new(media_id.clone(), MediaKind::Image));
        }
        self.background = background;
    }

    /// Installs one of the text-rendering textures (RGBA8, rows top first).
    /// The pixels are kept so the texture survives device loss.
    pub fn set_aux_texture(
        &mut self,
        kind: AuxTexture,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<(), EngineError> {
        let slot = aux_slot(kind);
        let existing = self.aux[slot].as_ref().and_then(|image| image.texture);
        let mut image = AuxImage {
            width,
            height,
            pixels,
            texture: existing,
        };
        if self.state == DeviceState::Normal {
            upload_aux(&mut self.device, &mut image)?;
        }
        self.aux[slot] = Some(image);
        Ok(())
    }

    pub fn set_mouse(&mut self, position: [f32; 2]) {
        self.mouse = position;
    }

    pub fn attach_audio(&mut self, feed: AudioFeed) {
        self.audio = Some(feed);
    }

    pub fn attach_landmarks(&mut self, feed: LandmarkFeed) {
        self.landmarks = Some(feed);
    }

    /// Runs one frame: recovery if needed, then the nine phases.
    pub fn render_frame(&mut self, mut inputs: FrameInputs<'_>) -> Result<FrameOutcome, EngineError> {
        if self.state == DeviceState::Normal && self.device.is_lost() {
            self.enter_lost();
        }
        if self.state != DeviceState::Normal {
            match self.device.try_restore() {
                Ok(true) => {
                    if !self.recover()? {
                        return Ok(FrameOutcome::Skipped);
                    }
                }
                Ok(false) => return Ok(FrameOutcome::Skipped),
                Err(err) => {
                    tracing::warn!(error = %err, "device restore attempt failed");
                    return Ok(FrameOutcome::Skipped);
                }
            }
        }

        match self.device.begin_frame() {
            Ok(()) => {}
            Err(DeviceError::Lost) => {
                self.enter_lost();
                return Ok(FrameOutcome::Skipped);
            }
            Err(DeviceError::Surface(reason)) => {
                tracing::debug!(%reason, "surface not ready; skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        }

        let now = Instant::now();
        let frame = self.scheduler.advance();
        let audio = self.poll_audio(now);
        let landmarks: Option<LandmarkFrame> = self
            .landmarks
            .as_mut()
            .and_then(|feed| feed.poll(now).cloned());
        let mouse_delta = [
            (self.mouse[0] - self.last_mouse[0]) * MOUSE_DELTA_SCALE,
            (self.mouse[1] - self.last_mouse[1]) * MOUSE_DELTA_SCALE,
        ];
        self.last_mouse = self.mouse;

        let env = FrameEnvironment {
            time: now.saturating_duration_since(self.started).as_secs_f32(),
            frame: frame as u32,
            mouse: self.mouse,
            mouse_delta,
            audio,
            audio_texture: self.audio_texture,
            landmarks: landmarks.as_ref(),
            var_font: self.aux[aux_slot(AuxTexture::VarFont)].as_ref().and_then(|image| image.texture),
            font_atlas: self.aux[aux_slot(AuxTexture::FontAtlas)].as_ref().and_then(|image| image.texture),
        };

        self.refresh_background(inputs.media);
        let mut scene_active = false;
        for phase in self.scheduler.phases() {
            tracing::trace!(%phase, frame, "phase");
            match *phase {
                Phase::Layer(LayerId::Scene) if inputs.scene.is_some() => {
                    scene_active = self.run_scene(frame, &mut inputs);
                }
                Phase::Layer(id) => {
                    let input_image = match id {
                        LayerId::Effects => self.scratch.map(|target| target.texture),
                        _ => None,
                    };
                    render::render_layer(
                        &mut self.device,
                        &mut self.layers[id.index()],
                        &env,
                        input_image,
                        inputs.media,
                    );
                }
                Phase::PartialComposite => {
                    let effects = self.layer(LayerId::Effects);
                    if effects.is_visible() && effects.is_compiled() {
                        self.render_partial(scene_active);
                    }
                }
                Phase::FullComposite => {
                    let uniforms = self.compositor_uniforms(scene_active, true);
                    let size = (self.config.width, self.config.height);
                    self.compositor.render_full(&mut self.device, &uniforms, size);
                }
            }
        }
        self.device.end_frame();
        self.record_stats(now);

        if self.device.is_lost() {
            self.enter_lost();
            return Ok(FrameOutcome::Skipped);
        }
        Ok(FrameOutcome::Rendered)
    }

    fn poll_audio(&mut self, now: Instant) -> AudioLevels {
        let snapshot = self.audio.as_mut().and_then(|feed| feed.poll(now).cloned());
        let Some(snapshot) = snapshot else {
            if let Some(texture) = self.audio_texture.take() {
                self.device.destroy_texture(texture);
            }
            return AudioLevels::default();
        };
        if let Some(spectrum) = &snapshot.spectrum {
            let width = spectrum.len().max(1) as u32;
            let texture = match self.audio_texture {
                Some(texture) => Some(texture),
                None => self.device.create_texture(width, 1).ok(),
            };
            if let Some(texture) = texture {
                let rgba: Vec<u8> = spectrum.iter().flat_map(|&v| [v, v, v, 255]).collect();
                self.device.upload_texture(texture, width, 1, &rgba);
            }
            self.audio_texture = texture;
        }
        snapshot.levels
    }

    fn run_scene(&mut self, frame: u64, inputs: &mut FrameInputs<'_>) -> bool {
        if !self.layer(LayerId::Scene).is_visible() {
            return false;
        }
        let Some(scene) = inputs.scene.as_deref_mut() else {
            return false;
        };
        if !self.scheduler.uploads_scene(frame) {
            return self.scene_texture.is_some();
        }
        scene.render();
        let Some(pixels) = scene.frame() else {
            return self.scene_texture.is_some();
        };
        let texture = match self.scene_texture {
            Some(texture) => texture,
            None => match self.device.create_texture(pixels.width, pixels.height) {
                Ok(texture) => texture,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to allocate scene texture");
                    return false;
                }
            },
        };
        self.device.upload_texture(texture, pixels.width, pixels.height, pixels.pixels);
        self.scene_texture = Some(texture);
        true
    }

    fn refresh_background(&mut self, media: Option<&dyn MediaSource>) {
        let (Some(binding), Some(media)) = (self.background_binding.as_mut(), media) else {
            return;
        };
        if let Err(err) = render::refresh_binding(&mut self.device, binding, media) {
            tracing::warn!(error = %err, "failed to upload background media");
        }
    }

    fn background(&self) -> Background {
        match &self.background {
            BackgroundFill::None => Background::None,
            BackgroundFill::Transparent => Background::Transparent,
            BackgroundFill::Color(color) => Background::Color(*color),
            BackgroundFill::Media(_) => match self.background_binding.as_ref().and_then(|binding| binding.texture) {
                Some(texture) => Background::Texture(texture),
                None => Background::None,
            },
        }
    }

    fn compositor_uniforms(&self, scene_active: bool, full: bool) -> CompositorUniformSet {
        let slots = self
            .layers
            .iter()
            .map(|layer| {
                let is_scene = layer.id() == LayerId::Scene;
                let texture = match self.scene_texture {
                    Some(scene) if is_scene && scene_active => Some(scene),
                    _ => layer.target().map(|target| target.texture),
                };
                SlotUniforms {
                    texture,
                    opacity: layer.opacity(),
                    visible: layer.is_visible(),
                    blend: layer.blend(),
                    flip_h: full && is_scene && layer.flip_h,
                    flip_v: full && is_scene && layer.flip_v,
                }
            })
            .collect();
        CompositorUniformSet {
            slots,
            overlay: self.overlay,
            background: self.background(),
        }
    }

    fn render_partial(&mut self, scene_active: bool) {
        let Some(scratch) = self.scratch else {
            return;
        };
        let uniforms = self.compositor_uniforms(scene_active, false);
        self.compositor.render_partial(
            &mut self.device,
            &uniforms,
            PARTIAL_SLOTS,
            scratch.id,
            (scratch.width, scratch.height),
        );
    }

    fn record_stats(&mut self, now: Instant) {
        self.stats.frames += 1;
        let elapsed = now.saturating_duration_since(self.stats.window_start);
        if elapsed >= Duration::from_secs(1) {
            let fps = self.stats.frames as f32 / elapsed.as_secs_f32();
            tracing::debug!(fps = f64::from(fps), frame = self.scheduler.frame(), "frame stats");
            self.stats.window_start = now;
            self.stats.frames = 0;
        }
    }

    /// Every handle is invalid once the device is lost; drop them without
    /// device calls and wait for a restore.
    fn enter_lost(&mut self) {
        if self.state == DeviceState::Lost {
            return;
        }
        tracing::warn!("GPU device lost; waiting for restore");
        self.state = DeviceState::Lost;
        for layer in &mut self.layers {
            layer.forget_gpu();
        }
        self.compositor.forget();
        self.pool = TargetPool::new();
        self.scratch = None;
        self.audio_texture = None;
        self.scene_texture = None;
        for image in self.aux.iter_mut().flatten() {
            image.texture = None;
        }
        if let Some(binding) = self.background_binding.as_mut() {
            binding.texture = None;
            binding.serial = None;
        }
    }

    /// Rebuilds the pool, compositor, scratch target and every layer from
    /// its retained source. Layer failures are logged and leave that layer
    /// uncompiled. Returns `false` when the device was lost again midway;
    /// the engine is then back in [`DeviceState::Lost`].
    fn recover(&mut self) -> Result<bool, EngineError> {
        self.state = DeviceState::Recovering;
        tracing::info!("device restored; rebuilding GPU state");

        let result = self.rebuild();
        let relapsed = matches!(result, Err(EngineError::Device(DeviceError::Lost)));
        if relapsed || self.device.is_lost() {
            tracing::warn!("device lost again during recovery");
            self.enter_lost();
            return Ok(false);
        }
        result?;

        self.state = DeviceState::Normal;
        tracing::info!("recovery complete");
        Ok(true)
    }

    fn rebuild(&mut self) -> Result<(), EngineError> {
        let (width, height) = (self.config.width, self.config.height);
        // Handles from before the loss are already dead.
        self.compositor.forget();
        self.scratch = None;
        self.pool = TargetPool::new();

        self.compositor = Compositor::new(&mut self.device, LAYER_COUNT)?;
        self.scratch = Some(self.pool.create_target(&mut self.device, width, height)?);
        for layer in &mut self.layers {
            if let Err(err) = layer.restore(&mut self.device, &mut self.pool, width, height) {
                tracing::warn!(layer = %layer.id(), error = %err, "layer did not survive device loss");
            }
        }
        for image in self.aux.iter_mut().flatten() {
            upload_aux(&mut self.device, image)?;
        }
        Ok(())
    }

    /// Destroys every GPU object the engine owns and hands the device back.
    pub fn into_device(mut self) -> D {
        for layer in &mut self.layers {
            layer.release_gpu(&mut self.device, &mut self.pool);
        }
        self.compositor.release(&mut self.device);
        if let Some(scratch) = self.scratch.take() {
            self.pool.destroy(&mut self.device, &scratch);
        }
        let textures = [self.audio_texture.take(), self.scene_texture.take()]
            .into_iter()
            .chain(self.aux.iter_mut().flatten().map(|image| image.texture.take()))
            .chain(self.background_binding.take().map(|binding| binding.texture))
            .flatten()
            .collect::<Vec<_>>();
        for texture in textures {
            self.device.destroy_texture(texture);
        }
        self.device
    }
}

fn aux_slot(kind: AuxTexture) -> usize {
    match kind {
        AuxTexture::VarFont => 0,
        AuxTexture::FontAtlas => 1,
    }
}

fn upload_aux<D: GpuDevice + ?Sized>(device: &mut D, image: &mut AuxImage) -> Result<(), DeviceError> {
    let texture = match image.texture {
        Some(texture) => texture,
        None => device.create_texture(image.width, image.height)?,
    };
    device.upload_texture(texture, image.width, image.height, &image.pixels);
    image.texture = Some(texture);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::device::{LoadAction, RenderOutput, Uniform, TRANSPARENT};
    use crate::feeds::{AudioSnapshot, MediaFrame, PixelFrame, SceneSource, SPECTRUM_BINS};
    use crate::testing::{DrawRecord, RecordingDevice};

    const SIZE: u32 = 16;

    fn engine() -> Engine<RecordingDevice> {
        let config = EngineConfig {
            width: SIZE,
            height: SIZE,
            ..EngineConfig::default()
        };
        Engine::new(RecordingDevice::new(), config).expect("engine")
    }

    fn frame(engine: &mut Engine<RecordingDevice>) -> Vec<DrawRecord> {
        engine.device_mut().take_draws();
        let outcome = engine.render_frame(FrameInputs::default()).expect("frame");
        assert_eq!(outcome, FrameOutcome::Rendered);
        engine.device_mut().take_draws()
    }

    fn layer_draws<'a>(engine: &Engine<RecordingDevice>, id: LayerId, draws: &'a [DrawRecord]) -> Vec<&'a DrawRecord> {
        let program = engine.layer(id).program_id().expect("compiled layer");
        draws.iter().filter(|draw| draw.program == program).collect()
    }

    const SOLID: &str = r#"/*{ "INPUTS": [ { "NAME": "speed", "TYPE": "float", "DEFAULT": 1.0 } ] }*/
void main() { gl_FragColor = vec4(speed); }
"#;

    const FEEDBACK: &str = r#"/*{ "PASSES": [ { "TARGET": "trail", "PERSISTENT": true }, {} ] }*/
void main() {
    if (PASSINDEX == 0) {
        gl_FragColor = IMG_THIS_PIXEL(trail) * 0.9;
    } else {
        gl_FragColor = IMG_THIS_PIXEL(trail);
    }
}
"#;

    const TRANSIENT: &str = r#"/*{ "PASSES": [ { "TARGET": "blur" }, {} ] }*/
void main() { gl_FragColor = IMG_THIS_PIXEL(blur); }
"#;

    #[test]
    fn persistent_pass_reads_previous_frame() {
        let mut engine = engine();
        engine.set_source(LayerId::Av, FEEDBACK).expect("compile");

        let first = frame(&mut engine);
        let first = layer_draws(&engine, LayerId::Av, &first);
        let second = frame(&mut engine);
        let second = layer_draws(&engine, LayerId::Av, &second);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);

        assert_eq!(second[0].int("PASSINDEX"), Some(0));
        assert_eq!(second[0].load, LoadAction::Load);
        // frame 2 samples what frame 1 wrote, never its own output
        assert_eq!(second[0].sampled["trail"], Some(first[0].stamp));
        assert_ne!(second[0].sampled["trail"], Some(second[0].stamp));
        // later passes see this frame's write
        assert_eq!(second[1].sampled["trail"], Some(second[0].stamp));
        assert_eq!(second[1].int("PASSINDEX"), Some(1));
        assert_ne!(first[0].output, second[0].output);
    }

    #[test]
    fn transient_pass_clears_and_never_reads_itself() {
        let mut engine = engine();
        engine.set_source(LayerId::Av, TRANSIENT).expect("compile");

        for _ in 0..2 {
            let draws = frame(&mut engine);
            let draws = layer_draws(&engine, LayerId::Av, &draws);
            assert_eq!(draws[0].load, LoadAction::Clear(TRANSPARENT));
            assert_eq!(draws[0].sampled["blur"], None);
            assert_eq!(draws[1].sampled["blur"], Some(draws[0].stamp));
            assert_eq!(draws[1].load, LoadAction::Clear(TRANSPARENT));
        }
    }

    const CHAIN: &str = r#"/*{ "PASSES": [ { "TARGET": "a" }, { "TARGET": "b" }, {} ] }*/
void main() { gl_FragColor = IMG_THIS_PIXEL(a) + IMG_THIS_PIXEL(b); }
"#;

    #[test]
    fn transient_passes_are_never_read_before_they_are_written() {
        let mut engine = engine();
        engine.set_source(LayerId::Av, CHAIN).expect("compile");

        for _ in 0..2 {
            let draws = frame(&mut engine);
            let draws = layer_draws(&engine, LayerId::Av, &draws);
            assert_eq!(draws.len(), 3);
            assert_eq!(draws[0].sampled["a"], None);
            assert_eq!(draws[0].sampled["b"], None);
            assert_eq!(draws[1].sampled["a"], Some(draws[0].stamp));
            assert_eq!(draws[1].sampled["b"], None);
            assert_eq!(draws[2].sampled["a"], Some(draws[0].stamp));
            assert_eq!(draws[2].sampled["b"], Some(draws[1].stamp));
        }
    }

    #[test]
    fn invisible_or_uncompiled_layers_are_not_drawn() {
        let mut engine = engine();
        engine.set_source(LayerId::Background, SOLID).expect("compile");
        engine.set_visible(LayerId::Background, false);

        let draws = frame(&mut engine);
        assert!(layer_draws(&engine, LayerId::Background, &draws).is_empty());
        let composite = draws.last().expect("composite draw");
        assert_eq!(composite.output, RenderOutput::Surface);
        assert_eq!(composite.float("visible0"), Some(0.0));
        assert_eq!(engine.frame_index(), 1);
    }

    fn partial_draw(hide_upper: bool) -> DrawRecord {
        let mut engine = engine();
        for id in LayerId::ALL {
            engine.set_source(id, SOLID).expect("compile");
        }
        engine.set_opacity(LayerId::Media, 0.25);
        engine.set_blend(LayerId::Av, BlendMode::Screen);
        if hide_upper {
            engine.set_visible(LayerId::Text, false);
            engine.set_visible(LayerId::Overlay, false);
            engine.set_opacity(LayerId::Effects, 0.1);
            engine.set_blend(LayerId::Effects, BlendMode::Multiply);
        }
        let scratch = engine.scratch.expect("scratch").id;
        let draws = frame(&mut engine);
        draws
            .into_iter()
            .find(|draw| draw.output == RenderOutput::Target(scratch))
            .expect("partial composite")
    }

    #[test]
    fn partial_composite_ignores_upper_layers() {
        let shown = partial_draw(false);
        let hidden = partial_draw(true);
        assert_eq!(shown.uniforms, hidden.uniforms);
        assert_eq!(shown.sampled, hidden.sampled);
        assert_eq!(shown.float("opacity1"), Some(0.25));
        assert_eq!(shown.sampled["layer4"], None);
    }

    #[test]
    fn effects_layer_samples_the_partial_composite() {
        let mut engine = engine();
        engine.set_source(LayerId::Background, SOLID).expect("compile");
        let effects = r#"/*{ "INPUTS": [] }*/
void main() { gl_FragColor = IMG_THIS_PIXEL(inputImage); }
"#;
        engine.set_source(LayerId::Effects, effects).expect("compile");
        let scratch = engine.scratch.expect("scratch").id;

        let draws = frame(&mut engine);
        let partial = draws
            .iter()
            .position(|draw| draw.output == RenderOutput::Target(scratch))
            .expect("partial composite");
        let effects_program = engine.layer(LayerId::Effects).program_id();
        let effect = draws
            .iter()
            .position(|draw| Some(draw.program) == effects_program)
            .expect("effects draw");
        assert!(partial < effect);
        assert_eq!(draws[effect].sampled["inputImage"], Some(draws[partial].stamp));
    }

    #[test]
    fn failed_edit_then_revert_restores_output_and_values() {
        let mut engine = engine();
        engine.set_source(LayerId::Text, SOLID).expect("compile");
        engine.set_input(LayerId::Text, "speed", InputValue::Float(2.0)).expect("speed");
        let before = frame(&mut engine);
        let before = layer_draws(&engine, LayerId::Text, &before)[0].uniforms.clone();

        assert!(engine.set_source(LayerId::Text, "void main() {").is_err());
        assert!(engine.status(LayerId::Text).error.is_some());
        engine.set_source(LayerId::Text, SOLID).expect("revert");

        let after = frame(&mut engine);
        let after = layer_draws(&engine, LayerId::Text, &after)[0].uniforms.clone();
        let strip = |mut uniforms: std::collections::BTreeMap<String, Uniform>| {
            uniforms.remove("TIME");
            uniforms.remove("FRAMEINDEX");
            uniforms
        };
        assert_eq!(strip(before), strip(after));
        assert_eq!(engine.layer(LayerId::Text).value("speed"), Some(&InputValue::Float(2.0)));
        assert!(engine.status(LayerId::Text).error.is_none());
    }

    #[test]
    fn text_input_uploads_codes_and_length() {
        let mut engine = engine();
        let shader = r#"/*{ "INPUTS": [ { "NAME": "msg", "TYPE": "text", "DEFAULT": "HI", "MAX_LENGTH": 8 } ] }*/
void main() { gl_FragColor = vec4(msg_0 / 26.0); }
"#;
        engine.set_source(LayerId::Text, shader).expect("compile");
        let draws = frame(&mut engine);
        let draw = layer_draws(&engine, LayerId::Text, &draws)[0];
        assert_eq!(draw.float("msg_0"), Some(7.0));
        assert_eq!(draw.float("msg_1"), Some(8.0));
        assert_eq!(draw.float("msg_7"), Some(26.0));
        assert_eq!(draw.float("msg_len"), Some(2.0));
        assert_eq!(draw.float("_transparentBg"), Some(1.0));
    }

    #[test]
    fn device_loss_recovers_every_layer_with_its_values() {
        let mut engine = engine();
        engine.set_source(LayerId::Background, SOLID).expect("compile");
        engine.set_source(LayerId::Av, FEEDBACK).expect("compile");
        engine.set_input(LayerId::Background, "speed", InputValue::Float(3.5)).expect("speed");
        frame(&mut engine);

        engine.device_mut().set_restorable(false);
        engine.device_mut().lose();
        let outcome = engine.render_frame(FrameInputs::default()).expect("lost frame");
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(engine.device_state(), DeviceState::Lost);
        assert!(!engine.layer(LayerId::Background).is_compiled());

        engine.device_mut().set_restorable(true);
        let draws = frame(&mut engine);
        assert_eq!(engine.device_state(), DeviceState::Normal);
        assert!(engine.layer(LayerId::Background).is_compiled());
        assert!(engine.layer(LayerId::Av).is_compiled());
        assert_eq!(engine.layer(LayerId::Av).passes().len(), 2);
        assert_eq!(
            engine.layer(LayerId::Background).value("speed"),
            Some(&InputValue::Float(3.5))
        );
        let background = layer_draws(&engine, LayerId::Background, &draws);
        assert_eq!(background[0].float("speed"), Some(3.5));
    }

    #[test]
    fn loss_during_recovery_returns_to_lost_and_retries() {
        let mut engine = engine();
        engine.set_source(LayerId::Background, SOLID).expect("compile");
        frame(&mut engine);
        let presented = engine.device().frames();

        engine.device_mut().relapse_after_restore();
        engine.device_mut().lose();
        let outcome = engine.render_frame(FrameInputs::default()).expect("relapsed frame");
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(engine.device_state(), DeviceState::Lost);
        assert!(!engine.layer(LayerId::Background).is_compiled());
        assert_eq!(engine.device().live_programs(), 0);
        assert_eq!(engine.device().frames(), presented);

        let draws = frame(&mut engine);
        assert_eq!(engine.device_state(), DeviceState::Normal);
        assert!(engine.layer(LayerId::Background).is_compiled());
        assert_eq!(layer_draws(&engine, LayerId::Background, &draws).len(), 1);
        assert_eq!(engine.device().frames(), presented + 1);
    }

    #[test]
    fn into_device_releases_everything() {
        let mut engine = engine();
        engine.set_source(LayerId::Background, SOLID).expect("compile");
        engine.set_source(LayerId::Av, FEEDBACK).expect("compile");
        engine
            .set_aux_texture(AuxTexture::FontAtlas, 2, 2, vec![255; 16])
            .expect("aux");
        frame(&mut engine);
        assert!(engine.device().live_programs() > 0);
        assert!(engine.device().live_textures() > 0);

        let device = engine.into_device();
        assert_eq!(device.live_programs(), 0);
        assert_eq!(device.live_targets(), 0);
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn audio_reactive_inputs_are_modulated_at_upload() {
        let mut engine = engine();
        let shader = r#"/*{ "INPUTS": [
            { "NAME": "audioReactive", "TYPE": "bool", "DEFAULT": true },
            { "NAME": "speed", "TYPE": "float", "DEFAULT": 1.0 },
            { "NAME": "intensity", "TYPE": "float", "DEFAULT": 0.9 }
        ] }*/
void main() { gl_FragColor = vec4(speed * intensity); }
"#;
        engine.set_source(LayerId::Av, shader).expect("compile");
        let (tx, feed) = AudioFeed::channel(Duration::from_secs(60));
        engine.attach_audio(feed);
        tx.send(AudioSnapshot::from_spectrum(vec![255; SPECTRUM_BINS])).expect("send");

        let draws = frame(&mut engine);
        let draw = layer_draws(&engine, LayerId::Av, &draws)[0];
        assert_eq!(draw.float("speed"), Some(2.5));
        assert_eq!(draw.float("intensity"), Some(1.0));
        assert_eq!(draw.float("audioBass"), Some(1.0));
        assert!(draw.sampled["audioFFT"].is_some());
        assert_eq!(engine.layer(LayerId::Av).value("speed"), Some(&InputValue::Float(1.0)));
    }

    #[test]
    fn missing_feeds_read_as_neutral() {
        let mut engine = engine();
        engine.set_source(LayerId::Av, SOLID).expect("compile");
        let draws = frame(&mut engine);
        let draw = layer_draws(&engine, LayerId::Av, &draws)[0];
        assert_eq!(draw.float("audioLevel"), Some(0.0));
        assert_eq!(draw.float("mpHandCount"), Some(0.0));
        assert_eq!(draw.sampled["audioFFT"], None);
    }

    #[derive(Default)]
    struct Gallery {
        frames: HashMap<String, MediaFrame>,
    }

    impl Gallery {
        fn with(mut self, id: &str, kind: MediaKind, serial: u64) -> Self {
            self.frames.insert(
                id.to_owned(),
                MediaFrame {
                    kind,
                    width: 2,
                    height: 2,
                    pixels: Arc::from(vec![255u8; 16]),
                    serial,
                },
            );
            self
        }
    }

    impl MediaSource for Gallery {
        fn ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.frames.keys().cloned().collect();
            ids.sort();
            ids
        }

        fn frame(&self, id: &str) -> Option<MediaFrame> {
            self.frames.get(id).cloned()
        }
    }

    #[test]
    fn media_bindings_upload_once_and_follow_video_serials() {
        let mut engine = engine();
        let shader = r#"/*{ "INPUTS": [
            { "NAME": "photo", "TYPE": "image" },
            { "NAME": "clip", "TYPE": "image" }
        ] }*/
void main() { gl_FragColor = IMG_THIS_PIXEL(photo) + IMG_THIS_PIXEL(clip); }
"#;
        engine.set_source(LayerId::Media, shader).expect("compile");
        let gallery = Gallery::default()
            .with("a-still", MediaKind::Image, 1)
            .with("b-movie", MediaKind::Video, 1);
        let bound = engine.auto_bind_media(LayerId::Media, &gallery);
        assert_eq!(
            bound,
            vec![
                ("photo".to_owned(), "a-still".to_owned()),
                ("clip".to_owned(), "b-movie".to_owned())
            ]
        );

        engine.render_frame(FrameInputs { scene: None, media: Some(&gallery) }).expect("frame");
        let draws = engine.device_mut().take_draws();
        let first = layer_draws(&engine, LayerId::Media, &draws)[0].sampled.clone();

        let gallery = gallery.with("b-movie", MediaKind::Video, 2);
        engine.render_frame(FrameInputs { scene: None, media: Some(&gallery) }).expect("frame");
        let draws = engine.device_mut().take_draws();
        let second = layer_draws(&engine, LayerId::Media, &draws)[0].sampled.clone();

        assert_eq!(first["photo"], second["photo"]);
        assert_ne!(first["clip"], second["clip"]);
    }

    struct Scene {
        renders: usize,
        pixels: Vec<u8>,
    }

    impl SceneSource for Scene {
        fn render(&mut self) {
            self.renders += 1;
        }

        fn frame(&self) -> Option<PixelFrame<'_>> {
            Some(PixelFrame {
                width: 1,
                height: 1,
                pixels: &self.pixels,
            })
        }
    }

    #[test]
    fn scene_uploads_every_other_frame_and_fills_slot_two() {
        let mut engine = engine();
        engine.set_scene_flip(true, false);
        let mut scene = Scene {
            renders: 0,
            pixels: vec![0, 0, 255, 255],
        };
        for _ in 0..4 {
            engine
                .render_frame(FrameInputs {
                    scene: Some(&mut scene),
                    media: None,
                })
                .expect("frame");
        }
        assert_eq!(scene.renders, 2);

        let draws = engine.device_mut().take_draws();
        let composite = draws
            .iter()
            .rev()
            .find(|draw| draw.output == RenderOutput::Surface)
            .expect("composite");
        let scene_texture = engine.scene_texture.expect("scene texture");
        assert_eq!(
            composite.sampled["layer2"],
            engine.device().texture_stamp(scene_texture)
        );
        assert_eq!(composite.float("flipH2"), Some(1.0));
        assert_eq!(composite.float("flipH1"), Some(0.0));
    }

    #[test]
    fn opacity_is_clamped() {
        let mut engine = engine();
        engine.set_opacity(LayerId::Overlay, 3.0);
        assert_eq!(engine.layer(LayerId::Overlay).opacity(), 1.0);
        engine.set_opacity(LayerId::Overlay, -1.0);
        assert_eq!(engine.layer(LayerId::Overlay).opacity(), 0.0);
    }
}
