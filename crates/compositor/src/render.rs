//! Per-layer rendering: resolves external bindings, uploads uniforms and
//! runs the layer's single pass or pass chain.

use isf::{InputValue, UniformData};

use crate::device::{DeviceError, GpuDevice, LoadAction, RenderOutput, TextureId, Uniform, TRANSPARENT};
use crate::feeds::{AudioLevels, LandmarkFrame, MediaKind, MediaSource};
use crate::layer::{Layer, PassOutput, TextureBinding};

/// Bool input that enables audio-reactive modulation.
pub const AUDIO_REACTIVE_INPUT: &str = "audioReactive";
/// Float input whose value selects the font atlas over the built-in font.
pub const FONT_FAMILY_INPUT: &str = "fontFamily";

/// Per-frame values shared by every layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEnvironment<'a> {
    pub time: f32,
    pub frame: u32,
    /// Normalised, bottom-up.
    pub mouse: [f32; 2],
    pub mouse_delta: [f32; 2],
    pub audio: AudioLevels,
    pub audio_texture: Option<TextureId>,
    pub landmarks: Option<&'a LandmarkFrame>,
    pub var_font: Option<TextureId>,
    pub font_atlas: Option<TextureId>,
}

/// Draws `layer` into its primary target. Returns `false` when there was
/// nothing to draw.
pub fn render_layer<D: GpuDevice + ?Sized>(
    device: &mut D,
    layer: &mut Layer,
    env: &FrameEnvironment<'_>,
    input_image: Option<TextureId>,
    media: Option<&dyn MediaSource>,
) -> bool {
    if !layer.visible {
        return false;
    }
    let (Some(program), Some(target)) = (layer.program.id(), layer.target) else {
        return false;
    };

    refresh_media(device, layer, media);
    apply_landmarks(layer, env.landmarks);
    upload_environment(device, layer, env);
    upload_inputs(device, layer, env.audio);
    bind_textures(device, layer, env, input_image);

    if layer.passes.is_empty() {
        layer.program.set(device, "PASSINDEX", Uniform::Int(0));
        layer.program.set(
            device,
            "RENDERSIZE",
            Uniform::Vec2([target.width as f32, target.height as f32]),
        );
        device.draw(program, RenderOutput::Target(target.id), LoadAction::Clear(TRANSPARENT));
        return true;
    }

    for index in 0..layer.passes.len() {
        let (width, height) = (layer.passes[index].width, layer.passes[index].height);
        layer.program.set(device, "PASSINDEX", Uniform::Int(index as i32));
        layer
            .program
            .set(device, "RENDERSIZE", Uniform::Vec2([width as f32, height as f32]));

        for other in 0..layer.passes.len() {
            let Some(name) = layer.passes[other].descriptor.output().map(str::to_owned) else {
                continue;
            };
            let texture = match &layer.passes[other].output {
                // Transient targets are readable only once written this frame.
                PassOutput::Single(_) if other >= index => None,
                _ => layer.passes[other].readable(),
            };
            layer.program.set(device, &name, Uniform::Texture(texture));
        }

        let (output, load) = match &layer.passes[index].output {
            PassOutput::Primary => (target.id, LoadAction::Clear(TRANSPARENT)),
            PassOutput::Single(pass_target) => (pass_target.id, LoadAction::Clear(TRANSPARENT)),
            PassOutput::PingPong(pair) => (pair.write().id, LoadAction::Load),
        };
        device.draw(program, RenderOutput::Target(output), load);

        if let PassOutput::PingPong(pair) = &mut layer.passes[index].output {
            pair.flip();
        }
    }
    true
}

/// Uploads media for bound image inputs that have no texture yet, and
/// re-uploads video whose frame serial moved on.
pub fn refresh_media<D: GpuDevice + ?Sized>(
    device: &mut D,
    layer: &mut Layer,
    media: Option<&dyn MediaSource>,
) {
    let Some(media) = media else {
        return;
    };
    let id = layer.id();
    for (name, binding) in layer.textures.iter_mut() {
        if let Err(err) = refresh_binding(device, binding, media) {
            tracing::warn!(layer = %id, input = %name, error = %err, "failed to allocate media texture");
        }
    }
}

/// Brings one binding's texture up to date with its media frame.
pub fn refresh_binding<D: GpuDevice + ?Sized>(
    device: &mut D,
    binding: &mut TextureBinding,
    media: &dyn MediaSource,
) -> Result<(), DeviceError> {
    if binding.texture.is_some() && binding.kind != MediaKind::Video {
        return Ok(());
    }
    let Some(frame) = media.frame(&binding.media_id) else {
        return Ok(());
    };
    if binding.texture.is_some() && binding.serial == Some(frame.serial) {
        return Ok(());
    }
    let texture = match binding.texture {
        Some(texture) => texture,
        None => device.create_texture(frame.width, frame.height)?,
    };
    device.upload_texture(texture, frame.width, frame.height, &frame.pixels);
    binding.texture = Some(texture);
    binding.serial = Some(frame.serial);
    binding.kind = frame.kind;
    Ok(())
}

/// Maps tracked coordinates onto bound inputs using each input's MIN/MAX.
/// Inactive groups leave the last written value in place.
pub fn apply_landmarks(layer: &mut Layer, frame: Option<&LandmarkFrame>) {
    let Some(frame) = frame else {
        return;
    };
    let mut updates = Vec::new();
    for binding in &layer.landmarks {
        let Some(point) = frame.point(binding.group, binding.index) else {
            continue;
        };
        let Some(decl) = layer.input(&binding.input) else {
            continue;
        };
        let (min, max) = decl.scalar_range();
        let mapped = min + point.axis(binding.axis) * (max - min);
        let value = match layer.value(&binding.input) {
            Some(InputValue::Long(_)) => InputValue::Long(mapped.round() as i32),
            _ => InputValue::Float(mapped),
        };
        updates.push((binding.input.clone(), value));
    }
    for (name, value) in updates {
        layer.values.insert(name, value);
    }
}

fn upload_environment<D: GpuDevice + ?Sized>(device: &mut D, layer: &mut Layer, env: &FrameEnvironment<'_>) {
    let hand = env.landmarks.and_then(LandmarkFrame::hand_position);
    let mouse = match hand {
        Some(palm) if layer.hand_as_mouse => [palm.x, palm.y],
        _ => env.mouse,
    };
    let hand_count = env.landmarks.map_or(0, |frame| frame.hand_count);
    let hand_pos = hand.map_or([0.0; 3], |palm| [palm.x, palm.y, palm.z]);
    let font_atlas = layer
        .value(FONT_FAMILY_INPUT)
        .and_then(InputValue::as_f32)
        .is_some_and(|family| family > 0.5);

    let program = &mut layer.program;
    program.set(device, "TIME", Uniform::Float(env.time));
    program.set(device, "FRAMEINDEX", Uniform::Int(env.frame as i32));
    program.set(device, "mousePos", Uniform::Vec2(mouse));
    program.set(device, "mouseDelta", Uniform::Vec2(env.mouse_delta));
    program.set(device, "audioLevel", Uniform::Float(env.audio.level));
    program.set(device, "audioBass", Uniform::Float(env.audio.bass));
    program.set(device, "audioMid", Uniform::Float(env.audio.mid));
    program.set(device, "audioHigh", Uniform::Float(env.audio.high));
    program.set(device, "useFontAtlas", Uniform::Float(if font_atlas { 1.0 } else { 0.0 }));
    program.set(device, "mpHandCount", Uniform::Float(hand_count as f32));
    program.set(device, "mpHandPos", Uniform::Vec3(hand_pos));
    program.set(
        device,
        "_transparentBg",
        Uniform::Float(if layer.transparent_bg { 1.0 } else { 0.0 }),
    );
}

/// Values as uploaded this frame, with audio modulation applied.
pub fn modulated_values(layer: &Layer, audio: AudioLevels) -> Vec<(String, UniformData)> {
    let reactive = matches!(layer.value(AUDIO_REACTIVE_INPUT), Some(InputValue::Bool(true)));
    let mut out = Vec::new();
    for (name, value) in layer.values() {
        let value = match (reactive, name.as_str(), value) {
            (true, "speed", InputValue::Float(speed)) => InputValue::Float(speed + audio.level * 1.5),
            (true, "intensity", InputValue::Float(intensity)) => {
                InputValue::Float((intensity + audio.bass * 0.7).min(1.0))
            }
            (true, "textScale", InputValue::Float(scale)) => InputValue::Float(scale * (1.0 + audio.bass * 0.3)),
            _ => value.clone(),
        };
        out.extend(value.uniforms(name));
    }
    out
}

fn upload_inputs<D: GpuDevice + ?Sized>(device: &mut D, layer: &mut Layer, audio: AudioLevels) {
    for (member, data) in modulated_values(layer, audio) {
        layer.program.set(device, &member, data);
    }
}

fn bind_textures<D: GpuDevice + ?Sized>(
    device: &mut D,
    layer: &mut Layer,
    env: &FrameEnvironment<'_>,
    input_image: Option<TextureId>,
) {
    let bound: Vec<(String, Option<TextureId>)> = layer
        .texture_names()
        .iter()
        .filter(|name| !layer.passes.iter().any(|pass| pass.descriptor.output() == Some(name.as_str())))
        .map(|name| {
            let texture = match name.as_str() {
                "audioFFT" => env.audio_texture,
                "varFontTex" => env.var_font,
                "fontAtlasTex" => env.font_atlas,
                "inputImage" => input_image,
                image => layer.textures.get(image).and_then(|binding| binding.texture),
            };
            (name.clone(), texture)
        })
        .collect();
    for (name, texture) in bound {
        layer.program.set(device, &name, Uniform::Texture(texture));
    }
}
