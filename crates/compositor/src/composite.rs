//! The N-slot blend stage.
//!
//! [`build_compositor_shader`] generates one fragment shader with a texture,
//! opacity, visibility, blend mode and flip pair per slot. The last slot is
//! additionally run through the overlay transform. [`blend`] and
//! [`composite_pixel`] evaluate the same math on the CPU.

use std::fmt::Write as _;

use isf::VERTEX_SHADER;
use serde::{Deserialize, Serialize};

use crate::device::{
    GpuDevice, LoadAction, ProgramId, RenderOutput, TargetId, TextureId, Uniform, OPAQUE_BLACK, TRANSPARENT,
};
use crate::layer::BlendMode;
use crate::program::{CompileError, ProgramSlot};

/// Translate, uniform scale and rotation (radians) applied to the topmost
/// slot before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayTransform {
    pub translate: [f32; 2],
    pub scale: f32,
    pub rotate: f32,
}

impl Default for OverlayTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl OverlayTransform {
    pub const IDENTITY: Self = Self {
        translate: [0.0, 0.0],
        scale: 1.0,
        rotate: 0.0,
    };

    /// Maps an output UV to the UV sampled from the overlay layer.
    pub fn apply(&self, uv: [f32; 2]) -> [f32; 2] {
        let scale = self.scale.max(0.001);
        let (x, y) = ((uv[0] - 0.5) / scale, (uv[1] - 0.5) / scale);
        let (sin, cos) = self.rotate.sin_cos();
        let (x, y) = (cos * x + sin * y, -sin * x + cos * y);
        [x - self.translate[0] + 0.5, y - self.translate[1] + 0.5]
    }
}

/// What sits underneath slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Background {
    /// Opaque black.
    #[default]
    None,
    Transparent,
    Color([f32; 3]),
    Texture(TextureId),
}

impl Background {
    /// Value of the `bgMode` uniform.
    pub fn code(&self) -> f32 {
        match self {
            Background::None => 0.0,
            Background::Transparent => 1.0,
            Background::Color(_) => 2.0,
            Background::Texture(_) => 3.0,
        }
    }
}

/// Uniforms for one composited slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlotUniforms {
    pub texture: Option<TextureId>,
    pub opacity: f32,
    pub visible: bool,
    pub blend: BlendMode,
    pub flip_h: bool,
    pub flip_v: bool,
}

/// Everything one composite draw binds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositorUniformSet {
    pub slots: Vec<SlotUniforms>,
    pub overlay: OverlayTransform,
    pub background: Background,
}

/// Generates the blend shader for `n` slots.
pub fn build_compositor_shader(n: usize) -> String {
    let mut src = String::from(
        "#version 450\n\
         layout(location = 0) in vec2 isf_FragNormCoord;\n\
         layout(location = 0) out vec4 fragColor;\n\
         layout(std140, set = 0, binding = 0) uniform CompositorUniforms {\n    \
             vec2 RENDERSIZE;\n    \
             vec2 overlayTranslate;\n    \
             vec3 bgColor;\n    \
             float bgMode;\n    \
             float overlayScale;\n    \
             float overlayRotate;\n",
    );
    for i in 0..n {
        for field in ["opacity", "visible", "blendMode", "flipH", "flipV"] {
            let _ = writeln!(src, "    float {field}{i};");
        }
    }
    src.push_str("};\n");
    src.push_str("layout(set = 1, binding = 0) uniform sampler compSampler;\n");
    src.push_str("layout(set = 1, binding = 1) uniform texture2D bgTexture_texture;\n");
    for i in 0..n {
        let _ = writeln!(
            src,
            "layout(set = 1, binding = {binding}) uniform texture2D layer{i}_texture;",
            binding = i + 2
        );
    }
    src.push_str(COMPOSITOR_FUNCTIONS);

    src.push_str(
        "void main() {\n\
         \x20   vec2 uv = isf_FragNormCoord;\n\
         \x20   vec4 result = vec4(0.0, 0.0, 0.0, 1.0);\n\
         \x20   if (bgMode > 0.5 && bgMode < 1.5) result = vec4(0.0);\n\
         \x20   else if (bgMode > 1.5 && bgMode < 2.5) result = vec4(bgColor, 1.0);\n\
         \x20   else if (bgMode > 2.5) result = sampleFlipped(bgTexture_texture, uv);\n",
    );
    for i in 0..n {
        let _ = writeln!(src, "    if (visible{i} > 0.5) {{");
        if i + 1 == n {
            let _ = writeln!(src, "        vec2 ouv{i} = uvForOverlay(uv, flipH{i}, flipV{i});");
            let _ = writeln!(
                src,
                "        vec4 c{i} = (ouv{i}.x >= 0.0 && ouv{i}.x <= 1.0 && ouv{i}.y >= 0.0 && ouv{i}.y <= 1.0) \
                 ? sampleFlipped(layer{i}_texture, ouv{i}) : vec4(0.0);"
            );
        } else {
            let _ = writeln!(
                src,
                "        vec4 c{i} = sampleFlipped(layer{i}_texture, uvForLayer(uv, flipH{i}, flipV{i}));"
            );
        }
        let _ = writeln!(src, "        float a{i} = c{i}.a * opacity{i};");
        let _ = writeln!(src, "        result.rgb = applyBlend(result.rgb, c{i}.rgb, a{i}, blendMode{i});");
        let _ = writeln!(src, "        result.a = max(result.a, a{i});");
        src.push_str("    }\n");
    }
    src.push_str("    fragColor = result;\n}\n");
    src
}

const COMPOSITOR_FUNCTIONS: &str = r"
#define sampleFlipped(tex, uv) texture(sampler2D(tex, compSampler), vec2((uv).x, 1.0 - (uv).y))

vec2 uvForLayer(vec2 uv, float fh, float fv) {
    if (fh > 0.5) uv.x = 1.0 - uv.x;
    if (fv > 0.5) uv.y = 1.0 - uv.y;
    return uv;
}

vec2 uvForOverlay(vec2 uv, float fh, float fv) {
    uv = uvForLayer(uv, fh, fv);
    uv -= 0.5;
    uv /= max(overlayScale, 0.001);
    float cr = cos(overlayRotate);
    float sr = sin(overlayRotate);
    uv = vec2(cr * uv.x + sr * uv.y, -sr * uv.x + cr * uv.y);
    uv -= overlayTranslate;
    return uv + 0.5;
}

vec3 applyBlend(vec3 base, vec3 top, float a, float mode) {
    if (mode < 0.5) return mix(base, top, a);
    if (mode < 1.5) return base + top * a;
    if (mode < 2.5) return mix(base, base * top, a);
    if (mode < 3.5) return mix(base, 1.0 - (1.0 - base) * (1.0 - top), a);
    vec3 o = mix(2.0 * base * top, 1.0 - 2.0 * (1.0 - base) * (1.0 - top), step(0.5, base));
    return mix(base, o, a);
}

";

/// CPU version of the shader's `applyBlend`.
pub fn blend(mode: BlendMode, base: [f32; 3], top: [f32; 3], alpha: f32) -> [f32; 3] {
    let mix = |b: f32, t: f32| b + (t - b) * alpha;
    let mut out = [0.0; 3];
    for channel in 0..3 {
        let (b, t) = (base[channel], top[channel]);
        out[channel] = match mode {
            BlendMode::Normal => mix(b, t),
            BlendMode::Add => b + t * alpha,
            BlendMode::Multiply => mix(b, b * t),
            BlendMode::Screen => mix(b, 1.0 - (1.0 - b) * (1.0 - t)),
            BlendMode::Overlay => {
                let o = if b < 0.5 {
                    2.0 * b * t
                } else {
                    1.0 - 2.0 * (1.0 - b) * (1.0 - t)
                };
                mix(b, o)
            }
        };
    }
    out
}

/// Composites one pixel given each slot's sampled colour. `samples[i]` is
/// ignored for invisible slots.
pub fn composite_pixel(background: [f32; 4], slots: &[SlotUniforms], samples: &[[f32; 4]]) -> [f32; 4] {
    let mut result = background;
    for (slot, sample) in slots.iter().zip(samples) {
        if !slot.visible {
            continue;
        }
        let alpha = sample[3] * slot.opacity;
        let rgb = blend(
            slot.blend,
            [result[0], result[1], result[2]],
            [sample[0], sample[1], sample[2]],
            alpha,
        );
        result = [rgb[0], rgb[1], rgb[2], result[3].max(alpha)];
    }
    result.map(|channel| channel.clamp(0.0, 1.0))
}

/// Compositor program plus its draw helpers.
#[derive(Debug)]
pub struct Compositor {
    program: ProgramSlot,
    slots: usize,
    frame_index: u64,
}

impl Compositor {
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D, slots: usize) -> Result<Self, CompileError> {
        let mut program = ProgramSlot::new();
        program.replace(device, VERTEX_SHADER, &build_compositor_shader(slots), 0)?;
        Ok(Self {
            program,
            slots,
            frame_index: 0,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn program_id(&self) -> Option<ProgramId> {
        self.program.id()
    }

    /// Full composites drawn so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        self.program.release(device);
    }

    pub fn forget(&mut self) {
        self.program.forget();
    }

    /// Draws every slot to the surface over an opaque black clear.
    pub fn render_full<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uniforms: &CompositorUniformSet,
        size: (u32, u32),
    ) {
        if self.draw(device, uniforms, size, RenderOutput::Surface, OPAQUE_BLACK) {
            self.frame_index += 1;
        }
    }

    /// Draws `uniforms` into `target`, cleared to transparent, with slots
    /// from `visible_slots` on forced invisible, unflipped and unbound, and
    /// the overlay transform reset.
    pub fn render_partial<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uniforms: &CompositorUniformSet,
        visible_slots: usize,
        target: TargetId,
        size: (u32, u32),
    ) {
        let mut partial = uniforms.clone();
        for (index, slot) in partial.slots.iter_mut().enumerate() {
            slot.flip_h = false;
            slot.flip_v = false;
            if index >= visible_slots {
                *slot = SlotUniforms::default();
            }
        }
        partial.overlay = OverlayTransform::IDENTITY;
        self.draw(device, &partial, size, RenderOutput::Target(target), TRANSPARENT);
    }

    fn draw<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uniforms: &CompositorUniformSet,
        size: (u32, u32),
        output: RenderOutput,
        clear: [f32; 4],
    ) -> bool {
        let Some(program) = self.program.id() else {
            return false;
        };
        let slot = &mut self.program;
        slot.set(device, "RENDERSIZE", Uniform::Vec2([size.0 as f32, size.1 as f32]));
        for index in 0..self.slots {
            let state = uniforms.slots.get(index).copied().unwrap_or_default();
            slot.set(device, &format!("layer{index}"), Uniform::Texture(state.texture));
            slot.set(device, &format!("opacity{index}"), Uniform::Float(state.opacity));
            slot.set(device, &format!("visible{index}"), flag(state.visible));
            slot.set(device, &format!("blendMode{index}"), Uniform::Float(state.blend.code()));
            slot.set(device, &format!("flipH{index}"), flag(state.flip_h));
            slot.set(device, &format!("flipV{index}"), flag(state.flip_v));
        }
        let overlay = uniforms.overlay;
        slot.set(device, "overlayTranslate", Uniform::Vec2(overlay.translate));
        slot.set(device, "overlayScale", Uniform::Float(overlay.scale));
        slot.set(device, "overlayRotate", Uniform::Float(overlay.rotate));

        let background = uniforms.background;
        slot.set(device, "bgMode", Uniform::Float(background.code()));
        if let Background::Color(color) = background {
            slot.set(device, "bgColor", Uniform::Vec3(color));
        }
        let bg_texture = match background {
            Background::Texture(texture) => Some(texture),
            _ => None,
        };
        slot.set(device, "bgTexture", Uniform::Texture(bg_texture));

        device.draw(program, output, LoadAction::Clear(clear));
        true
    }
}

fn flag(value: bool) -> Uniform {
    Uniform::Float(if value { 1.0 } else { 0.0 })
}
