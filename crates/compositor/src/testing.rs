//! Recording [`GpuDevice`] used by the unit tests.
//!
//! Shaders are "compiled" by checking brace balance and reflected by
//! scanning declarations line by line. Every draw is recorded with the
//! uniform values bound at that moment; sampled textures are recorded by
//! content stamp, a counter bumped whenever something writes the texture.

use std::collections::{BTreeMap, HashMap};

use crate::device::{
    DeviceError, GpuDevice, LoadAction, ProgramId, RenderOutput, ShaderStage, StageId, TargetFormat, TargetId,
    TextureId, Uniform, UniformLocation,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub output: RenderOutput,
    pub load: LoadAction,
    pub uniforms: BTreeMap<String, Uniform>,
    /// Texture uniform name to the sampled content stamp; `None` is the
    /// neutral texture.
    pub sampled: BTreeMap<String, Option<u64>>,
    /// Stamp the draw left in its output.
    pub stamp: u64,
}

impl DrawRecord {
    pub fn float(&self, name: &str) -> Option<f32> {
        match self.uniforms.get(name) {
            Some(Uniform::Float(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        match self.uniforms.get(name) {
            Some(Uniform::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Program {
    names: Vec<String>,
    values: HashMap<UniformLocation, Uniform>,
}

#[derive(Debug)]
struct Target {
    texture: TextureId,
}

#[derive(Debug)]
struct Texture {
    width: u32,
    height: u32,
    stamp: u64,
}

#[derive(Debug, Default)]
pub struct RecordingDevice {
    next_handle: u32,
    next_stamp: u64,
    stages: HashMap<StageId, String>,
    programs: HashMap<ProgramId, Program>,
    targets: HashMap<TargetId, Target>,
    textures: HashMap<TextureId, Texture>,
    draws: Vec<DrawRecord>,
    location_queries: usize,
    float_probes: usize,
    float_disabled: bool,
    frames: usize,
    in_frame: bool,
    lost: bool,
    unrestorable: bool,
    relapse_armed: bool,
    relapse_pending: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn program_alive(&self, program: ProgramId) -> bool {
        self.programs.contains_key(&program)
    }

    pub fn location_queries(&self) -> usize {
        self.location_queries
    }

    /// Number of 4x4 half-float targets requested.
    pub fn float_probes(&self) -> usize {
        self.float_probes
    }

    pub fn disable_float_targets(&mut self) {
        self.float_disabled = true;
    }

    pub fn live_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.draws)
    }

    pub fn texture_stamp(&self, texture: TextureId) -> Option<u64> {
        self.textures.get(&texture).map(|texture| texture.stamp)
    }

    /// Simulates losing the context; every handle becomes invalid.
    pub fn lose(&mut self) {
        self.lost = true;
        self.stages.clear();
        self.programs.clear();
        self.targets.clear();
        self.textures.clear();
        self.in_frame = false;
    }

    pub fn set_restorable(&mut self, restorable: bool) {
        self.unrestorable = !restorable;
    }

    /// The next restore succeeds, then the first target allocation after it
    /// loses the context again.
    pub fn relapse_after_restore(&mut self) {
        self.relapse_armed = true;
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }
}

fn check_braces(source: &str) -> Result<(), String> {
    let mut depth = 0i64;
    for (index, line) in source.lines().enumerate() {
        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("ERROR: 0:{}: unexpected '}}'", index + 1));
                    }
                }
                _ => {}
            }
        }
    }
    if depth > 0 {
        return Err(format!("ERROR: 0:{}: unexpected end of file", source.lines().count()));
    }
    Ok(())
}

const VALUE_TYPES: [&str; 5] = ["float", "int", "vec2", "vec3", "vec4"];

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !text.as_bytes()[0].is_ascii_digit()
}

/// Names a shader declares as values (`float speed;`) or textures
/// (`uniform texture2D speed_texture;`).
fn reflect(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(pos) = line.find("uniform texture2D ") {
            let rest = &line[pos + "uniform texture2D ".len()..];
            if let Some(name) = rest
                .strip_suffix(';')
                .and_then(|decl| decl.trim().strip_suffix("_texture"))
            {
                names.push(name.to_owned());
            }
            continue;
        }
        let Some(decl) = line.strip_suffix(';') else {
            continue;
        };
        let mut parts = decl.split_whitespace();
        let (Some(ty), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if VALUE_TYPES.contains(&ty) && is_identifier(name) {
            names.push(name.to_owned());
        }
    }
    names
}

impl GpuDevice for RecordingDevice {
    fn compile_stage(&mut self, _stage: ShaderStage, source: &str) -> Result<StageId, String> {
        if self.lost {
            return Err("ERROR: 0:1: context lost".into());
        }
        check_braces(source)?;
        let id = StageId::new(self.handle());
        self.stages.insert(id, source.to_owned());
        Ok(id)
    }

    fn link_program(&mut self, vertex: StageId, fragment: StageId) -> Result<ProgramId, String> {
        let (Some(_), Some(fragment)) = (self.stages.get(&vertex), self.stages.get(&fragment)) else {
            return Err("invalid stage handle".into());
        };
        if !fragment.contains("void main(") {
            return Err("fragment stage has no entry point".into());
        }
        let names = reflect(fragment);
        let id = ProgramId::new(self.handle());
        self.programs.insert(
            id,
            Program {
                names,
                values: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn release_stage(&mut self, stage: StageId) {
        self.stages.remove(&stage);
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.location_queries += 1;
        let program = self.programs.get(&program)?;
        program
            .names
            .iter()
            .position(|declared| declared == name)
            .map(|index| UniformLocation::new(index as u32))
    }

    fn set_uniform(&mut self, program: ProgramId, location: UniformLocation, value: Uniform) {
        if let Some(program) = self.programs.get_mut(&program) {
            program.values.insert(location, value);
        }
    }

    fn create_target(&mut self, width: u32, height: u32, format: TargetFormat) -> Result<TargetId, DeviceError> {
        if std::mem::take(&mut self.relapse_pending) {
            self.lose();
            return Err(DeviceError::Lost);
        }
        if self.lost {
            return Err(DeviceError::Lost);
        }
        if format == TargetFormat::Rgba16Float {
            if width == 4 && height == 4 {
                self.float_probes += 1;
            }
            if self.float_disabled {
                return Err(DeviceError::Incomplete { width, height, format });
            }
        }
        let texture = TextureId::new(self.handle());
        self.textures.insert(
            texture,
            Texture {
                width,
                height,
                stamp: 0,
            },
        );
        let id = TargetId::new(self.handle());
        self.targets.insert(id, Target { texture });
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        if let Some(target) = self.targets.remove(&target) {
            self.textures.remove(&target.texture);
        }
    }

    fn target_texture(&self, target: TargetId) -> Option<TextureId> {
        self.targets.get(&target).map(|target| target.texture)
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError> {
        if self.lost {
            return Err(DeviceError::Lost);
        }
        let id = TextureId::new(self.handle());
        self.textures.insert(
            id,
            Texture {
                width,
                height,
                stamp: 0,
            },
        );
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, width: u32, height: u32, _rgba: &[u8]) {
        let stamp = self.stamp();
        if let Some(texture) = self.textures.get_mut(&texture) {
            texture.width = width;
            texture.height = height;
            texture.stamp = stamp;
        }
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        if self.lost {
            return Err(DeviceError::Lost);
        }
        self.in_frame = true;
        Ok(())
    }

    fn draw(&mut self, program: ProgramId, output: RenderOutput, load: LoadAction) {
        if self.lost {
            return;
        }
        let Some(state) = self.programs.get(&program) else {
            return;
        };
        let mut uniforms = BTreeMap::new();
        let mut sampled = BTreeMap::new();
        for (location, value) in &state.values {
            let Some(name) = state.names.get(location.raw() as usize) else {
                continue;
            };
            if let Uniform::Texture(texture) = value {
                let stamp = texture.and_then(|id| self.textures.get(&id).map(|texture| texture.stamp));
                sampled.insert(name.clone(), stamp);
            }
            uniforms.insert(name.clone(), *value);
        }

        let stamp = self.stamp();
        if let RenderOutput::Target(target) = output {
            if let Some(texture) = self.targets.get(&target).map(|target| target.texture) {
                if let Some(texture) = self.textures.get_mut(&texture) {
                    texture.stamp = stamp;
                }
            }
        }
        self.draws.push(DrawRecord {
            program,
            output,
            load,
            uniforms,
            sampled,
            stamp,
        });
    }

    fn end_frame(&mut self) {
        if self.in_frame {
            self.frames += 1;
        }
        self.in_frame = false;
    }

    fn is_lost(&self) -> bool {
        self.lost
    }

    fn try_restore(&mut self) -> Result<bool, DeviceError> {
        if !self.lost {
            return Ok(true);
        }
        if self.unrestorable {
            return Ok(false);
        }
        self.lost = false;
        self.relapse_pending = std::mem::take(&mut self.relapse_armed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_finds_values_and_textures() {
        let source = "layout(std140) uniform Block {\n    float TIME;\n    vec2 RENDERSIZE;\n};\n\
                      layout(set = 1, binding = 1) uniform texture2D photo_texture;\n\
                      float local = 1.0;\nvoid main() {}\n";
        assert_eq!(reflect(source), vec!["TIME", "RENDERSIZE", "photo"]);
    }

    #[test]
    fn brace_errors_carry_line_numbers() {
        assert_eq!(check_braces("a\n}\n"), Err("ERROR: 0:2: unexpected '}'".to_owned()));
        assert_eq!(check_braces("{\n\n"), Err("ERROR: 0:2: unexpected end of file".to_owned()));
        assert!(check_braces("{ }").is_ok());
    }
}
