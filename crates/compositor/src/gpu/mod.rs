//! wgpu backend for [`crate::device::GpuDevice`].

mod context;
mod device;
mod reflect;

pub use context::GpuOptions;
pub use device::WgpuDevice;
pub use wgpu::PowerPreference;

use crate::device::ShaderStage;
use crate::program::{remap_error_lines, CompileError};

/// Runs a built layer source through the same front end and validator the
/// device uses, without needing a GPU.
pub fn validate_program(vertex: &str, fragment: &str, header_lines: usize) -> Result<(), CompileError> {
    reflect::parse(ShaderStage::Vertex, vertex).map_err(CompileError::Vertex)?;
    reflect::parse(ShaderStage::Fragment, fragment)
        .map_err(|log| CompileError::Fragment(remap_error_lines(&log, header_lines)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYER: &str = r#"/*{
    "INPUTS": [
        { "NAME": "speed", "TYPE": "float", "DEFAULT": 1.0 },
        { "NAME": "glow", "TYPE": "bool" },
        { "NAME": "photo", "TYPE": "image" }
    ],
    "PASSES": [ { "TARGET": "trail", "PERSISTENT": true }, {} ]
}*/
void main() {
    vec2 uv = isf_FragNormCoord;
    vec4 previous = IMG_NORM_PIXEL(trail, uv);
    vec4 image = texture2D(photo, uv);
    float pulse = glow ? sin(TIME * speed) : 0.0;
    gl_FragColor = mix(previous, image, 0.1) + vec4(pulse);
}
"#;

    #[test]
    fn built_layers_pass_validation() {
        let built = isf::build(LAYER).expect("build");
        validate_program(isf::VERTEX_SHADER, &built.source, built.header_line_count).expect("valid program");
    }

    #[test]
    fn compositor_shader_passes_validation() {
        let source = crate::composite::build_compositor_shader(7);
        validate_program(isf::VERTEX_SHADER, &source, 0).expect("valid compositor");
    }

    #[test]
    fn fragment_errors_are_reported_against_user_lines() {
        let built = isf::build("void main() {\n    gl_FragColor = missingValue;\n}\n").expect("build");
        let err = validate_program(isf::VERTEX_SHADER, &built.source, built.header_line_count)
            .expect_err("undefined identifier");
        match err {
            CompileError::Fragment(log) => assert!(log.contains("Line 2"), "{log}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
