//! GPU-free `check` and `inputs` commands.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct InputsReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    inputs: &'a [isf::InputDecl],
    passes: &'a [isf::PassDescriptor],
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Builds and validates `text`, returning a one-line summary.
pub fn check_source(text: &str) -> Result<String> {
    let built = isf::build(text)?;
    compositor::gpu::validate_program(isf::VERTEX_SHADER, &built.source, built.header_line_count)?;
    Ok(format!(
        "ok ({} inputs, {} passes)",
        built.inputs.len(),
        built.passes.len().max(1)
    ))
}

pub fn inputs_json(text: &str) -> Result<String> {
    let built = isf::build(text)?;
    let report = InputsReport {
        description: built.description.as_deref(),
        inputs: &built.inputs,
        passes: &built.passes,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn run_check(path: &Path) -> Result<()> {
    let text = read_source(path)?;
    let summary = check_source(&text).with_context(|| format!("{} failed validation", path.display()))?;
    println!("{}: {summary}", path.display());
    Ok(())
}

pub fn run_inputs(path: &Path) -> Result<()> {
    let text = read_source(path)?;
    let json = inputs_json(&text).with_context(|| format!("failed to read metadata from {}", path.display()))?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAVES: &str = r#"/*{
    "DESCRIPTION": "Scrolling waves",
    "INPUTS": [
        { "NAME": "speed", "TYPE": "float", "DEFAULT": 0.5, "MIN": 0.0, "MAX": 2.0 },
        { "NAME": "tint", "TYPE": "color", "DEFAULT": [0.2, 0.4, 1.0, 1.0] }
    ]
}*/
void main() {
    float wave = sin(isf_FragNormCoord.x * 20.0 + TIME * speed);
    gl_FragColor = tint * (0.5 + 0.5 * wave);
}
"#;

    #[test]
    fn valid_shaders_pass_the_check() {
        assert_eq!(check_source(WAVES).expect("valid"), "ok (2 inputs, 1 passes)");
    }

    #[test]
    fn compile_errors_point_at_user_lines() {
        let err = check_source("void main() {\n    gl_FragColor = vec4(glow);\n}\n").expect_err("invalid");
        let message = format!("{err:#}");
        assert!(message.contains("Line 2"), "{message}");
    }

    #[test]
    fn inputs_are_reported_as_json() {
        let json: serde_json::Value = serde_json::from_str(&inputs_json(WAVES).expect("json")).expect("parse");
        assert_eq!(json["description"], "Scrolling waves");
        assert_eq!(json["inputs"][0]["NAME"], "speed");
        assert_eq!(json["inputs"][1]["TYPE"], "color");
        assert_eq!(json["passes"].as_array().map(Vec::len), Some(0));
    }
}
