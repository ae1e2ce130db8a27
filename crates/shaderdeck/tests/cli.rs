use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const GRADIENT: &str = r#"/*{
    "DESCRIPTION": "Feedback gradient",
    "INPUTS": [
        { "NAME": "amount", "TYPE": "float", "DEFAULT": 0.1 },
        { "NAME": "invert", "TYPE": "bool" }
    ],
    "PASSES": [ { "TARGET": "history", "PERSISTENT": true }, {} ]
}*/
void main() {
    vec2 uv = isf_FragNormCoord;
    vec4 previous = IMG_NORM_PIXEL(history, uv);
    vec4 fresh = vec4(uv, 0.5 + 0.5 * sin(TIME), 1.0);
    if (invert) {
        fresh.rgb = 1.0 - fresh.rgb;
    }
    gl_FragColor = mix(previous, fresh, amount);
}
"#;

fn shaderdeck(args: &[&str], dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shaderdeck"))
        .args(args)
        .env("SHADERDECK_CONFIG_DIR", dir)
        .env_remove("SHADERDECK_CONFIG")
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn shaderdeck")
}

fn write_shader(dir: &TempDir, name: &str, text: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, text).expect("write shader");
    path.to_string_lossy().into_owned()
}

#[test]
fn check_accepts_a_multi_pass_shader() {
    let dir = TempDir::new().unwrap();
    let file = write_shader(&dir, "gradient.fs", GRADIENT);

    let output = shaderdeck(&["check", &file], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok (2 inputs, 2 passes)"), "{stdout}");
}

#[test]
fn check_fails_with_user_line_numbers() {
    let dir = TempDir::new().unwrap();
    let file = write_shader(&dir, "broken.fs", "void main() {\n\n    gl_FragColor = nothing;\n}\n");

    let output = shaderdeck(&["check", &file], dir.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Line 3"), "{stderr}");
}

#[test]
fn inputs_prints_declared_inputs_and_passes() {
    let dir = TempDir::new().unwrap();
    let file = write_shader(&dir, "gradient.fs", GRADIENT);

    let output = shaderdeck(&["inputs", &file], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json output");
    let names: Vec<&str> = json["inputs"]
        .as_array()
        .expect("inputs array")
        .iter()
        .filter_map(|input| input["NAME"].as_str())
        .collect();
    assert_eq!(names, ["amount", "invert"]);
    assert_eq!(json["passes"][0]["TARGET"], "history");
    assert_eq!(json["passes"][0]["PERSISTENT"], true);
}

#[test]
fn run_reports_a_missing_deck() {
    let dir = TempDir::new().unwrap();

    let output = shaderdeck(&["run"], dir.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("deck.toml"), "{stderr}");
}
