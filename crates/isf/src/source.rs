use std::fmt::Write as _;

use crate::metadata::{self, InputDecl, InputKind, Metadata, MetadataError, PassDescriptor};
use crate::values::bool_member_name;

/// Input name that signals a shader handles its own alpha.
pub const TRANSPARENCY_INPUT: &str = "transparentBg";

/// Result of [`build`]: the compilable fragment shader plus what it declares.
#[derive(Debug, Clone)]
pub struct BuiltShader {
    pub source: String,
    pub description: Option<String>,
    pub inputs: Vec<InputDecl>,
    pub passes: Vec<PassDescriptor>,
    /// Lines emitted ahead of the user's first line.
    pub header_line_count: usize,
    pub wraps_entry_point: bool,
}

impl BuiltShader {
    pub fn is_multi_pass(&self) -> bool {
        !self.passes.is_empty()
    }

    /// Names of every texture the shader samples, in binding order.
    pub fn texture_names(&self) -> Vec<String> {
        texture_slots(&self.inputs, &self.passes)
    }
}

/// Synthesises the final fragment source for a layer shader.
///
/// The metadata comment is replaced by blank lines and `#version` /
/// `precision` statements are blanked, so a line number in the emitted body
/// minus [`BuiltShader::header_line_count`] is the line in `raw`.
pub fn build(raw: &str) -> Result<BuiltShader, MetadataError> {
    let (metadata, body) = split_metadata(raw);
    metadata.validate_passes()?;

    let inputs: Vec<InputDecl> = metadata
        .inputs
        .into_iter()
        .filter(|input| {
            if input.kind == InputKind::Unknown {
                tracing::warn!(input = %input.name, "ignoring input with unsupported TYPE");
                false
            } else {
                true
            }
        })
        .collect();
    let passes = metadata.passes;
    let manages_transparency = inputs.iter().any(|input| input.name == TRANSPARENCY_INPUT);

    let header = header(&inputs, &passes);
    let header_line_count = header.lines().count();

    let mut body = sanitize(&body);
    let entry = find_entry_point(&body);
    if let Some(range) = entry.clone() {
        body.replace_range(range, "isf_main");
    } else {
        tracing::warn!("shader has no `void main()`; entry point left unwrapped");
    }

    let mut source = header;
    source.push_str(&body);
    if !source.ends_with('\n') {
        source.push('\n');
    }
    if entry.is_some() {
        source.push_str(&footer(!manages_transparency));
    }

    Ok(BuiltShader {
        source,
        description: metadata.description,
        inputs,
        passes,
        header_line_count,
        wraps_entry_point: entry.is_some(),
    })
}

fn split_metadata(raw: &str) -> (Metadata, String) {
    let Some(block) = metadata::extract(raw) else {
        return (Metadata::default(), raw.to_owned());
    };

    match Metadata::parse(block.json) {
        Ok(metadata) => {
            let comment = &raw[block.span.clone()];
            let blank = "\n".repeat(comment.matches('\n').count());
            let mut body = String::with_capacity(raw.len());
            body.push_str(&raw[..block.span.start]);
            body.push_str(&blank);
            body.push_str(&raw[block.span.end..]);
            (metadata, body)
        }
        Err(err) => {
            tracing::warn!(error = %err, "shader metadata is not valid JSON; treating as plain GLSL");
            (Metadata::default(), raw.to_owned())
        }
    }
}

fn sanitize(body: &str) -> String {
    body.split('\n')
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("#version") || trimmed.starts_with("precision ") {
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Byte range of the `main` identifier in `void main()` / `void main(void)`.
fn find_entry_point(body: &str) -> Option<std::ops::Range<usize>> {
    let bytes = body.as_bytes();
    let mut cursor = 0;
    while let Some(offset) = body[cursor..].find("void") {
        let start = cursor + offset;
        cursor = start + 4;
        if start > 0 && is_ident(bytes[start - 1]) {
            continue;
        }

        let rest = &body[start + 4..];
        let name = rest.trim_start();
        if name.len() == rest.len() || !name.starts_with("main") {
            continue;
        }
        let name_start = start + 4 + (rest.len() - name.len());
        let after = &name[4..];
        if after.bytes().next().is_some_and(is_ident) {
            continue;
        }

        let Some(params) = after.trim_start().strip_prefix('(') else {
            continue;
        };
        let params = params.trim_start();
        let params = params
            .strip_prefix("void")
            .map(str::trim_start)
            .unwrap_or(params);
        if params.starts_with(')') {
            return Some(name_start..name_start + 4);
        }
    }
    None
}

fn texture_slots(inputs: &[InputDecl], passes: &[PassDescriptor]) -> Vec<String> {
    let mut names: Vec<String> = ENVIRONMENT_TEXTURES.iter().map(|name| (*name).to_owned()).collect();
    names.extend(
        inputs
            .iter()
            .filter(|input| input.kind == InputKind::Image)
            .map(|input| input.name.clone()),
    );
    names.extend(passes.iter().filter_map(PassDescriptor::output).map(str::to_owned));
    names
}

/// Samplers every layer program declares.
pub const ENVIRONMENT_TEXTURES: [&str; 4] = ["audioFFT", "varFontTex", "fontAtlasTex", "inputImage"];

const PRELUDE: &str = r"#version 450
layout(location = 0) in vec2 isf_FragNormCoord;
layout(location = 0) out vec4 isf_FragColor;
vec4 isf_FragCoord;
#define gl_FragColor isf_FragColor
#define gl_FragCoord isf_FragCoord
#define texture2D(image, coord) texture(image, vec2((coord).x, 1.0 - (coord).y))
#define IMG_NORM_PIXEL(image, coord) texture2D(image, coord)
#define IMG_PIXEL(image, coord) texture2D(image, (coord) / RENDERSIZE)
#define IMG_THIS_NORM_PIXEL(image) texture2D(image, isf_FragNormCoord)
#define IMG_THIS_PIXEL(image) texture2D(image, isf_FragNormCoord)
#define IMG_SIZE(image) vec2(textureSize(image, 0))
layout(std140, set = 0, binding = 0) uniform IsfUniforms {
    float TIME;
    vec2 RENDERSIZE;
    int PASSINDEX;
    int FRAMEINDEX;
    vec2 mousePos;
    vec2 mouseDelta;
    float audioLevel;
    float audioBass;
    float audioMid;
    float audioHigh;
    float useFontAtlas;
    float mpHandCount;
    vec3 mpHandPos;
    float _transparentBg;
";

fn header(inputs: &[InputDecl], passes: &[PassDescriptor]) -> String {
    let mut out = String::from(PRELUDE);
    let mut flags = Vec::new();

    for input in inputs {
        let name = &input.name;
        match input.kind {
            InputKind::Float | InputKind::Long => {
                let _ = writeln!(out, "    float {name};");
            }
            InputKind::Bool => {
                let member = bool_member_name(name);
                let _ = writeln!(out, "    int {member};");
                flags.push(format!("#define {name} ({member} != 0)"));
            }
            InputKind::Color => {
                let _ = writeln!(out, "    vec4 {name};");
            }
            InputKind::Point2D => {
                let _ = writeln!(out, "    vec2 {name};");
            }
            InputKind::Text => {
                for slot in 0..input.text_length() {
                    let _ = writeln!(out, "    float {name}_{slot};");
                }
                let _ = writeln!(out, "    float {name}_len;");
            }
            InputKind::Image | InputKind::Unknown => {}
        }
    }
    out.push_str("};\n");
    for flag in flags {
        out.push_str(&flag);
        out.push('\n');
    }

    out.push_str("layout(set = 1, binding = 0) uniform sampler isf_sampler;\n");
    for (index, name) in texture_slots(inputs, passes).iter().enumerate() {
        let _ = writeln!(
            out,
            "layout(set = 1, binding = {binding}) uniform texture2D {name}_texture;",
            binding = index + 1
        );
        let _ = writeln!(out, "#define {name} sampler2D({name}_texture, isf_sampler)");
    }
    out
}

fn footer(key_alpha: bool) -> String {
    let mut out = String::from(
        r"void main() {
#undef gl_FragCoord
    vec2 isf_builtinCoord = gl_FragCoord.xy;
#define gl_FragCoord isf_FragCoord
    isf_FragCoord = vec4(isf_builtinCoord.x, RENDERSIZE.y - isf_builtinCoord.y, 0.0, 1.0);
    isf_FragColor = vec4(0.0);
    isf_main();
",
    );
    if key_alpha {
        out.push_str(
            r"    if (_transparentBg > 0.5) {
        float isf_luma = dot(isf_FragColor.rgb, vec3(0.299, 0.587, 0.114));
        isf_FragColor.a = smoothstep(0.02, 0.15, isf_luma);
    }
",
        );
    }
    out.push_str("}\n");
    out
}

/// Full-screen triangle shared by every layer and the compositor.
pub const VERTEX_SHADER: &str = r"#version 450
layout(location = 0) out vec2 isf_FragNormCoord;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -1.0),
    vec2(3.0, -1.0),
    vec2(-1.0, 3.0)
);

void main() {
    vec2 pos = positions[uint(gl_VertexIndex)];
    isf_FragNormCoord = pos * 0.5 + vec2(0.5, 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r#"/*{
    "INPUTS": [
        { "NAME": "speed", "TYPE": "float", "DEFAULT": 1.0 },
        { "NAME": "glow", "TYPE": "bool" },
        { "NAME": "tint", "TYPE": "color" },
        { "NAME": "photo", "TYPE": "image" },
        { "NAME": "caption", "TYPE": "text", "MAX_LENGTH": 3 }
    ],
    "PASSES": [ { "TARGET": "buf", "PERSISTENT": true }, {} ]
}*/
#version 100
precision highp float;
void main() {
    gl_FragColor = vec4(speed);
}
"#;

    #[test]
    fn header_declares_environment_and_inputs() {
        let built = build(SHADER).expect("build shader");
        let source = &built.source;

        for member in ["float TIME;", "vec2 RENDERSIZE;", "int PASSINDEX;", "int FRAMEINDEX;", "vec2 mouseDelta;", "float audioHigh;"] {
            assert!(source.contains(member), "missing {member}");
        }
        assert!(source.contains("    float speed;"));
        assert!(source.contains("    int isf_flag_glow;"));
        assert!(source.contains("#define glow (isf_flag_glow != 0)"));
        assert!(source.contains("    vec4 tint;"));
        assert!(source.contains("    float caption_2;"));
        assert!(source.contains("    float caption_len;"));
        assert!(source.contains("uniform texture2D photo_texture;"));
        assert!(source.contains("#define buf sampler2D(buf_texture, isf_sampler)"));
        assert_eq!(
            built.texture_names(),
            vec!["audioFFT", "varFontTex", "fontAtlasTex", "inputImage", "photo", "buf"]
        );
        assert_eq!(built.passes.len(), 2);
    }

    #[test]
    fn header_line_count_maps_back_to_user_lines() {
        let built = build(SHADER).expect("build shader");
        let lines: Vec<&str> = built.source.lines().collect();
        let user_line = SHADER
            .lines()
            .position(|line| line.contains("gl_FragColor = vec4(speed)"))
            .expect("user line")
            + 1;
        assert_eq!(
            lines[built.header_line_count + user_line - 1].trim(),
            "gl_FragColor = vec4(speed);"
        );
        assert!(!built.source.contains("#version 100"));
        assert!(!built.source.contains("precision highp"));
    }

    #[test]
    fn entry_point_is_wrapped_with_alpha_key() {
        let built = build(SHADER).expect("build shader");
        assert!(built.wraps_entry_point);
        assert!(built.source.contains("void isf_main() {"));
        assert!(built.source.contains("isf_main();"));
        assert!(built.source.contains("smoothstep(0.02, 0.15, isf_luma)"));
    }

    #[test]
    fn transparency_aware_shaders_skip_alpha_key() {
        let source = r#"/*{ "INPUTS": [ { "NAME": "transparentBg", "TYPE": "bool" } ] }*/
void main(void) { gl_FragColor = vec4(0.0); }"#;
        let built = build(source).expect("build shader");
        assert!(built.source.contains("void isf_main(void)"));
        assert!(!built.source.contains("isf_luma"));
    }

    #[test]
    fn entry_point_search_ignores_lookalikes() {
        let body = "void mainImage() {}\nvoid domain() {}\nvoid  main ( ) {}";
        let range = find_entry_point(body).expect("entry point");
        assert_eq!(&body[range.clone()], "main");
        assert!(body[..range.start].ends_with("void  "));
        assert!(find_entry_point("void mainImage(out vec4 c) {}").is_none());
    }

    #[test]
    fn invalid_metadata_is_ignored() {
        let source = "/*{ not json }*/\nvoid main() { gl_FragColor = vec4(1.0); }";
        let built = build(source).expect("build shader");
        assert!(built.inputs.is_empty());
        assert!(built.source.contains("/*{ not json }*/"));
    }

    #[test]
    fn pass_errors_propagate() {
        let source = r#"/*{ "PASSES": [ { "TARGET": "a" } ] }*/ void main() {}"#;
        assert!(matches!(build(source), Err(MetadataError::Passes(_))));
    }
}
