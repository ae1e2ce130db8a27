use std::collections::HashSet;
use std::ops::Range;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::expr;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to parse shader metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pass list: {0}")]
    Passes(String),
}

/// Declarative header embedded at the top of a layer shader.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passes: Vec<PassDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum InputKind {
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "color")]
    Color,
    #[serde(rename = "point2D")]
    Point2D,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "text")]
    Text,
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InputKind::Float => "float",
            InputKind::Bool => "bool",
            InputKind::Color => "color",
            InputKind::Point2D => "point2D",
            InputKind::Image => "image",
            InputKind::Long => "long",
            InputKind::Text => "text",
            InputKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character slots used by a text input that omits `MAX_LENGTH`.
pub const DEFAULT_TEXT_LENGTH: usize = 12;

/// One entry of the `INPUTS` array.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InputDecl {
    pub name: String,
    #[serde(rename = "TYPE")]
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl InputDecl {
    pub fn new(name: impl Into<String>, kind: InputKind) -> Self {
        Self {
            name: name.into(),
            kind,
            label: None,
            default: None,
            min: None,
            max: None,
            values: Vec::new(),
            labels: Vec::new(),
            max_length: None,
        }
    }

    /// Scalar range used when external feeds are mapped onto this input.
    /// Non-numeric bounds fall back to `0..1`.
    pub fn scalar_range(&self) -> (f32, f32) {
        let min = self.min.as_ref().and_then(|v| v.as_f64()).unwrap_or(0.0);
        let max = self.max.as_ref().and_then(|v| v.as_f64()).unwrap_or(1.0);
        (min as f32, max as f32)
    }

    pub fn text_length(&self) -> usize {
        self.max_length.unwrap_or(DEFAULT_TEXT_LENGTH).max(1)
    }
}

/// One entry of the `PASSES` array.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PassDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub persistent: bool,
    #[serde(
        default,
        deserialize_with = "deserialize_expression",
        skip_serializing_if = "Option::is_none"
    )]
    pub width: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_expression",
        skip_serializing_if = "Option::is_none"
    )]
    pub height: Option<String>,
}

impl PassDescriptor {
    /// Named output of the pass; `None` marks the final pass.
    pub fn output(&self) -> Option<&str> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn is_final(&self) -> bool {
        self.output().is_none()
    }

    /// Resolves `WIDTH`/`HEIGHT` against the layer resolution.
    pub fn resolve_size(&self, width: u32, height: u32) -> (u32, u32) {
        let resolve = |expression: Option<&str>, fallback: u32| {
            expression
                .and_then(|text| expr::evaluate(text, width as f64, height as f64))
                .filter(|value| value.is_finite())
                .map(|value| value.floor().max(1.0) as u32)
                .unwrap_or(fallback)
        };
        (
            resolve(self.width.as_deref(), width),
            resolve(self.height.as_deref(), height),
        )
    }
}

impl Metadata {
    pub fn parse(json: &str) -> Result<Self, MetadataError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Checks that a pass list has exactly one final pass and that named
    /// outputs are unique and do not shadow declared inputs.
    pub fn validate_passes(&self) -> Result<(), MetadataError> {
        if self.passes.is_empty() {
            return Ok(());
        }

        let finals = self.passes.iter().filter(|pass| pass.is_final()).count();
        if finals != 1 {
            return Err(MetadataError::Passes(format!(
                "expected exactly one pass without TARGET, found {finals}"
            )));
        }

        let inputs: HashSet<&str> = self.inputs.iter().map(|input| input.name.as_str()).collect();
        let mut seen = HashSet::new();
        for name in self.passes.iter().filter_map(PassDescriptor::output) {
            if !seen.insert(name) {
                return Err(MetadataError::Passes(format!(
                    "pass target '{name}' is declared more than once"
                )));
            }
            if inputs.contains(name) {
                return Err(MetadataError::Passes(format!(
                    "pass target '{name}' collides with a declared input"
                )));
            }
        }
        Ok(())
    }
}

/// Location of the JSON metadata comment inside a shader source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlock<'a> {
    pub json: &'a str,
    /// Byte range of the whole comment, delimiters included.
    pub span: Range<usize>,
}

/// Finds the first `/* { ... } */` comment whose body is a JSON object.
pub fn extract(source: &str) -> Option<MetadataBlock<'_>> {
    let mut cursor = 0;
    while let Some(offset) = source[cursor..].find("/*") {
        let open = cursor + offset;
        let body_start = open + 2;
        cursor = body_start;

        let body = &source[body_start..];
        if !body.trim_start().starts_with('{') {
            continue;
        }

        let mut search = 0;
        while let Some(close) = body[search..].find("*/") {
            let close = search + close;
            let inner = body[..close].trim();
            if inner.starts_with('{') && inner.ends_with('}') {
                return Some(MetadataBlock {
                    json: inner,
                    span: open..body_start + close + 2,
                });
            }
            search = close + 2;
        }
        return None;
    }
    None
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Bool(bool),
        Num(f64),
        Str(String),
    }

    let helper: Option<Helper> = Option::deserialize(deserializer)?;
    Ok(match helper {
        None => false,
        Some(Helper::Bool(value)) => value,
        Some(Helper::Num(value)) => value != 0.0,
        Some(Helper::Str(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            other => {
                return Err(de::Error::custom(format!(
                    "invalid PERSISTENT value '{other}'"
                )))
            }
        },
    })
}

fn deserialize_expression<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Str(String),
        Num(f64),
    }

    let helper: Option<Helper> = Option::deserialize(deserializer)?;
    Ok(match helper {
        None => None,
        Some(Helper::Str(raw)) if raw.trim().is_empty() => None,
        Some(Helper::Str(raw)) => Some(raw),
        Some(Helper::Num(value)) => Some(value.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"/*{
    "DESCRIPTION": "trail",
    "INPUTS": [
        { "NAME": "speed", "TYPE": "float", "DEFAULT": 0.5, "MIN": 0.0, "MAX": 2.0 },
        { "NAME": "center", "TYPE": "point2D", "MIN": [0, 0], "MAX": [1, 1] },
        { "NAME": "mode", "TYPE": "long", "VALUES": [0, 1, 2], "LABELS": ["a", "b", "c"] },
        { "NAME": "wobble", "TYPE": "audioFFT" }
    ],
    "PASSES": [
        { "TARGET": "trail", "PERSISTENT": true, "WIDTH": "$WIDTH/2" },
        { }
    ]
}*/
void main() { gl_FragColor = vec4(1.0); }
"#;

    #[test]
    fn extracts_and_parses_metadata() {
        let block = extract(SOURCE).expect("metadata block");
        assert_eq!(block.span.start, 0);
        assert!(SOURCE[block.span.clone()].ends_with("*/"));

        let metadata = Metadata::parse(block.json).expect("parse metadata");
        assert_eq!(metadata.description.as_deref(), Some("trail"));
        assert_eq!(metadata.inputs.len(), 4);
        assert_eq!(metadata.inputs[0].scalar_range(), (0.0, 2.0));
        assert_eq!(metadata.inputs[1].scalar_range(), (0.0, 1.0));
        assert_eq!(metadata.inputs[2].labels.len(), 3);
        assert_eq!(metadata.inputs[3].kind, InputKind::Unknown);

        assert_eq!(metadata.passes.len(), 2);
        assert_eq!(metadata.passes[0].output(), Some("trail"));
        assert!(metadata.passes[0].persistent);
        assert!(metadata.passes[1].is_final());
        metadata.validate_passes().expect("valid passes");
    }

    #[test]
    fn skips_non_json_comments() {
        let source = "/* plain comment */\n/* { \"INPUTS\": [] } */\nvoid main() {}";
        let block = extract(source).expect("metadata block");
        assert_eq!(block.json, "{ \"INPUTS\": [] }");
        assert!(extract("// nothing here\nvoid main() {}").is_none());
    }

    #[test]
    fn pass_sizes_follow_expressions() {
        let pass = PassDescriptor {
            width: Some("$WIDTH / 2".into()),
            height: Some("garbage".into()),
            ..PassDescriptor::default()
        };
        assert_eq!(pass.resolve_size(1920, 1080), (960, 1080));
        assert_eq!(PassDescriptor::default().resolve_size(64, 32), (64, 32));
    }

    #[test]
    fn rejects_missing_or_duplicate_final_pass() {
        let mut metadata = Metadata {
            passes: vec![PassDescriptor {
                target: Some("a".into()),
                ..PassDescriptor::default()
            }],
            ..Metadata::default()
        };
        assert!(matches!(
            metadata.validate_passes(),
            Err(MetadataError::Passes(_))
        ));

        metadata.passes.push(PassDescriptor::default());
        metadata.passes.push(PassDescriptor {
            target: Some("".into()),
            ..PassDescriptor::default()
        });
        assert!(metadata.validate_passes().is_err());
    }

    #[test]
    fn rejects_duplicate_targets() {
        let named = PassDescriptor {
            target: Some("buf".into()),
            ..PassDescriptor::default()
        };
        let metadata = Metadata {
            passes: vec![named.clone(), named, PassDescriptor::default()],
            ..Metadata::default()
        };
        let err = metadata.validate_passes().unwrap_err();
        assert!(err.to_string().contains("buf"));
    }

    #[test]
    fn persistent_accepts_numbers_and_strings() {
        let json = r#"{ "PASSES": [ { "TARGET": "a", "PERSISTENT": 1 }, { "TARGET": "b", "PERSISTENT": "false" }, {} ] }"#;
        let metadata = Metadata::parse(json).expect("parse");
        assert!(metadata.passes[0].persistent);
        assert!(!metadata.passes[1].persistent);
    }
}
