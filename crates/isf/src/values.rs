use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{InputDecl, InputKind};

/// Character code written for spaces and unused text slots.
pub const TEXT_BLANK: u8 = 26;

/// Scalar or vector payload for one uniform member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformData {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

/// Uniform member that stores a bool input (bools are not host-shareable).
pub fn bool_member_name(name: &str) -> String {
    format!("isf_flag_{name}")
}

/// Current value of one declared, non-image input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum InputValue {
    Float(f32),
    Bool(bool),
    Point([f32; 2]),
    Color([f32; 4]),
    Long(i32),
    Text(TextValue),
}

/// Fixed-length text, uploaded as one character code per slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextValue {
    text: String,
    max_length: usize,
}

impl TextValue {
    pub fn new(text: impl Into<String>, max_length: usize) -> Self {
        Self {
            text: text.into().to_uppercase(),
            max_length: max_length.max(1),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Visible characters, ignoring trailing whitespace.
    pub fn len(&self) -> usize {
        self.text.trim_end().chars().count().min(self.max_length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `A`..`Z` map to 0..25; spaces and unused slots to [`TEXT_BLANK`].
    pub fn codes(&self) -> Vec<u8> {
        let mut chars = self.text.chars();
        (0..self.max_length)
            .map(|_| match chars.next() {
                None | Some(' ') => TEXT_BLANK,
                Some(ch) => (ch as i64 - 'A' as i64).clamp(0, 25) as u8,
            })
            .collect()
    }

    pub fn refit(&self, max_length: usize) -> Self {
        Self::new(self.text.clone(), max_length)
    }
}

impl InputValue {
    /// Default for a declaration; `None` for inputs that are not uniforms.
    pub fn default_for(decl: &InputDecl) -> Option<Self> {
        let default = decl.default.as_ref();
        let value = match decl.kind {
            InputKind::Float => InputValue::Float(default.and_then(Value::as_f64).unwrap_or(0.0) as f32),
            InputKind::Long => InputValue::Long(default.and_then(Value::as_f64).unwrap_or(0.0) as i32),
            InputKind::Bool => InputValue::Bool(default.is_some_and(truthy)),
            InputKind::Color => InputValue::Color(
                default
                    .and_then(|value| floats::<4>(value))
                    .unwrap_or([1.0; 4]),
            ),
            InputKind::Point2D => {
                InputValue::Point(default.and_then(|value| floats::<2>(value)).unwrap_or([0.0; 2]))
            }
            InputKind::Text => InputValue::Text(TextValue::new(
                default.and_then(Value::as_str).unwrap_or_default(),
                decl.text_length(),
            )),
            InputKind::Image | InputKind::Unknown => return None,
        };
        Some(value)
    }

    /// Interprets loosely-typed JSON (config files, remote edits) for `decl`.
    pub fn from_json(decl: &InputDecl, value: &Value) -> Option<Self> {
        match decl.kind {
            InputKind::Float => value.as_f64().map(|v| InputValue::Float(v as f32)),
            InputKind::Long => value.as_f64().map(|v| InputValue::Long(v as i32)),
            InputKind::Bool => Some(InputValue::Bool(truthy(value))),
            InputKind::Color => floats::<4>(value)
                .or_else(|| floats::<3>(value).map(|[r, g, b]| [r, g, b, 1.0]))
                .map(InputValue::Color),
            InputKind::Point2D => floats::<2>(value).map(InputValue::Point),
            InputKind::Text => value
                .as_str()
                .map(|text| InputValue::Text(TextValue::new(text, decl.text_length()))),
            InputKind::Image | InputKind::Unknown => None,
        }
    }

    pub fn kind(&self) -> InputKind {
        match self {
            InputValue::Float(_) => InputKind::Float,
            InputValue::Bool(_) => InputKind::Bool,
            InputValue::Point(_) => InputKind::Point2D,
            InputValue::Color(_) => InputKind::Color,
            InputValue::Long(_) => InputKind::Long,
            InputValue::Text(_) => InputKind::Text,
        }
    }

    /// Scalar view used by modulation and flag checks.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            InputValue::Float(value) => Some(*value),
            InputValue::Long(value) => Some(*value as f32),
            InputValue::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Carries a previous value over to a (possibly edited) declaration.
    pub fn carry_over(&self, decl: &InputDecl) -> Option<Self> {
        match (self, decl.kind) {
            (InputValue::Text(text), InputKind::Text) => {
                Some(InputValue::Text(text.refit(decl.text_length())))
            }
            (value, kind) if value.kind() == kind => Some(value.clone()),
            _ => None,
        }
    }

    /// Uniform members written for this value under input `name`.
    pub fn uniforms(&self, name: &str) -> Vec<(String, UniformData)> {
        match self {
            InputValue::Float(value) => vec![(name.to_owned(), UniformData::Float(*value))],
            InputValue::Long(value) => vec![(name.to_owned(), UniformData::Float(*value as f32))],
            InputValue::Bool(value) => vec![(bool_member_name(name), UniformData::Int(*value as i32))],
            InputValue::Point(value) => vec![(name.to_owned(), UniformData::Vec2(*value))],
            InputValue::Color(value) => vec![(name.to_owned(), UniformData::Vec4(*value))],
            InputValue::Text(text) => {
                let mut entries: Vec<_> = text
                    .codes()
                    .into_iter()
                    .enumerate()
                    .map(|(index, code)| (format!("{name}_{index}"), UniformData::Float(code as f32)))
                    .collect();
                entries.push((format!("{name}_len"), UniformData::Float(text.len() as f32)));
                entries
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|v| v != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
        Value::Null => false,
    }
}

fn floats<const N: usize>(value: &Value) -> Option<[f32; N]> {
    let items = value.as_array()?;
    if items.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64()? as f32;
    }
    Some(out)
}
