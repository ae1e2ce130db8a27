//! Deck configuration: output settings, the seven layer slots, media and
//! feed timing, loaded from TOML.
//!
//! ```toml
//! version = 1
//!
//! [output]
//! width = 1280
//! height = 720
//!
//! [layers.background]
//! source = "shaders/plasma.fs"
//! inputs = { speed = 2.0 }
//! ```
//!
//! Relative paths are resolved against the directory of the config file by
//! [`DeckConfig::load`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Layer slot names accepted under `[layers]`, bottom to top.
pub const LAYER_NAMES: [&str; 7] = ["background", "media", "3d", "av", "effects", "text", "overlay"];
const LAYER_ALIASES: [(&str, &str); 1] = [("scene", "3d")];

const BLEND_MODES: [&str; 5] = ["normal", "add", "multiply", "screen", "overlay"];
const LANDMARK_GROUPS: [&str; 4] = ["hand", "face", "pose", "body"];
const AXES: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeckConfig {
    pub version: u32,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub feeds: FeedConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    /// Media id to image file.
    #[serde(default)]
    pub media: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default)]
    pub power: PowerSetting,
    #[serde(default = "default_latency")]
    pub frame_latency: u32,
    #[serde(default = "default_scene_interval")]
    pub scene_upload_interval: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: None,
            vsync: true,
            power: PowerSetting::default(),
            frame_latency: default_latency(),
            scene_upload_interval: default_scene_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    #[default]
    High,
    Low,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    #[serde(default = "default_audio_stale", deserialize_with = "deserialize_duration_or_audio")]
    pub audio_stale_after: Duration,
    #[serde(
        default = "default_landmark_stale",
        deserialize_with = "deserialize_duration_or_landmark"
    )]
    pub landmark_stale_after: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            audio_stale_after: default_audio_stale(),
            landmark_stale_after: default_landmark_stale(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    #[default]
    None,
    Transparent,
    Color,
    Media,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub mode: BackgroundMode,
    #[serde(default)]
    pub color: Option<[f32; 3]>,
    /// Media id, required when `mode = "media"`.
    #[serde(default)]
    pub media: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub translate: [f32; 2],
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Radians.
    #[serde(default)]
    pub rotate: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            translate: [0.0, 0.0],
            scale: 1.0,
            rotate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SceneConfig {
    #[serde(default)]
    pub flip_h: bool,
    #[serde(default)]
    pub flip_v: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayerConfig {
    pub source: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_blend")]
    pub blend: String,
    /// `None` keeps the layer's own default.
    #[serde(default)]
    pub transparent_bg: Option<bool>,
    #[serde(default)]
    pub hand_as_mouse: bool,
    /// Initial input values, checked against the shader's declarations when
    /// the source is compiled.
    #[serde(default)]
    pub inputs: BTreeMap<String, toml::Value>,
    /// Image input name to media id.
    #[serde(default)]
    pub media: BTreeMap<String, String>,
    #[serde(default)]
    pub landmarks: Vec<LandmarkConfig>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            source: None,
            visible: true,
            opacity: 1.0,
            blend: default_blend(),
            transparent_bg: None,
            hand_as_mouse: false,
            inputs: BTreeMap::new(),
            media: BTreeMap::new(),
            landmarks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LandmarkConfig {
    pub input: String,
    pub group: String,
    /// Body part name, e.g. "Index Tip". Mutually exclusive with `index`.
    #[serde(default)]
    pub part: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    pub axis: String,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_latency() -> u32 {
    2
}

fn default_scene_interval() -> u32 {
    2
}

fn default_scale() -> f32 {
    1.0
}

fn default_opacity() -> f32 {
    1.0
}

fn default_blend() -> String {
    "normal".to_owned()
}

fn default_audio_stale() -> Duration {
    Duration::from_millis(250)
}

fn default_landmark_stale() -> Duration {
    Duration::from_millis(500)
}

fn deserialize_duration_or_audio<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_audio_stale))
}

fn deserialize_duration_or_landmark<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_landmark_stale))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Canonical slot name for `name`, accepting the `scene` alias.
pub fn canonical_layer(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_ascii_lowercase();
    LAYER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| *canonical)
        .or_else(|| LAYER_NAMES.iter().copied().find(|known| *known == lowered))
}

impl DeckConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: DeckConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads, parses and validates `path`, then resolves relative source and
    /// media paths against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for path in self.media.values_mut() {
            resolve(path);
        }
        for layer in self.layers.values_mut() {
            if let Some(source) = layer.source.as_mut() {
                resolve(source);
            }
        }
    }

    /// Layers in stacking order, keyed by canonical slot name.
    pub fn layers_in_order(&self) -> Vec<(&'static str, &LayerConfig)> {
        let mut ordered: Vec<(&'static str, &LayerConfig)> = self
            .layers
            .iter()
            .filter_map(|(name, layer)| canonical_layer(name).map(|canonical| (canonical, layer)))
            .collect();
        ordered.sort_by_key(|(name, _)| LAYER_NAMES.iter().position(|known| known == name));
        ordered
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let output = &self.output;
        if output.width == 0 || output.height == 0 {
            return Err(ConfigError::Invalid("output width and height must be > 0".into()));
        }
        if let Some(fps) = output.fps {
            if !fps.is_finite() || fps < 0.0 {
                return Err(ConfigError::Invalid("output.fps must be >= 0".into()));
            }
        }
        if output.scene_upload_interval == 0 {
            return Err(ConfigError::Invalid("output.scene_upload_interval must be >= 1".into()));
        }

        match self.background.mode {
            BackgroundMode::Color if self.background.color.is_none() => {
                return Err(ConfigError::Invalid(
                    "background mode 'color' requires background.color".into(),
                ));
            }
            BackgroundMode::Media => {
                let Some(media) = &self.background.media else {
                    return Err(ConfigError::Invalid(
                        "background mode 'media' requires background.media".into(),
                    ));
                };
                self.check_media(media, "background")?;
            }
            _ => {}
        }

        if !(self.overlay.scale.is_finite() && self.overlay.scale > 0.0) {
            return Err(ConfigError::Invalid("overlay.scale must be > 0".into()));
        }

        let mut seen = Vec::new();
        for (name, layer) in &self.layers {
            let Some(canonical) = canonical_layer(name) else {
                return Err(ConfigError::Invalid(format!(
                    "unknown layer '{name}'; expected one of {}",
                    LAYER_NAMES.join(", ")
                )));
            };
            if seen.contains(&canonical) {
                return Err(ConfigError::Invalid(format!("layer '{canonical}' is configured twice")));
            }
            seen.push(canonical);
            validate_layer(canonical, layer)?;
            for media in layer.media.values() {
                self.check_media(media, canonical)?;
            }
        }

        Ok(())
    }

    fn check_media(&self, id: &str, context: &str) -> Result<(), ConfigError> {
        if self.media.contains_key(id) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!("{context} references unknown media '{id}'")))
        }
    }
}

fn validate_layer(name: &str, layer: &LayerConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&layer.opacity) {
        return Err(ConfigError::Invalid(format!(
            "layer '{name}' opacity must be within 0..=1"
        )));
    }
    let blend = layer.blend.trim().to_ascii_lowercase();
    if !BLEND_MODES.contains(&blend.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "layer '{name}' has unknown blend mode '{}'",
            layer.blend
        )));
    }
    for landmark in &layer.landmarks {
        if landmark.input.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "layer '{name}' has a landmark binding with an empty input"
            )));
        }
        let group = landmark.group.trim().to_ascii_lowercase();
        if !LANDMARK_GROUPS.contains(&group.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "layer '{name}' landmark '{}' has unknown group '{}'",
                landmark.input, landmark.group
            )));
        }
        let axis = landmark.axis.trim().to_ascii_lowercase();
        if !AXES.contains(&axis.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "layer '{name}' landmark '{}' has unknown axis '{}'",
                landmark.input, landmark.axis
            )));
        }
        if landmark.part.is_some() == landmark.index.is_some() {
            return Err(ConfigError::Invalid(format!(
                "layer '{name}' landmark '{}' needs exactly one of part or index",
                landmark.input
            )));
        }
    }
    Ok(())
}
