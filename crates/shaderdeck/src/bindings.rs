//! Applies a [`DeckConfig`] to an [`Engine`].
//!
//! Problems with a single layer (unreadable source, bad input value, unknown
//! media) are logged and skipped so the rest of the deck still renders.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use compositor::{
    feeds, Axis, BackgroundFill, BlendMode, Engine, EngineConfig, GpuDevice, GpuOptions, LandmarkBinding,
    LandmarkGroup, LayerId, MediaSource, OverlayTransform,
};
use deckconfig::{
    BackgroundConfig, BackgroundMode, DeckConfig, LandmarkConfig, LayerConfig, OutputConfig, OverlayConfig,
    PowerSetting,
};
use isf::{InputDecl, InputValue};

pub fn engine_config(deck: &DeckConfig, size: Option<(u32, u32)>) -> EngineConfig {
    let (width, height) = size.unwrap_or((deck.output.width, deck.output.height));
    EngineConfig {
        width,
        height,
        scene_upload_interval: deck.output.scene_upload_interval,
        audio_stale_after: deck.feeds.audio_stale_after,
        landmark_stale_after: deck.feeds.landmark_stale_after,
    }
}

pub fn gpu_options(output: &OutputConfig) -> GpuOptions {
    GpuOptions {
        power_preference: match output.power {
            PowerSetting::High => compositor::gpu::PowerPreference::HighPerformance,
            PowerSetting::Low => compositor::gpu::PowerPreference::LowPower,
        },
        frame_latency: output.frame_latency,
        vsync: output.vsync,
    }
}

pub fn background_fill(background: &BackgroundConfig) -> BackgroundFill {
    match background.mode {
        BackgroundMode::None => BackgroundFill::None,
        BackgroundMode::Transparent => BackgroundFill::Transparent,
        BackgroundMode::Color => BackgroundFill::Color(background.color.unwrap_or([0.0; 3])),
        BackgroundMode::Media => background
            .media
            .clone()
            .map_or(BackgroundFill::None, BackgroundFill::Media),
    }
}

pub fn overlay_transform(overlay: &OverlayConfig) -> OverlayTransform {
    OverlayTransform {
        translate: overlay.translate,
        scale: overlay.scale,
        rotate: overlay.rotate,
    }
}

pub fn landmark_binding(config: &LandmarkConfig) -> Result<LandmarkBinding> {
    let group: LandmarkGroup = config.group.parse().map_err(|err: String| anyhow!(err))?;
    let axis: Axis = config.axis.parse().map_err(|err: String| anyhow!(err))?;
    let index = match (&config.part, config.index) {
        (Some(part), _) => feeds::body_part(group, part)
            .ok_or_else(|| anyhow!("unknown {group:?} landmark '{part}'"))?,
        (None, Some(index)) => index,
        (None, None) => return Err(anyhow!("landmark binding needs a part or an index")),
    };
    Ok(LandmarkBinding {
        input: config.input.clone(),
        group,
        index,
        axis,
    })
}

/// Converts a config value for a declared input; `None` when the types disagree.
pub fn input_value(decl: &InputDecl, value: &toml::Value) -> Option<InputValue> {
    let json = serde_json::to_value(value).ok()?;
    InputValue::from_json(decl, &json)
}

/// Pushes the whole deck into the engine.
pub fn apply_deck<D: GpuDevice>(engine: &mut Engine<D>, deck: &DeckConfig, media: &dyn MediaSource) {
    engine.set_background(background_fill(&deck.background));
    engine.set_overlay_transform(overlay_transform(&deck.overlay));
    engine.set_scene_flip(deck.scene.flip_h, deck.scene.flip_v);

    for (name, layer) in deck.layers_in_order() {
        let id = match name.parse::<LayerId>() {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(layer = %name, error = %err, "layer skipped");
                continue;
            }
        };
        apply_layer(engine, id, layer, media);
    }
}

pub fn apply_layer<D: GpuDevice>(engine: &mut Engine<D>, id: LayerId, layer: &LayerConfig, media: &dyn MediaSource) {
    engine.set_visible(id, layer.visible);
    engine.set_opacity(id, layer.opacity);
    match layer.blend.parse::<BlendMode>() {
        Ok(blend) => engine.set_blend(id, blend),
        Err(err) => tracing::warn!(layer = %id, error = %err, "blend mode ignored"),
    }
    if let Some(transparent) = layer.transparent_bg {
        engine.set_transparent_bg(id, transparent);
    }
    engine.set_hand_as_mouse(id, layer.hand_as_mouse);

    if let Some(path) = &layer.source {
        load_source(engine, id, path);
    }

    for (name, raw) in &layer.inputs {
        let Some(decl) = engine.inputs(id).iter().find(|decl| &decl.name == name).cloned() else {
            tracing::warn!(layer = %id, input = %name, "configured input is not declared by the shader");
            continue;
        };
        let Some(value) = input_value(&decl, raw) else {
            tracing::warn!(layer = %id, input = %name, kind = ?decl.kind, "configured value has the wrong type");
            continue;
        };
        if let Err(err) = engine.set_input(id, name, value) {
            tracing::warn!(layer = %id, input = %name, error = %err, "input rejected");
        }
    }

    for (input, media_id) in &layer.media {
        if let Err(err) = engine.bind_media(id, input, media_id, media) {
            tracing::warn!(layer = %id, input = %input, media = %media_id, error = %err, "media binding rejected");
        }
    }
    for (input, media_id) in engine.auto_bind_media(id, media) {
        tracing::debug!(layer = %id, input = %input, media = %media_id, "media bound automatically");
    }

    for config in &layer.landmarks {
        let result = landmark_binding(config)
            .and_then(|binding| engine.bind_landmark(id, binding).map_err(anyhow::Error::from));
        if let Err(err) = result {
            tracing::warn!(layer = %id, input = %config.input, error = %err, "landmark binding rejected");
        }
    }
}

/// Reads `path` and installs it as the layer's source, logging the outcome.
pub fn load_source<D: GpuDevice>(engine: &mut Engine<D>, id: LayerId, path: &Path) {
    let text = match std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display())) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(layer = %id, error = %format!("{err:#}"), "layer source unavailable");
            return;
        }
    };
    match engine.set_source(id, &text) {
        Ok(()) => tracing::info!(layer = %id, path = %path.display(), "layer source loaded"),
        Err(err) => tracing::warn!(layer = %id, path = %path.display(), error = %err, "layer source rejected"),
    }
}
