use std::path::PathBuf;

use anyhow::{Context, Result};
use compositor::{DeviceState, Driver, Engine, FrameInputs, LayerId, WgpuDevice, WindowConfig};
use deckconfig::DeckConfig;
use tracing_subscriber::EnvFilter;

use crate::bindings::{apply_deck, engine_config, gpu_options, load_source};
use crate::cli::{Cli, Command, RunArgs};
use crate::inspect;
use crate::media::ImageLibrary;
use crate::paths::AppPaths;
use crate::reload::{SourceWatcher, DEBOUNCE};

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();

    match cli.command {
        Command::Run(args) => run_deck(args),
        Command::Check { file } => inspect::run_check(&file),
        Command::Inputs { file } => inspect::run_inputs(&file),
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_config_path(args: &RunArgs) -> Result<PathBuf> {
    if let Some(path) = &args.config {
        return Ok(path.clone());
    }
    let paths = AppPaths::discover()?;
    tracing::debug!(config = %paths.config_dir().display(), "resolved shaderdeck paths");
    Ok(paths.deck_file())
}

fn run_deck(args: RunArgs) -> Result<()> {
    let path = resolve_config_path(&args)?;
    let deck = DeckConfig::load(&path).with_context(|| format!("failed to load deck {}", path.display()))?;
    tracing::info!(config = %path.display(), layers = deck.layers.len(), "starting shaderdeck");

    let config = WindowConfig {
        title: format!("shaderdeck - {}", path.display()),
        engine: engine_config(&deck, args.size),
        gpu: gpu_options(&deck.output),
        target_fps: args.fps.or(deck.output.fps),
    };
    let media = ImageLibrary::load(&deck.media);
    tracing::info!(loaded = media.count(), configured = deck.media.len(), "media library ready");
    let watcher = if args.no_reload {
        None
    } else {
        match SourceWatcher::new(DEBOUNCE) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(error = %err, "hot reload disabled");
                None
            }
        }
    };
    let driver = DeckDriver { deck, media, watcher };
    compositor::run_window(config, driver)
}

struct DeckDriver {
    deck: DeckConfig,
    media: ImageLibrary,
    watcher: Option<SourceWatcher>,
}

impl Driver for DeckDriver {
    fn setup(&mut self, engine: &mut Engine<WgpuDevice>) -> Result<()> {
        apply_deck(engine, &self.deck, &self.media);

        for id in LayerId::ALL {
            let status = engine.status(id);
            if let Some(error) = status.error {
                tracing::warn!(layer = %id, error = %error, "layer starts without a program");
            }
        }

        if let Some(watcher) = self.watcher.as_mut() {
            for (name, layer) in self.deck.layers_in_order() {
                if let (Ok(id), Some(path)) = (name.parse::<LayerId>(), layer.source.as_ref()) {
                    if let Err(err) = watcher.watch(id, path) {
                        tracing::warn!(layer = %id, error = %err, "source will not hot reload");
                    }
                }
            }
            if !watcher.is_empty() {
                tracing::info!("watching layer sources for changes");
            }
        }
        Ok(())
    }

    fn before_frame(&mut self, engine: &mut Engine<WgpuDevice>) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        // Sources cannot be installed until the device is back; events stay queued.
        if engine.device_state() != DeviceState::Normal {
            return;
        }
        for (id, path) in watcher.poll() {
            tracing::debug!(layer = %id, path = %path.display(), "layer source changed");
            load_source(engine, id, &path);
        }
    }

    fn frame_inputs(&mut self) -> FrameInputs<'_> {
        FrameInputs {
            scene: None,
            media: Some(&self.media),
        }
    }
}
