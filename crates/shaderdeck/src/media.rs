use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use compositor::{MediaFrame, MediaKind, MediaSource};

/// Still images decoded once at startup and served to layers by id.
#[derive(Debug, Default)]
pub struct ImageLibrary {
    frames: BTreeMap<String, MediaFrame>,
}

impl ImageLibrary {
    /// Decodes every entry; unreadable files are logged and skipped.
    pub fn load(entries: &BTreeMap<String, std::path::PathBuf>) -> Self {
        let mut library = Self::default();
        for (id, path) in entries {
            match decode(path) {
                Ok(frame) => {
                    tracing::debug!(media = %id, width = frame.width, height = frame.height, "decoded media");
                    library.frames.insert(id.clone(), frame);
                }
                Err(err) => {
                    tracing::warn!(media = %id, path = %path.display(), error = %format!("{err:#}"), "media skipped");
                }
            }
        }
        library
    }

    pub fn count(&self) -> usize {
        self.frames.len()
    }
}

impl MediaSource for ImageLibrary {
    fn ids(&self) -> Vec<String> {
        self.frames.keys().cloned().collect()
    }

    fn frame(&self, id: &str) -> Option<MediaFrame> {
        self.frames.get(id).cloned()
    }
}

fn decode(path: &Path) -> Result<MediaFrame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok(MediaFrame {
        kind: MediaKind::Image,
        width,
        height,
        pixels: Arc::from(image.into_raw()),
        serial: 0,
    })
}
