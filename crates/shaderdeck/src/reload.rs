use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

use anyhow::{Context, Result};
use compositor::LayerId;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};

pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Maps watched file paths to the layers that load them.
#[derive(Debug, Default)]
struct SourceIndex {
    files: BTreeMap<PathBuf, Vec<(LayerId, PathBuf)>>,
}

impl SourceIndex {
    fn insert(&mut self, key: PathBuf, layer: LayerId, path: &Path) {
        self.remove_layer(layer);
        self.files.entry(key).or_default().push((layer, path.to_path_buf()));
    }

    fn remove_layer(&mut self, layer: LayerId) {
        for entries in self.files.values_mut() {
            entries.retain(|(id, _)| *id != layer);
        }
        self.files.retain(|_, entries| !entries.is_empty());
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Each affected layer once, in slot order.
    fn changed<I>(&self, paths: I) -> Vec<(LayerId, PathBuf)>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut changed = BTreeSet::new();
        for path in paths {
            if let Some(entries) = self.files.get(&path) {
                changed.extend(entries.iter().cloned());
            }
        }
        changed.into_iter().collect()
    }
}

/// Watches layer source files through the platform notifier.
///
/// The parent directory is watched rather than the file so editors that
/// save by rename keep reporting. Events queue in the channel until
/// [`SourceWatcher::poll`] drains them.
pub struct SourceWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    rx: Receiver<DebounceEventResult>,
    directories: BTreeSet<PathBuf>,
    index: SourceIndex,
}

impl SourceWatcher {
    pub fn new(debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let debouncer = new_debouncer(debounce, tx).context("failed to start file watcher")?;
        Ok(Self {
            debouncer,
            rx,
            directories: BTreeSet::new(),
            index: SourceIndex::default(),
        })
    }

    pub fn watch(&mut self, layer: LayerId, path: &Path) -> Result<()> {
        let (directory, key) = watch_key(path)?;
        if !self.directories.contains(&directory) {
            self.debouncer
                .watcher()
                .watch(&directory, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", directory.display()))?;
            self.directories.insert(directory);
        }
        self.index.insert(key, layer, path);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drains queued events and returns the layers whose source changed.
    /// Files that are missing at poll time are skipped; their recreation
    /// arrives as a later event.
    pub fn poll(&mut self) -> Vec<(LayerId, PathBuf)> {
        let mut paths = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(events)) => paths.extend(
                    events
                        .into_iter()
                        .filter(|event| event.kind == DebouncedEventKind::Any)
                        .filter(|event| event.path.exists())
                        .map(|event| event.path),
                ),
                Ok(Err(err)) => tracing::warn!(error = %err, "source watcher error"),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::error!("source watcher disconnected");
                    break;
                }
            }
        }
        self.index.changed(paths)
    }
}

/// Canonical parent directory and the path events for the file will carry.
fn watch_key(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let directory = parent
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", parent.display()))?;
    let key = directory.join(name);
    Ok((directory, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn index_reports_each_layer_once() {
        let mut index = SourceIndex::default();
        index.insert(PathBuf::from("/deck/a.fs"), LayerId::Text, Path::new("a.fs"));
        index.insert(PathBuf::from("/deck/a.fs"), LayerId::Av, Path::new("./a.fs"));
        index.insert(PathBuf::from("/deck/b.fs"), LayerId::Effects, Path::new("b.fs"));

        let changed = index.changed([
            PathBuf::from("/deck/a.fs"),
            PathBuf::from("/deck/a.fs"),
            PathBuf::from("/deck/other.txt"),
        ]);
        assert_eq!(
            changed,
            vec![
                (LayerId::Av, PathBuf::from("./a.fs")),
                (LayerId::Text, PathBuf::from("a.fs")),
            ]
        );
    }

    #[test]
    fn rewatching_a_layer_replaces_its_file() {
        let mut index = SourceIndex::default();
        index.insert(PathBuf::from("/deck/old.fs"), LayerId::Overlay, Path::new("old.fs"));
        index.insert(PathBuf::from("/deck/new.fs"), LayerId::Overlay, Path::new("new.fs"));

        assert!(index.changed([PathBuf::from("/deck/old.fs")]).is_empty());
        assert_eq!(
            index.changed([PathBuf::from("/deck/new.fs")]),
            vec![(LayerId::Overlay, PathBuf::from("new.fs"))]
        );
        index.remove_layer(LayerId::Overlay);
        assert!(index.is_empty());
    }

    #[test]
    fn keys_resolve_through_the_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.fs");

        let (directory, key) = watch_key(&path).unwrap();
        assert_eq!(directory, dir.path().canonicalize().unwrap());
        assert_eq!(key, directory.join("later.fs"));
        assert!(watch_key(&dir.path().join("missing").join("x.fs")).is_err());
    }

    #[test]
    #[ignore] // Depends on the host's file notification timing.
    fn reports_edits_to_watched_sources() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layer.fs");
        fs::write(&path, "void main() {}").unwrap();

        let mut watcher = SourceWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(LayerId::Effects, &path).unwrap();
        assert!(watcher.poll().is_empty());

        fs::write(&path, "void main() { gl_FragColor = vec4(1.0); }").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut changed = Vec::new();
        while changed.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            changed = watcher.poll();
        }
        assert_eq!(changed, vec![(LayerId::Effects, path)]);
    }
}
