//! File watcher that reports feature artifacts changing on disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info};

use super::version_store::VersionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureEvent {
    /// Created or rewritten.
    Changed { name: String, path: PathBuf },
    Removed { name: String, path: PathBuf },
}

impl FeatureEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Changed { name, .. } | Self::Removed { name, .. } => name,
        }
    }
}

/// Map a raw notify event to feature events. Paths that are not artifacts of
/// `store` (temp files, other extensions) are dropped.
pub fn classify_event(event: &Event, store: &VersionStore) -> Vec<FeatureEvent> {
    let changed = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => true,
        EventKind::Remove(_) => false,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| {
            let name = store.artifact_stem(path)?;
            let path = path.clone();
            Some(if changed {
                FeatureEvent::Changed { name, path }
            } else {
                FeatureEvent::Removed { name, path }
            })
        })
        .collect()
}

/// Watches a feature directory until dropped.
pub struct FeatureWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<FeatureEvent>,
}

impl FeatureWatcher {
    pub fn start(store: Arc<VersionStore>) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let classifier = Arc::clone(&store);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for feature_event in classify_event(&event, &classifier) {
                        debug!(event = ?feature_event, "feature artifact event");
                        if tx.send(feature_event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("Feature watcher error: {}", e),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .context("Failed to create feature watcher")?;

        watcher
            .watch(store.dir(), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", store.dir()))?;
        info!(directory = ?store.dir(), "feature watcher started");

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Next event, or `None` after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<FeatureEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn store() -> (TempDir, VersionStore) {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path(), 3, "rhai").unwrap();
        (dir, store)
    }

    #[test]
    fn test_classify_create_and_modify() {
        let (dir, store) = store();
        let path = dir.path().join("momentum_v2.rhai");

        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        assert_eq!(
            classify_event(&event, &store),
            vec![FeatureEvent::Changed {
                name: "momentum_v2".to_string(),
                path: path.clone()
            }]
        );

        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path);
        assert_eq!(classify_event(&event, &store)[0].name(), "momentum_v2");
    }

    #[test]
    fn test_classify_remove() {
        let (dir, store) = store();
        let path = dir.path().join("trend.rhai");
        let event = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        assert_eq!(
            classify_event(&event, &store),
            vec![FeatureEvent::Removed {
                name: "trend".to_string(),
                path
            }]
        );
    }

    #[test]
    fn test_classify_ignores_foreign_paths_and_kinds() {
        let (dir, store) = store();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(dir.path().join(".tmpXYZ"))
            .add_path(dir.path().join("readme.md"));
        assert!(classify_event(&event, &store).is_empty());

        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(dir.path().join("trend.rhai"));
        assert!(classify_event(&event, &store).is_empty());
    }
}
