//! File system watcher for plugin hot reload.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::manager::{OperationResult, PluginManager};

/// Configuration for the plugin watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Changes to one plugin closer together than this are coalesced.
    pub debounce: Duration,
    /// File extensions that trigger a change; empty means all.
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            extensions: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set file extensions to watch.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// File created.
    Created,
    /// File modified.
    Modified,
    /// File removed.
    Removed,
}

/// A change inside one plugin directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginChange {
    /// Plugin directory the file belongs to.
    pub plugin_dir: PathBuf,
    /// Changed file.
    pub path: PathBuf,
    /// Change kind.
    pub kind: ChangeKind,
}

/// Top-level plugin directory under `root` that contains `path`.
pub fn plugin_dir_for(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    match relative.components().next()? {
        Component::Normal(first) => Some(root.join(first)),
        _ => None,
    }
}

struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    fn admit(&mut self, key: &Path, now: Instant) -> bool {
        if let Some(last) = self.last.get(key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        self.last.insert(key.to_path_buf(), now);
        true
    }
}

/// Watches a plugin root and reports changes per plugin directory.
pub struct PluginWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    changes: mpsc::UnboundedReceiver<PluginChange>,
}

impl PluginWatcher {
    /// Start watching `root` recursively.
    pub fn new(root: impl AsRef<Path>, config: WatchConfig) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(config.debounce);
        let watch_root = root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Plugin watcher error");
                        return;
                    }
                };
                let kind = match event.kind {
                    EventKind::Create(_) => ChangeKind::Created,
                    EventKind::Modify(_) => ChangeKind::Modified,
                    EventKind::Remove(_) => ChangeKind::Removed,
                    _ => return,
                };

                for path in event.paths {
                    if !config.matches(&path) {
                        continue;
                    }
                    let Some(plugin_dir) = plugin_dir_for(&watch_root, &path) else {
                        continue;
                    };
                    if !debouncer.admit(&plugin_dir, Instant::now()) {
                        continue;
                    }
                    let _ = tx.send(PluginChange {
                        plugin_dir,
                        path,
                        kind,
                    });
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(e.to_string()))?;

        tracing::info!(root = %root.display(), "Plugin watcher started");
        Ok(Self {
            root,
            _watcher: watcher,
            changes: rx,
        })
    }

    /// Canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next change.
    pub async fn next_change(&mut self) -> Option<PluginChange> {
        self.changes.recv().await
    }
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("root", &self.root)
            .finish()
    }
}

/// Reload the registered plugin living in the changed directory.
///
/// Returns `None` when no registered plugin lives there.
pub async fn reload_changed(manager: &PluginManager, change: &PluginChange) -> Option<OperationResult> {
    let name = manager
        .registry()
        .entries()
        .into_iter()
        .find(|e| e.path == change.plugin_dir)
        .map(|e| e.name().to_string())?;

    tracing::debug!(plugin = %name, path = %change.path.display(), "Plugin files changed");
    Some(manager.reload_plugin(&name).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_config_builder() {
        let config = WatchConfig::new()
            .with_debounce(Duration::from_secs(1))
            .with_extensions(vec!["json".to_string()]);

        assert_eq!(config.debounce, Duration::from_secs(1));
        assert!(config.matches(Path::new("plugin.json")));
        assert!(!config.matches(Path::new("index.js")));
        assert!(WatchConfig::default().matches(Path::new("anything")));
    }

    #[test]
    fn test_plugin_dir_for() {
        let root = Path::new("/srv/plugins");
        assert_eq!(
            plugin_dir_for(root, Path::new("/srv/plugins/seo-helper/lib/index.js")),
            Some(PathBuf::from("/srv/plugins/seo-helper"))
        );
        assert_eq!(plugin_dir_for(root, Path::new("/srv/other/x.js")), None);
        assert_eq!(plugin_dir_for(root, root), None);
    }

    #[test]
    fn test_debouncer() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        let dir = Path::new("/p/a");

        assert!(debouncer.admit(dir, start));
        assert!(!debouncer.admit(dir, start + Duration::from_millis(50)));
        assert!(debouncer.admit(Path::new("/p/b"), start + Duration::from_millis(50)));
        assert!(debouncer.admit(dir, start + Duration::from_millis(150)));
    }

    #[test]
    fn test_watcher_creation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let watcher = PluginWatcher::new(tmp.path(), WatchConfig::default()).unwrap();
        assert_eq!(watcher.root(), std::fs::canonicalize(tmp.path()).unwrap());
    }
}
