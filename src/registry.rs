//! In-memory catalog of known plugins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lifecycle::{EventBus, EventKind, PluginEvent, PluginStatus};
use crate::manifest::{Capability, Manifest};
use crate::plugin::PluginInstance;
use crate::version;

/// A registered plugin.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Plugin manifest.
    pub manifest: Manifest,
    /// Live instance, absent until loaded.
    pub instance: Option<Arc<PluginInstance>>,
    /// Current status.
    pub status: PluginStatus,
    /// Plugin directory.
    pub path: PathBuf,
    /// When the current instance was attached.
    pub loaded_at: Option<DateTime<Utc>>,
    /// Message of the last failure.
    pub error_message: Option<String>,
}

impl RegistryEntry {
    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    fn matches(&self, needle: &str) -> bool {
        let m = &self.manifest;
        [&m.name, &m.title, &m.description, &m.author]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
            || m.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// A dependency registered at a version below the required range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConflict {
    /// Dependency name.
    pub name: String,
    /// Required range.
    pub required: String,
    /// Registered version.
    pub installed: String,
}

impl fmt::Display for VersionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} does not satisfy {}", self.name, self.installed, self.required)
    }
}

/// Result of a dependency check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// True when nothing is missing or conflicting.
    pub satisfied: bool,
    /// Dependencies not registered.
    pub missing: Vec<String>,
    /// Dependencies registered at an incompatible version.
    pub conflicts: Vec<VersionConflict>,
}

impl DependencyReport {
    /// Convert into an error for `plugin`. Missing dependencies win over conflicts.
    pub fn into_result(self, plugin: &str) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(Error::DependencyMissing {
                plugin: plugin.to_string(),
                missing: self.missing,
            });
        }
        if !self.conflicts.is_empty() {
            return Err(Error::DependencyConflict {
                plugin: plugin.to_string(),
                conflicts: self.conflicts.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(())
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Total plugins registered.
    pub total: usize,
    /// Count per status.
    pub by_status: HashMap<PluginStatus, usize>,
    /// Count per declared capability.
    pub by_capability: BTreeMap<Capability, usize>,
    /// Count per author; empty authors are skipped.
    pub by_author: BTreeMap<String, usize>,
}

impl RegistryStats {
    /// Number of plugins with a status.
    pub fn count(&self, status: PluginStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Plugin registry keyed by name.
pub struct PluginRegistry {
    entries: DashMap<String, RegistryEntry>,
    events: Arc<EventBus>,
}

impl PluginRegistry {
    /// Create a registry with its own event bus.
    pub fn new() -> Self {
        Self::with_events(Arc::new(EventBus::new()))
    }

    /// Create a registry that reports to `events`.
    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// Event bus this registry reports to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a plugin.
    ///
    /// The entry starts `Installed` when an instance is given and `Inactive`
    /// otherwise.
    pub fn register(
        &self,
        manifest: Manifest,
        instance: Option<Arc<PluginInstance>>,
        path: impl Into<PathBuf>,
    ) -> Result<()> {
        let name = manifest.name.clone();
        let status = if instance.is_some() {
            PluginStatus::Installed
        } else {
            PluginStatus::Inactive
        };

        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::AlreadyInstalled(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    loaded_at: instance.as_ref().map(|_| Utc::now()),
                    manifest: manifest.clone(),
                    instance,
                    status,
                    path: path.into(),
                    error_message: None,
                });
            }
        }

        debug!(plugin = %name, %status, "Registered plugin");
        self.events
            .emit(PluginEvent::new(EventKind::Registered, &name, Some(&manifest)).with("status", status.to_string()));
        Ok(())
    }

    /// Remove a plugin. Active plugins must be deactivated first.
    pub fn unregister(&self, name: &str) -> Result<RegistryEntry> {
        let (_, entry) = self
            .entries
            .remove_if(name, |_, e| e.status != PluginStatus::Active)
            .ok_or_else(|| match self.status(name) {
                Some(status) => Error::invalid_state("not active", status.to_string()),
                None => Error::plugin_not_found(name),
            })?;

        debug!(plugin = %name, "Unregistered plugin");
        self.events
            .emit(PluginEvent::new(EventKind::Unregistered, name, Some(&entry.manifest)));
        Ok(entry)
    }

    /// Get an entry.
    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Get the live instance.
    pub fn get_instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.entries.get(name).and_then(|e| e.instance.clone())
    }

    /// Get the manifest.
    pub fn get_manifest(&self, name: &str) -> Option<Manifest> {
        self.entries.get(name).map(|e| e.manifest.clone())
    }

    /// Get the status.
    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.entries.get(name).map(|e| e.status)
    }

    /// Get the plugin directory.
    pub fn path(&self, name: &str) -> Option<PathBuf> {
        self.entries.get(name).map(|e| e.path.clone())
    }

    /// Check if a plugin is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// All entries, sorted by name.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        entries
    }

    /// Entries with a given status.
    pub fn by_status(&self, status: PluginStatus) -> Vec<RegistryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.status == status)
            .collect()
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a status transition. Legality is the caller's concern.
    ///
    /// Returns the previous status.
    pub fn update_status(
        &self,
        name: &str,
        status: PluginStatus,
        error_message: Option<String>,
    ) -> Result<PluginStatus> {
        let (previous, manifest) = {
            let mut entry = self
                .entries
                .get_mut(name)
                .ok_or_else(|| Error::plugin_not_found(name))?;
            let previous = entry.status;
            entry.status = status;
            entry.error_message = error_message.clone();
            (previous, entry.manifest.clone())
        };

        self.events.emit(PluginEvent::status_changed(
            name,
            &manifest,
            previous,
            status,
            error_message.as_deref(),
        ));
        Ok(previous)
    }

    /// Attach a new instance, replacing manifest and path.
    pub fn set_instance(&self, name: &str, instance: Arc<PluginInstance>, path: &Path) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;
        entry.manifest = instance.manifest().clone();
        entry.path = path.to_path_buf();
        entry.instance = Some(instance);
        entry.loaded_at = Some(Utc::now());
        Ok(())
    }

    /// Detach the instance.
    pub fn remove_instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        let mut entry = self.entries.get_mut(name)?;
        entry.loaded_at = None;
        entry.instance.take()
    }

    /// Check a manifest's dependencies against registered plugins.
    pub fn check_manifest(&self, manifest: &Manifest) -> DependencyReport {
        let mut report = DependencyReport::default();

        for (dep, range) in &manifest.dependencies {
            let installed = self.entries.get(dep).map(|e| e.manifest.version.clone());
            match installed {
                None => report.missing.push(dep.clone()),
                Some(installed) if !version::satisfies(&installed, range) => {
                    report.conflicts.push(VersionConflict {
                        name: dep.clone(),
                        required: range.clone(),
                        installed,
                    });
                }
                Some(_) => {}
            }
        }

        report.satisfied = report.missing.is_empty() && report.conflicts.is_empty();
        report
    }

    /// Check a registered plugin's dependencies.
    pub fn check_dependencies(&self, name: &str) -> Result<DependencyReport> {
        let manifest = self
            .get_manifest(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;
        Ok(self.check_manifest(&manifest))
    }

    /// Names of registered plugins that depend on `name`, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.manifest.dependencies.contains_key(name))
            .map(|e| e.key().clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Case-insensitive substring search over name, title, description,
    /// author and tags.
    pub fn search(&self, query: &str) -> Vec<RegistryEntry> {
        let needle = query.trim().to_lowercase();
        self.entries()
            .into_iter()
            .filter(|e| needle.is_empty() || e.matches(&needle))
            .collect()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.entries.len(),
            ..Default::default()
        };

        for entry in self.entries.iter() {
            *stats.by_status.entry(entry.status).or_default() += 1;
            for cap in &entry.manifest.capabilities {
                *stats.by_capability.entry(*cap).or_default() += 1;
            }
            if !entry.manifest.author.is_empty() {
                *stats.by_author.entry(entry.manifest.author.clone()).or_default() += 1;
            }
        }

        stats
    }

    /// Remove every entry regardless of status.
    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "Cleared plugin registry");
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugin_count", &self.entries.len())
            .finish()
    }
}
