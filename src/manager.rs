//! Plugin manager: orchestrates loader, registry, hook bus and record store
//! through the plugin lifecycle.
//!
//! ```text
//! INACTIVE --register with instance--> INSTALLED --activate--> ACTIVE
//!     ACTIVE --deactivate--> INSTALLED --uninstall--> (removed)
//!     any failure --> ERROR
//! ```
//!
//! Only one lifecycle operation may run per plugin name at a time; a second
//! one fails immediately with `OPERATION_IN_PROGRESS`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::hooks::{HookBus, ScopedHooks};
use crate::lifecycle::{EventBus, EventKind, PluginEvent, PluginStatus};
use crate::loader::{LoadOptions, LoaderConfig, ModuleResolver, PluginLoader};
use crate::manifest::Manifest;
use crate::plugin::{LifecycleStage, LoadedPlugin, PluginContext, PluginInstance};
use crate::registry::PluginRegistry;
use crate::routes::{RouteRegistrar, RouteTable};
use crate::store::{MemoryRecordStore, PluginRecord, RecordMetadata, RecordStore};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;

/// Action fired before a plugin's `activate` callback runs.
pub const HOOK_BEFORE_ACTIVATE: &str = "plugin:before_activate";
/// Action fired after a plugin became active.
pub const HOOK_ACTIVATED: &str = "plugin:activated";
/// Action fired after a plugin was deactivated.
pub const HOOK_DEACTIVATED: &str = "plugin:deactivated";

/// Payload of the `plugin:*` lifecycle actions.
#[derive(Debug, Clone)]
pub struct PluginHookArgs {
    /// Plugin name.
    pub name: String,
    /// Plugin manifest.
    pub manifest: Manifest,
}

/// Configuration for the plugin manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory scanned by [`PluginManager::initialize`].
    pub plugin_dir: PathBuf,
    /// Load every plugin in `plugin_dir` on initialize.
    pub auto_load: bool,
    /// Loader configuration.
    pub loader: LoaderConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            auto_load: true,
            loader: LoaderConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Set auto-load behavior.
    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = auto_load;
        self
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }
}

/// Failure details of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    /// Stable error code.
    pub code: String,
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Code-specific details.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl From<&Error> for OperationError {
    fn from(err: &Error) -> Self {
        let mut context = Map::new();
        match err {
            Error::DependencyMissing { missing, .. } => {
                context.insert("missing".into(), missing.clone().into());
            }
            Error::DependencyConflict { conflicts, .. } => {
                context.insert("conflicts".into(), conflicts.clone().into());
            }
            Error::LoadTimeout { timeout, .. } => {
                context.insert("timeoutMs".into(), (timeout.as_millis() as u64).into());
            }
            Error::DirectoryNotFound(path) | Error::ManifestMissing(path) | Error::MainFileMissing(path) => {
                context.insert("path".into(), path.display().to_string().into());
            }
            Error::MainFileOutsideDirectory { main, dir } => {
                context.insert("main".into(), main.display().to_string().into());
                context.insert("directory".into(), dir.display().to_string().into());
            }
            Error::Lifecycle { stage, .. } => {
                context.insert("stage".into(), (*stage).into());
            }
            Error::NameMismatch { expected, found } => {
                context.insert("expected".into(), expected.clone().into());
                context.insert("found".into(), found.clone().into());
            }
            _ => {}
        }

        Self {
            code: err.code().to_string(),
            kind: err.kind(),
            message: err.to_string(),
            context,
        }
    }
}

/// Outcome of a manager operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Plugin the operation targeted.
    pub plugin_name: String,
    /// Human-readable summary.
    pub message: String,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationResult {
    /// Successful outcome.
    pub fn ok(plugin_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            plugin_name: plugin_name.into(),
            message: message.into(),
            error: None,
        }
    }

    /// Failed outcome.
    pub fn failed(plugin_name: impl Into<String>, err: &Error) -> Self {
        Self {
            success: false,
            plugin_name: plugin_name.into(),
            message: err.to_string(),
            error: Some(err.into()),
        }
    }

    /// Error code of a failed outcome.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Summary of [`PluginManager::initialize`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeReport {
    /// Plugins loaded and registered.
    pub registered: Vec<String>,
    /// Directories that failed to load, with the message.
    pub failed: Vec<(PathBuf, String)>,
    /// Plugins re-activated from persisted records.
    pub reactivated: Vec<String>,
    /// Re-activation failures.
    pub reactivation_failures: Vec<OperationResult>,
}

struct OperationGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.name);
    }
}

/// Orchestrates plugin lifecycle operations.
pub struct PluginManager {
    config: ManagerConfig,
    loader: PluginLoader,
    registry: Arc<PluginRegistry>,
    hooks: Arc<HookBus>,
    events: Arc<EventBus>,
    store: Arc<dyn RecordStore>,
    routes: Arc<dyn RouteRegistrar>,
    in_flight: Mutex<HashSet<String>>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl PluginManager {
    /// Create a manager with an in-memory record store and route table.
    pub fn new(config: ManagerConfig, resolver: Arc<dyn ModuleResolver>) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            loader: PluginLoader::new(config.loader.clone(), resolver),
            registry: Arc::new(PluginRegistry::with_events(events.clone())),
            hooks: Arc::new(HookBus::new().with_events(events.clone())),
            events,
            store: Arc::new(MemoryRecordStore::new()),
            routes: Arc::new(RouteTable::new()),
            in_flight: Mutex::new(HashSet::new()),
            config,
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    /// Use a different record store.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    /// Use a different route registrar.
    pub fn with_routes(mut self, routes: Arc<dyn RouteRegistrar>) -> Self {
        self.routes = routes;
        self
    }

    /// Report to a shared event bus.
    ///
    /// Must be called before any plugin is registered.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.registry = Arc::new(PluginRegistry::with_events(events.clone()));
        self.hooks = Arc::new(HookBus::new().with_events(events.clone()));
        self.events = events;
        self
    }

    /// Collect Prometheus metrics.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        metrics.attach(&self.events);
        self.metrics = Some(metrics);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the plugin loader.
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Get the plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Get the hook bus.
    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    /// Get the event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Get the record store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Check whether an operation is running for a plugin.
    pub fn is_busy(&self, name: &str) -> bool {
        self.in_flight.lock().contains(name)
    }

    fn begin(&self, name: &str) -> Result<OperationGuard<'_>> {
        if !self.in_flight.lock().insert(name.to_string()) {
            return Err(Error::OperationInProgress(name.to_string()));
        }
        Ok(OperationGuard {
            in_flight: &self.in_flight,
            name: name.to_string(),
        })
    }

    #[cfg(feature = "metrics-prometheus")]
    fn observe_load(&self, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_load(started.elapsed().as_secs_f64());
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    fn observe_load(&self, _started: Instant) {}

    fn finish(&self, name: &str, op: &str, result: Result<String>) -> OperationResult {
        match result {
            Ok(message) => {
                info!(plugin = %name, op, "{}", message);
                OperationResult::ok(name, message)
            }
            Err(e) => {
                warn!(plugin = %name, op, code = e.code(), error = %e, "Plugin operation failed");
                OperationResult::failed(name, &e)
            }
        }
    }

    /// Scan the plugin directory and restore previously active plugins.
    pub async fn initialize(&self) -> Result<InitializeReport> {
        tokio::fs::create_dir_all(&self.config.plugin_dir).await?;
        let mut report = InitializeReport::default();

        if self.config.auto_load {
            let batch = self.loader.load_plugins_from_directory(&self.config.plugin_dir).await?;
            for (path, err) in batch.failed {
                report.failed.push((path, err.to_string()));
            }

            for loaded in batch.loaded {
                if self.registry.contains(&loaded.name) {
                    debug!(plugin = %loaded.name, "Already registered, skipping");
                    continue;
                }
                if let Err(e) = self.register_loaded(&loaded).await {
                    self.loader.evict(&loaded.name);
                    report.failed.push((loaded.path.clone(), e.to_string()));
                    continue;
                }
                report.registered.push(loaded.name);
            }
        }

        for record in self.store.list().await? {
            if record.status != PluginStatus::Active {
                continue;
            }
            match self.registry.status(&record.name) {
                Some(PluginStatus::Active) | None => continue,
                Some(_) => {}
            }

            let result = self.activate_plugin(&record.name).await;
            if result.success {
                report.reactivated.push(record.name);
            } else {
                report.reactivation_failures.push(result);
            }
        }

        info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            reactivated = report.reactivated.len(),
            "Plugin manager initialized"
        );
        Ok(report)
    }

    async fn register_loaded(&self, loaded: &LoadedPlugin) -> Result<()> {
        self.registry
            .register(loaded.manifest.clone(), Some(loaded.instance.clone()), &loaded.path)?;

        let record = match self.store.get(&loaded.name).await? {
            Some(mut record) => {
                record.version = loaded.manifest.version.clone();
                record.metadata = RecordMetadata::from(loaded);
                record.last_updated = Some(Utc::now());
                record
            }
            None => PluginRecord::new(&loaded.name, &loaded.manifest.version, PluginStatus::Installed)
                .with_settings(Value::Object(loaded.manifest.default_settings()))
                .with_metadata(RecordMetadata::from(loaded)),
        };
        self.store.upsert(record).await
    }

    /// Install a plugin from a directory.
    pub async fn install_plugin(&self, path: impl AsRef<Path>) -> OperationResult {
        let path = path.as_ref();
        let manifest = match self.loader.read_manifest(path).await {
            Ok(manifest) => manifest,
            Err(e) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return self.finish(&name, "install", Err(e));
            }
        };

        let name = manifest.name.clone();
        let _guard = match self.begin(&name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(&name, "install", Err(e)),
        };
        let result = self.install_inner(path, manifest).await;
        self.finish(&name, "install", result)
    }

    async fn install_inner(&self, path: &Path, manifest: Manifest) -> Result<String> {
        let name = manifest.name.clone();
        if self.registry.contains(&name) {
            return Err(Error::AlreadyInstalled(name));
        }
        self.registry.check_manifest(&manifest).into_result(&name)?;

        let started = Instant::now();
        let loaded = self.loader.load_plugin(path, LoadOptions::default()).await?;
        self.observe_load(started);

        if let Err(e) = self.register_loaded(&loaded).await {
            if self.registry.contains(&name) {
                if let Err(e) = self.registry.unregister(&name) {
                    warn!(plugin = %name, error = %e, "Failed to roll back registration");
                }
            }
            self.loader.evict(&name);
            return Err(e);
        }

        let ctx = self.context(&loaded.instance).await;
        if let Err(e) = loaded.instance.run(LifecycleStage::Install, ctx).await {
            self.mark_error(&name, &e).await;
            return Err(e);
        }

        self.events.emit(
            PluginEvent::new(EventKind::Installed, &name, Some(&loaded.manifest))
                .with("version", loaded.manifest.version.clone())
                .with("checksum", loaded.checksum.clone()),
        );
        Ok(format!(
            "installed {} {} in {:?}",
            name,
            loaded.manifest.version,
            started.elapsed()
        ))
    }

    /// Activate a registered plugin.
    pub async fn activate_plugin(&self, name: &str) -> OperationResult {
        let _guard = match self.begin(name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(name, "activate", Err(e)),
        };
        let result = self.activate_inner(name).await;
        self.finish(name, "activate", result)
    }

    async fn activate_inner(&self, name: &str) -> Result<String> {
        let entry = self.registry.get(name).ok_or_else(|| Error::plugin_not_found(name))?;
        if entry.status == PluginStatus::Active {
            return Err(Error::AlreadyActive(name.to_string()));
        }
        if !entry.status.can_activate() {
            return Err(Error::invalid_state("installed, inactive or error", entry.status.to_string()));
        }
        self.registry.check_dependencies(name)?.into_result(name)?;

        match self.activate_steps(name, entry.instance, &entry.path).await {
            Ok(version) => Ok(format!("activated {} {}", name, version)),
            Err(e) => {
                self.teardown(name).await;
                self.mark_error(name, &e).await;
                Err(e)
            }
        }
    }

    async fn activate_steps(
        &self,
        name: &str,
        instance: Option<Arc<PluginInstance>>,
        path: &Path,
    ) -> Result<String> {
        let instance = match instance {
            Some(instance) => instance,
            None => {
                let loaded = self.loader.load_plugin(path, LoadOptions::default()).await?;
                self.registry.set_instance(name, loaded.instance.clone(), &loaded.path)?;
                loaded.instance
            }
        };
        let args = PluginHookArgs {
            name: name.to_string(),
            manifest: instance.manifest().clone(),
        };

        self.hooks.do_action(HOOK_BEFORE_ACTIVATE, &args);

        let scope = ScopedHooks::new(self.hooks.clone(), name);
        let ctx = self.context(&instance).await.with_hooks(scope.clone());
        instance.run(LifecycleStage::Activate, ctx).await?;
        instance.register_declared_hooks(&scope)?;
        self.routes.register_routes(name, &instance.manifest().routes).await?;

        self.registry.update_status(name, PluginStatus::Active, None)?;
        self.persist_status(name, PluginStatus::Active, None).await?;

        self.hooks.do_action(HOOK_ACTIVATED, &args);
        self.events
            .emit(PluginEvent::new(EventKind::Activated, name, Some(instance.manifest())));
        Ok(instance.manifest().version.clone())
    }

    /// Deactivate an active plugin.
    pub async fn deactivate_plugin(&self, name: &str) -> OperationResult {
        let _guard = match self.begin(name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(name, "deactivate", Err(e)),
        };
        let result = self.deactivate_inner(name, true).await;
        self.finish(name, "deactivate", result)
    }

    async fn deactivate_inner(&self, name: &str, persist: bool) -> Result<String> {
        let entry = self.registry.get(name).ok_or_else(|| Error::plugin_not_found(name))?;
        if entry.status != PluginStatus::Active {
            return Err(Error::NotActive(name.to_string()));
        }

        let callback = match &entry.instance {
            Some(instance) => {
                let scope = ScopedHooks::new(self.hooks.clone(), name);
                let ctx = self.context(instance).await.with_hooks(scope);
                instance.run(LifecycleStage::Deactivate, ctx).await.map(|_| ())
            }
            None => Ok(()),
        };
        self.teardown(name).await;

        if let Err(e) = callback {
            self.mark_error(name, &e).await;
            return Err(e);
        }

        self.registry.update_status(name, PluginStatus::Installed, None)?;
        if persist {
            self.persist_status(name, PluginStatus::Installed, None).await?;
        }

        let args = PluginHookArgs {
            name: name.to_string(),
            manifest: entry.manifest.clone(),
        };
        self.hooks.do_action(HOOK_DEACTIVATED, &args);
        self.events
            .emit(PluginEvent::new(EventKind::Deactivated, name, Some(&entry.manifest)));
        Ok(format!("deactivated {}", name))
    }

    /// Remove a plugin entirely, deactivating it first if needed.
    pub async fn uninstall_plugin(&self, name: &str) -> OperationResult {
        let _guard = match self.begin(name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(name, "uninstall", Err(e)),
        };
        let result = self.uninstall_inner(name).await;
        self.finish(name, "uninstall", result)
    }

    async fn uninstall_inner(&self, name: &str) -> Result<String> {
        let entry = self.registry.get(name).ok_or_else(|| Error::plugin_not_found(name))?;
        if entry.status == PluginStatus::Active {
            self.deactivate_inner(name, true).await?;
        }

        self.registry.update_status(name, PluginStatus::Uninstalling, None)?;

        if let Some(instance) = self.registry.get_instance(name) {
            let ctx = self.context(&instance).await;
            if let Err(e) = instance.run(LifecycleStage::Uninstall, ctx).await {
                self.mark_error(name, &e).await;
                return Err(e);
            }
        }

        let removed = self.hooks.remove_plugin_hooks(name);
        if removed > 0 {
            debug!(plugin = %name, removed, "Removed leftover hooks");
        }
        self.loader.evict(name);
        let entry = self.registry.unregister(name)?;
        self.store.delete(name).await?;

        self.events
            .emit(PluginEvent::new(EventKind::Uninstalled, name, Some(&entry.manifest)));
        Ok(format!("uninstalled {}", name))
    }

    /// Replace a plugin with the version found in `new_path`.
    pub async fn update_plugin(&self, name: &str, new_path: impl AsRef<Path>) -> OperationResult {
        let _guard = match self.begin(name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(name, "update", Err(e)),
        };
        let result = self.update_inner(name, new_path.as_ref()).await;
        self.finish(name, "update", result)
    }

    async fn update_inner(&self, name: &str, new_path: &Path) -> Result<String> {
        let entry = self.registry.get(name).ok_or_else(|| Error::plugin_not_found(name))?;
        let candidate = self.loader.read_manifest(new_path).await?;
        if candidate.name != name {
            return Err(Error::NameMismatch {
                expected: name.to_string(),
                found: candidate.name,
            });
        }
        self.registry.check_manifest(&candidate).into_result(name)?;

        let was_active = entry.status == PluginStatus::Active;
        if was_active {
            self.deactivate_inner(name, true).await?;
        }

        let old_version = entry.manifest.version.clone();
        self.registry.update_status(name, PluginStatus::Updating, None)?;

        let loaded = match self.swap_instance(name, new_path, &old_version, &candidate.version).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.mark_error(name, &e).await;
                return Err(e);
            }
        };

        self.events.emit(
            PluginEvent::new(EventKind::Updated, name, Some(&loaded.manifest))
                .with("from", old_version.clone())
                .with("to", loaded.manifest.version.clone()),
        );

        if was_active {
            self.activate_inner(name).await?;
        }
        Ok(format!("updated {} from {} to {}", name, old_version, loaded.manifest.version))
    }

    async fn swap_instance(
        &self,
        name: &str,
        new_path: &Path,
        old_version: &str,
        new_version: &str,
    ) -> Result<LoadedPlugin> {
        if let Some(old) = self.registry.get_instance(name) {
            let ctx = self.context(&old).await;
            old.run_update(ctx, old_version, new_version).await?;
        }

        self.loader.evict(name);
        let loaded = self.loader.load_plugin(new_path, LoadOptions::default()).await?;
        self.registry.set_instance(name, loaded.instance.clone(), &loaded.path)?;
        self.registry.update_status(name, PluginStatus::Installed, None)?;

        let mut record = self
            .store
            .get(name)
            .await?
            .unwrap_or_else(|| PluginRecord::new(name, new_version, PluginStatus::Installed));
        let mut settings = Value::Object(loaded.manifest.default_settings());
        merge_settings(&mut settings, &record.settings);
        record.version = loaded.manifest.version.clone();
        record.status = PluginStatus::Installed;
        record.settings = settings;
        record.error_message = None;
        record.last_updated = Some(Utc::now());
        record.metadata = RecordMetadata::from(&loaded);
        self.store.upsert(record).await?;

        Ok(loaded)
    }

    /// Re-read a plugin's code from its directory.
    pub async fn reload_plugin(&self, name: &str) -> OperationResult {
        let _guard = match self.begin(name) {
            Ok(guard) => guard,
            Err(e) => return self.finish(name, "reload", Err(e)),
        };
        let result = self.reload_inner(name).await;
        self.finish(name, "reload", result)
    }

    async fn reload_inner(&self, name: &str) -> Result<String> {
        let entry = self.registry.get(name).ok_or_else(|| Error::plugin_not_found(name))?;
        let was_active = entry.status == PluginStatus::Active;
        if was_active {
            self.deactivate_inner(name, true).await?;
        }

        self.loader.evict(name);
        let loaded = match self.loader.load_plugin(&entry.path, LoadOptions::default()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.mark_error(name, &e).await;
                return Err(e);
            }
        };
        self.registry.set_instance(name, loaded.instance.clone(), &loaded.path)?;
        self.registry.update_status(name, PluginStatus::Installed, None)?;
        self.persist_status(name, PluginStatus::Installed, None).await?;

        if was_active {
            self.activate_inner(name).await?;
        }
        Ok(format!("reloaded {} (checksum {})", name, loaded.checksum))
    }

    /// Merge settings into a plugin's persisted settings.
    ///
    /// When the manifest declares a settings schema, unknown keys are rejected.
    pub async fn update_settings(&self, name: &str, settings: Value) -> OperationResult {
        let result = self.update_settings_inner(name, settings).await;
        self.finish(name, "settings", result)
    }

    async fn update_settings_inner(&self, name: &str, settings: Value) -> Result<String> {
        let manifest = self
            .registry
            .get_manifest(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;
        let updates = settings
            .as_object()
            .ok_or_else(|| Error::InvalidSettings("settings must be a JSON object".into()))?;

        if !manifest.settings.is_empty() {
            if let Some(unknown) = updates.keys().find(|k| !manifest.settings.contains_key(*k)) {
                return Err(Error::InvalidSettings(format!("{} has no setting '{}'", name, unknown)));
            }
        }

        let status = self.registry.status(name).unwrap_or(PluginStatus::Installed);
        let mut record = self.store.get(name).await?.unwrap_or_else(|| {
            PluginRecord::new(name, &manifest.version, status)
                .with_settings(Value::Object(manifest.default_settings()))
        });
        merge_settings(&mut record.settings, &settings);
        record.last_updated = Some(Utc::now());
        self.store.upsert(record).await?;

        Ok(format!("updated {} setting(s) of {}", updates.len(), name))
    }

    /// Current settings: the persisted document, or schema defaults.
    pub async fn settings(&self, name: &str) -> Result<Value> {
        let manifest = self
            .registry
            .get_manifest(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;
        Ok(match self.store.get(name).await? {
            Some(record) => record.settings,
            None => Value::Object(manifest.default_settings()),
        })
    }

    /// Deactivate every active plugin and drop all in-memory state.
    ///
    /// Persisted statuses are left untouched so that the next
    /// [`initialize`](Self::initialize) restores the same set.
    pub async fn shutdown(&self) {
        for entry in self.registry.by_status(PluginStatus::Active) {
            let name = entry.name().to_string();
            let _guard = match self.begin(&name) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Skipping busy plugin on shutdown");
                    continue;
                }
            };
            if let Err(e) = self.deactivate_inner(&name, false).await {
                warn!(plugin = %name, error = %e, "Deactivate failed during shutdown");
            }
        }

        self.loader.clear();
        self.registry.clear();
        self.hooks.clear();
        info!("Plugin manager shut down");
    }

    async fn context(&self, instance: &PluginInstance) -> PluginContext {
        let settings = match self.store.get(instance.name()).await {
            Ok(Some(record)) => record.settings,
            Ok(None) => Value::Object(instance.manifest().default_settings()),
            Err(e) => {
                warn!(plugin = %instance.name(), error = %e, "Could not read settings");
                Value::Object(instance.manifest().default_settings())
            }
        };
        PluginContext::new(instance.manifest().clone(), instance.path()).with_settings(settings)
    }

    async fn teardown(&self, name: &str) {
        self.hooks.remove_plugin_hooks(name);
        if let Err(e) = self.routes.unregister_routes(name).await {
            warn!(plugin = %name, error = %e, "Failed to unregister routes");
        }
    }

    async fn persist_status(&self, name: &str, status: PluginStatus, error_message: Option<String>) -> Result<()> {
        if self.store.get(name).await?.is_some() {
            return self.store.update_status(name, status, error_message).await;
        }

        let Some(entry) = self.registry.get(name) else {
            return Ok(());
        };
        let mut record = PluginRecord::new(name, &entry.manifest.version, status)
            .with_settings(Value::Object(entry.manifest.default_settings()));
        record.error_message = error_message;
        self.store.upsert(record).await
    }

    async fn mark_error(&self, name: &str, err: &Error) {
        let message = err.to_string();
        error!(plugin = %name, code = err.code(), error = %message, "Plugin entered error state");
        if self
            .registry
            .update_status(name, PluginStatus::Error, Some(message.clone()))
            .is_err()
        {
            return;
        }
        if let Err(e) = self.persist_status(name, PluginStatus::Error, Some(message)).await {
            warn!(plugin = %name, error = %e, "Failed to persist error state");
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("hooks", &self.hooks)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

/// Shallow merge of `updates` into `target`; non-object targets are replaced.
fn merge_settings(target: &mut Value, updates: &Value) {
    match (target.as_object_mut(), updates.as_object()) {
        (Some(target), Some(updates)) => {
            for (key, value) in updates {
                target.insert(key.clone(), value.clone());
            }
        }
        (None, Some(_)) => *target = updates.clone(),
        _ => {}
    }
}
