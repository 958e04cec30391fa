//! Plugin loading: directory validation, module resolution and integrity data.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::plugin::{
    LifecycleStage, LoadedPlugin, PluginContext, PluginDefinition, PluginFactory, PluginInstance,
};

/// Default bound on module resolution plus construction.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the plugin loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Manifest file name inside each plugin directory.
    pub manifest_file: String,
    /// Package descriptor file name inside each plugin directory.
    pub package_file: String,
    /// Load timeout in milliseconds.
    pub load_timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            manifest_file: "plugin.json".to_string(),
            package_file: "package.json".to_string(),
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manifest file name.
    pub fn with_manifest_file(mut self, name: impl Into<String>) -> Self {
        self.manifest_file = name.into();
        self
    }

    /// Set the package descriptor file name.
    pub fn with_package_file(mut self, name: impl Into<String>) -> Self {
        self.package_file = name.into();
        self
    }

    /// Set the load timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Load timeout as a duration.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

/// Per-call load options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Overrides the configured load timeout.
    pub timeout: Option<Duration>,
}

impl LoadOptions {
    /// Set the timeout for this load.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a resolver is asked to turn into a plugin constructor.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    /// Plugin name from the manifest.
    pub name: String,
    /// Canonical plugin directory.
    pub plugin_dir: PathBuf,
    /// Canonical main entry, always inside `plugin_dir`.
    pub main: PathBuf,
    /// Validated manifest.
    pub manifest: Manifest,
}

/// Turns a plugin's main entry into a constructor.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Resolve the module. `Ok(None)` means the module exports no constructor.
    async fn resolve(
        &self,
        request: &ModuleRequest,
    ) -> std::result::Result<Option<Arc<dyn PluginFactory>>, String>;

    /// Drop any cached state for a main entry.
    fn evict(&self, _main: &Path) {}
}

/// Resolver for plugins compiled into the host, keyed by plugin name.
#[derive(Default)]
pub struct StaticResolver {
    factories: DashMap<String, Arc<dyn PluginFactory>>,
    resolutions: AtomicUsize,
    evictions: AtomicUsize,
}

impl StaticResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor closure for a plugin name.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Manifest) -> std::result::Result<PluginDefinition, String> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(constructor));
    }

    /// Register an arbitrary factory for a plugin name.
    pub fn register_factory(&self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Manifest) -> std::result::Result<PluginDefinition, String> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    /// Remove a factory.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    /// Number of resolve calls served.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Number of evictions requested.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModuleResolver for StaticResolver {
    async fn resolve(
        &self,
        request: &ModuleRequest,
    ) -> std::result::Result<Option<Arc<dyn PluginFactory>>, String> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        Ok(self.factories.get(&request.name).map(|f| f.value().clone()))
    }

    fn evict(&self, _main: &Path) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticResolver")
            .field("factories", &self.factories.len())
            .field("resolutions", &self.resolutions())
            .finish()
    }
}

/// Outcome of a best-effort directory scan.
#[derive(Debug, Default)]
pub struct BatchLoad {
    /// Plugins that loaded.
    pub loaded: Vec<LoadedPlugin>,
    /// Directories that failed, with the reason.
    pub failed: Vec<(PathBuf, Error)>,
}

/// Loads plugin directories into live instances.
pub struct PluginLoader {
    config: LoaderConfig,
    resolver: Arc<dyn ModuleResolver>,
    loaded: DashMap<String, LoadedPlugin>,
}

impl PluginLoader {
    /// Create a new plugin loader.
    pub fn new(config: LoaderConfig, resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            config,
            resolver,
            loaded: DashMap::new(),
        }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Read and validate a plugin directory's manifest without loading code.
    pub async fn read_manifest(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        self.read_plugin_files(path.as_ref()).await.map(|(_, manifest)| manifest)
    }

    async fn read_plugin_files(&self, dir: &Path) -> Result<(Vec<u8>, Manifest)> {
        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(Error::DirectoryNotFound(dir.to_path_buf())),
        }

        let manifest_bytes = read_required(&dir.join(&self.config.manifest_file)).await?;
        let package_bytes = read_required(&dir.join(&self.config.package_file)).await?;
        match serde_json::from_slice::<serde_json::Value>(&package_bytes) {
            Ok(value) if value.is_object() => {}
            _ => {
                return Err(Error::invalid_manifest(format!(
                    "{} must be a JSON object",
                    self.config.package_file
                )))
            }
        }

        let manifest = Manifest::from_json(&manifest_bytes)?;
        Ok((manifest_bytes, manifest))
    }

    /// Load a plugin directory.
    pub async fn load_plugin(&self, path: impl AsRef<Path>, options: LoadOptions) -> Result<LoadedPlugin> {
        let started = Instant::now();
        let dir = path.as_ref();

        let (manifest_bytes, manifest) = self.read_plugin_files(dir).await?;
        let plugin_dir = tokio::fs::canonicalize(dir).await?;
        let main = resolve_main(&plugin_dir, &manifest.main).await?;

        self.resolver.evict(&main);

        let request = ModuleRequest {
            name: manifest.name.clone(),
            plugin_dir: plugin_dir.clone(),
            main: main.clone(),
            manifest: manifest.clone(),
        };
        let timeout = options.timeout.unwrap_or_else(|| self.config.load_timeout());

        let definition = match tokio::time::timeout(timeout, self.instantiate(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                self.resolver.evict(&main);
                warn!(plugin = %manifest.name, ?timeout, "Plugin load timed out");
                return Err(Error::LoadTimeout {
                    name: manifest.name.clone(),
                    timeout,
                });
            }
        };

        let instance = PluginInstance::new(definition, manifest.clone(), plugin_dir.clone());
        if let Err(e) = instance.verify_exports() {
            self.resolver.evict(&main);
            return Err(e);
        }

        let main_bytes = tokio::fs::read(&main).await?;
        let checksum = compute_checksum(&manifest_bytes, &main_bytes);
        let size_bytes = directory_size(&plugin_dir).await?;

        let loaded = LoadedPlugin {
            name: manifest.name.clone(),
            manifest,
            instance: Arc::new(instance),
            path: plugin_dir,
            main,
            size_bytes,
            checksum,
        };
        self.loaded.insert(loaded.name.clone(), loaded.clone());

        info!(
            plugin = %loaded.name,
            version = %loaded.manifest.version,
            size_bytes = loaded.size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded plugin"
        );

        Ok(loaded)
    }

    async fn instantiate(&self, request: &ModuleRequest) -> Result<PluginDefinition> {
        let factory = self
            .resolver
            .resolve(request)
            .await
            .map_err(Error::Instantiation)?
            .ok_or_else(|| {
                Error::InvalidExport(format!(
                    "{} does not export a plugin constructor",
                    request.main.display()
                ))
            })?;

        // Constructors are synchronous; run them off the runtime so the load
        // timeout can still elapse while one blocks.
        let manifest = request.manifest.clone();
        let construct = tokio::task::spawn_blocking(move || factory.create(&manifest));
        match construct.await {
            Ok(Ok(definition)) => Ok(definition),
            Ok(Err(msg)) => Err(Error::Instantiation(msg)),
            Err(join) if join.is_panic() => Err(Error::Instantiation(format!(
                "constructor of {} panicked",
                request.name
            ))),
            Err(join) => Err(Error::Instantiation(join.to_string())),
        }
    }

    /// Load every subdirectory of `dir`, skipping failures.
    pub async fn load_plugins_from_directory(&self, dir: impl AsRef<Path>) -> Result<BatchLoad> {
        let dir = dir.as_ref();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Err(Error::DirectoryNotFound(dir.to_path_buf())),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        let mut batch = BatchLoad::default();
        for candidate in candidates {
            match self.load_plugin(&candidate, LoadOptions::default()).await {
                Ok(loaded) => batch.loaded.push(loaded),
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Skipping plugin directory");
                    batch.failed.push((candidate, e));
                }
            }
        }

        debug!(
            dir = %dir.display(),
            loaded = batch.loaded.len(),
            failed = batch.failed.len(),
            "Scanned plugin directory"
        );
        Ok(batch)
    }

    /// Unload a plugin, calling its `deactivate` callback if present.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let (_, loaded) = self
            .loaded
            .remove(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;

        let ctx = PluginContext::new(loaded.manifest.clone(), loaded.path.clone());
        if let Err(e) = loaded.instance.run(LifecycleStage::Deactivate, ctx).await {
            warn!(plugin = %name, error = %e, "Deactivate failed during unload");
        }

        self.resolver.evict(&loaded.main);
        info!(plugin = %name, "Unloaded plugin");
        Ok(())
    }

    /// Unload and load again from the same directory.
    pub async fn reload_plugin(&self, name: &str) -> Result<LoadedPlugin> {
        let path = self
            .loaded
            .get(name)
            .map(|l| l.path.clone())
            .ok_or_else(|| Error::plugin_not_found(name))?;

        self.unload_plugin(name).await?;
        self.load_plugin(path, LoadOptions::default()).await
    }

    /// Drop a plugin from the cache without running callbacks.
    pub fn evict(&self, name: &str) -> bool {
        match self.loaded.remove(name) {
            Some((_, loaded)) => {
                self.resolver.evict(&loaded.main);
                true
            }
            None => false,
        }
    }

    /// Get a loaded plugin.
    pub fn get(&self, name: &str) -> Option<LoadedPlugin> {
        self.loaded.get(name).map(|l| l.value().clone())
    }

    /// Check if a plugin is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Names of loaded plugins.
    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.iter().map(|l| l.key().clone()).collect()
    }

    /// Evict every loaded plugin.
    pub fn clear(&self) {
        let names = self.loaded_names();
        for name in names {
            self.evict(&name);
        }
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("config", &self.config)
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

async fn read_required(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::ManifestMissing(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve `main` against a canonical plugin directory, rejecting escapes.
async fn resolve_main(plugin_dir: &Path, main: &str) -> Result<PathBuf> {
    let candidate = plugin_dir.join(main);

    if !normalize(&candidate).starts_with(plugin_dir) {
        return Err(Error::MainFileOutsideDirectory {
            main: candidate,
            dir: plugin_dir.to_path_buf(),
        });
    }

    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MainFileMissing(candidate))
        }
        Err(e) => return Err(e.into()),
    };

    if !resolved.starts_with(plugin_dir) {
        return Err(Error::MainFileOutsideDirectory {
            main: resolved,
            dir: plugin_dir.to_path_buf(),
        });
    }

    if !tokio::fs::metadata(&resolved).await?.is_file() {
        return Err(Error::MainFileMissing(resolved));
    }

    Ok(resolved)
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// SHA-256 over the manifest bytes followed by the main-file bytes, hex encoded.
pub fn compute_checksum(manifest: &[u8], main: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest);
    hasher.update(main);
    format!("{:x}", hasher.finalize())
}

/// Total size of regular files under `root`. Symlinks are not followed.
pub async fn directory_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = tokio::fs::symlink_metadata(entry.path()).await?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    Ok(total)
}
