//! Plugin instances, lifecycle callbacks and hook handlers.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::hooks::{HookId, HookKind, HookResult, ScopedHooks};
use crate::manifest::{HookDeclaration, Manifest};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Future returned by lifecycle callbacks.
pub type LifecycleFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// `activate`, `deactivate`, `install` and `uninstall` callback.
pub type LifecycleFn = Arc<dyn Fn(PluginContext) -> LifecycleFuture + Send + Sync>;

/// `update(old_version, new_version)` callback.
pub type UpdateFn = Arc<dyn Fn(PluginContext, String, String) -> LifecycleFuture + Send + Sync>;

type Registrar = Arc<dyn Fn(&ScopedHooks, &HookDeclaration) -> Result<HookId> + Send + Sync>;

/// Lifecycle stage a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    /// Plugin is being activated.
    Activate,
    /// Plugin is being deactivated.
    Deactivate,
    /// Plugin was installed.
    Install,
    /// Plugin is being uninstalled.
    Uninstall,
    /// Plugin is being replaced by a new version.
    Update,
}

impl LifecycleStage {
    /// Callback name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Update => "update",
        }
    }
}

/// Everything a lifecycle callback may use.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Plugin name.
    pub plugin: String,
    /// Plugin manifest.
    pub manifest: Manifest,
    /// Plugin directory.
    pub path: PathBuf,
    /// Current settings.
    pub settings: Value,
    hooks: Option<ScopedHooks>,
}

impl PluginContext {
    /// Create a context without hook access.
    pub fn new(manifest: Manifest, path: impl Into<PathBuf>) -> Self {
        Self {
            plugin: manifest.name.clone(),
            manifest,
            path: path.into(),
            settings: Value::Null,
            hooks: None,
        }
    }

    /// Grant hook access.
    pub fn with_hooks(mut self, hooks: ScopedHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Attach settings.
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Hook bus handle scoped to this plugin, when granted.
    pub fn hooks(&self) -> Option<&ScopedHooks> {
        self.hooks.as_ref()
    }
}

/// Optional lifecycle callbacks of a plugin.
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    /// Called on activation.
    pub activate: Option<LifecycleFn>,
    /// Called on deactivation.
    pub deactivate: Option<LifecycleFn>,
    /// Called once after install.
    pub install: Option<LifecycleFn>,
    /// Called before uninstall.
    pub uninstall: Option<LifecycleFn>,
    /// Called on the old instance before an update.
    pub update: Option<UpdateFn>,
}

impl LifecycleCallbacks {
    /// Check whether a callback is present for a stage.
    pub fn has(&self, stage: LifecycleStage) -> bool {
        match stage {
            LifecycleStage::Activate => self.activate.is_some(),
            LifecycleStage::Deactivate => self.deactivate.is_some(),
            LifecycleStage::Install => self.install.is_some(),
            LifecycleStage::Uninstall => self.uninstall.is_some(),
            LifecycleStage::Update => self.update.is_some(),
        }
    }
}

fn boxed<F, Fut>(f: F) -> LifecycleFn
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(move |ctx: PluginContext| -> LifecycleFuture { Box::pin(f(ctx)) })
}

/// A named handler that manifest hook declarations can bind to.
#[derive(Clone)]
pub struct HookHandler {
    kind: HookKind,
    register: Registrar,
}

impl HookHandler {
    /// Action handler for payload type `A`.
    pub fn action<A, F>(callback: F) -> Self
    where
        A: 'static,
        F: Fn(&A) -> HookResult + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Self {
            kind: HookKind::Action,
            register: Arc::new(move |scope: &ScopedHooks, decl: &HookDeclaration| {
                let callback = callback.clone();
                let f = move |args: &A| callback(args);
                if decl.once {
                    scope.add_action_once(decl.name.clone(), decl.priority, f)
                } else {
                    scope.add_action(decl.name.clone(), decl.priority, f)
                }
            }),
        }
    }

    /// Filter handler for value type `V` and extra arguments `A`.
    pub fn filter<V, A, F>(callback: F) -> Self
    where
        V: 'static,
        A: 'static,
        F: Fn(&V, &A) -> HookResult<V> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Self {
            kind: HookKind::Filter,
            register: Arc::new(move |scope: &ScopedHooks, decl: &HookDeclaration| {
                let callback = callback.clone();
                scope.add_filter(decl.name.clone(), decl.priority, move |v: &V, args: &A| {
                    callback(v, args)
                })
            }),
        }
    }

    /// Channel kind this handler subscribes to.
    pub fn kind(&self) -> HookKind {
        self.kind
    }
}

impl std::fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookHandler").field("kind", &self.kind).finish()
    }
}

/// What a plugin module's constructor produces.
#[derive(Clone, Default)]
pub struct PluginDefinition {
    callbacks: LifecycleCallbacks,
    handlers: HashMap<String, HookHandler>,
}

impl PluginDefinition {
    /// Definition with no callbacks and no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `activate` callback.
    pub fn on_activate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.callbacks.activate = Some(boxed(f));
        self
    }

    /// Set the `deactivate` callback.
    pub fn on_deactivate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.callbacks.deactivate = Some(boxed(f));
        self
    }

    /// Set the `install` callback.
    pub fn on_install<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.callbacks.install = Some(boxed(f));
        self
    }

    /// Set the `uninstall` callback.
    pub fn on_uninstall<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.callbacks.uninstall = Some(boxed(f));
        self
    }

    /// Set the `update` callback.
    pub fn on_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.callbacks.update = Some(Arc::new(
            move |ctx: PluginContext, old: String, new: String| -> LifecycleFuture { Box::pin(f(ctx, old, new)) },
        ));
        self
    }

    /// Provide a named hook handler.
    pub fn handler(mut self, name: impl Into<String>, handler: HookHandler) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }
}

/// Constructs plugin definitions from a resolved module.
pub trait PluginFactory: Send + Sync {
    /// Construct a fresh definition.
    fn create(&self, manifest: &Manifest) -> std::result::Result<PluginDefinition, String>;
}

impl<F> PluginFactory for F
where
    F: Fn(&Manifest) -> std::result::Result<PluginDefinition, String> + Send + Sync,
{
    fn create(&self, manifest: &Manifest) -> std::result::Result<PluginDefinition, String> {
        self(manifest)
    }
}

/// A live plugin object with its manifest and path attached.
pub struct PluginInstance {
    id: u64,
    manifest: Manifest,
    path: PathBuf,
    callbacks: LifecycleCallbacks,
    handlers: HashMap<String, HookHandler>,
}

impl PluginInstance {
    /// Attach a manifest and path to a constructed definition.
    pub fn new(definition: PluginDefinition, manifest: Manifest, path: impl Into<PathBuf>) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            manifest,
            path: path.into(),
            callbacks: definition.callbacks,
            handlers: definition.handlers,
        }
    }

    /// Unique instance id; changes whenever the plugin is reloaded.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Plugin manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Plugin directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether a lifecycle callback is present.
    pub fn has(&self, stage: LifecycleStage) -> bool {
        self.callbacks.has(stage)
    }

    /// Look up a named hook handler.
    pub fn handler(&self, name: &str) -> Option<&HookHandler> {
        self.handlers.get(name)
    }

    /// Check that every handler referenced by the manifest is provided with
    /// the right kind.
    pub fn verify_exports(&self) -> Result<()> {
        let declared = self
            .manifest
            .hooks
            .iter()
            .map(|d| (d, HookKind::Action))
            .chain(self.manifest.filters.iter().map(|d| (d, HookKind::Filter)));

        for (decl, kind) in declared {
            match self.handlers.get(&decl.handler) {
                None => {
                    return Err(Error::InvalidExport(format!(
                        "{} declares handler '{}' for {} but does not provide it",
                        self.manifest.name, decl.handler, decl.name
                    )))
                }
                Some(h) if h.kind != kind => {
                    return Err(Error::InvalidExport(format!(
                        "handler '{}' of {} is a {}, declared as a {}",
                        decl.handler, self.manifest.name, h.kind, kind
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Register every declared hook and filter through a plugin-scoped handle.
    pub fn register_declared_hooks(&self, scope: &ScopedHooks) -> Result<Vec<HookId>> {
        let mut ids = Vec::new();
        for decl in self.manifest.hooks.iter().chain(self.manifest.filters.iter()) {
            let handler = self.handlers.get(&decl.handler).ok_or_else(|| {
                Error::InvalidExport(format!("missing handler '{}'", decl.handler))
            })?;
            ids.push((handler.register)(scope, decl)?);
        }
        Ok(ids)
    }

    /// Run a lifecycle callback if present.
    ///
    /// Returns `Ok(false)` when the plugin has no callback for the stage.
    /// Callbacks run on their own task so a panic is reported as a failure.
    pub async fn run(&self, stage: LifecycleStage, ctx: PluginContext) -> Result<bool> {
        let future = match stage {
            LifecycleStage::Activate => self.callbacks.activate.as_ref().map(|f| f(ctx)),
            LifecycleStage::Deactivate => self.callbacks.deactivate.as_ref().map(|f| f(ctx)),
            LifecycleStage::Install => self.callbacks.install.as_ref().map(|f| f(ctx)),
            LifecycleStage::Uninstall => self.callbacks.uninstall.as_ref().map(|f| f(ctx)),
            LifecycleStage::Update => {
                return Err(Error::invalid_state("activate/deactivate/install/uninstall", "update"))
            }
        };

        match future {
            Some(future) => self.await_callback(stage, future).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Run the `update` callback if present.
    pub async fn run_update(&self, ctx: PluginContext, old_version: &str, new_version: &str) -> Result<bool> {
        match &self.callbacks.update {
            Some(f) => {
                let future = f(ctx, old_version.to_string(), new_version.to_string());
                self.await_callback(LifecycleStage::Update, future).await.map(|_| true)
            }
            None => Ok(false),
        }
    }

    async fn await_callback(&self, stage: LifecycleStage, future: LifecycleFuture) -> Result<()> {
        match tokio::spawn(future).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(Error::lifecycle(self.name(), stage.as_str(), msg)),
            Err(join) if join.is_panic() => {
                Err(Error::lifecycle(self.name(), stage.as_str(), "callback panicked"))
            }
            Err(join) => Err(Error::lifecycle(self.name(), stage.as_str(), join.to_string())),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("path", &self.path)
            .finish()
    }
}

/// Output of a successful load.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Plugin name.
    pub name: String,
    /// Validated manifest.
    pub manifest: Manifest,
    /// Constructed instance.
    pub instance: Arc<PluginInstance>,
    /// Plugin directory.
    pub path: PathBuf,
    /// Canonical main entry.
    pub main: PathBuf,
    /// Recursive size of the plugin directory.
    pub size_bytes: u64,
    /// SHA-256 over manifest bytes and main-file bytes, hex encoded.
    pub checksum: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookBus;
    use crate::manifest::ManifestBuilder;
    use std::sync::atomic::AtomicUsize;

    fn manifest() -> Manifest {
        ManifestBuilder::new("test-plugin", "1.0.0")
            .hook("init", "on_init", 10)
            .filter("the_title", "shout", 5)
            .build_unchecked()
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = PluginInstance::new(PluginDefinition::new(), manifest(), "/p");
        let b = PluginInstance::new(PluginDefinition::new(), manifest(), "/p");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "test-plugin");
    }

    #[test]
    fn test_verify_exports() {
        let missing = PluginInstance::new(PluginDefinition::new(), manifest(), "/p");
        assert!(matches!(missing.verify_exports(), Err(Error::InvalidExport(_))));

        let wrong_kind = PluginDefinition::new()
            .handler("on_init", HookHandler::action(|_: &()| Ok(())))
            .handler("shout", HookHandler::action(|_: &()| Ok(())));
        let wrong_kind = PluginInstance::new(wrong_kind, manifest(), "/p");
        assert!(wrong_kind.verify_exports().is_err());

        let complete = PluginDefinition::new()
            .handler("on_init", HookHandler::action(|_: &()| Ok(())))
            .handler("shout", HookHandler::filter(|v: &String, _: &()| Ok(v.to_uppercase())));
        let complete = PluginInstance::new(complete, manifest(), "/p");
        assert!(complete.verify_exports().is_ok());
    }

    #[test]
    fn test_register_declared_hooks() {
        let bus = Arc::new(HookBus::new());
        let definition = PluginDefinition::new()
            .handler("on_init", HookHandler::action(|_: &()| Ok(())))
            .handler("shout", HookHandler::filter(|v: &String, _: &()| Ok(v.to_uppercase())));
        let instance = PluginInstance::new(definition, manifest(), "/p");

        let scope = ScopedHooks::new(bus.clone(), "test-plugin");
        let ids = instance.register_declared_hooks(&scope).unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(bus.plugin_hooks("test-plugin").len(), 2);
        assert_eq!(bus.apply_filters("the_title", "hi".to_string(), &()), "HI");
    }

    #[tokio::test]
    async fn test_run_optional_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let definition = PluginDefinition::new().on_activate(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let instance = PluginInstance::new(definition, manifest(), "/p");
        let ctx = PluginContext::new(manifest(), "/p");

        assert!(instance.run(LifecycleStage::Activate, ctx.clone()).await.unwrap());
        assert!(!instance.run(LifecycleStage::Deactivate, ctx.clone()).await.unwrap());
        assert!(!instance.run_update(ctx, "1.0.0", "1.1.0").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn crash(_: PluginContext) -> std::result::Result<(), String> {
        panic!("bug")
    }

    #[tokio::test]
    async fn test_failing_and_panicking_callbacks() {
        let definition = PluginDefinition::new()
            .on_activate(|_| async { Err("no database".to_string()) })
            .on_deactivate(crash);
        let instance = PluginInstance::new(definition, manifest(), "/p");
        let ctx = PluginContext::new(manifest(), "/p");

        let err = instance.run(LifecycleStage::Activate, ctx.clone()).await.unwrap_err();
        assert!(err.to_string().contains("no database"));

        let err = instance.run(LifecycleStage::Deactivate, ctx).await.unwrap_err();
        assert_eq!(err.code(), "LIFECYCLE_FAILED");
    }
}
