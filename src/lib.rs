//! # plugin-host
//!
//! Plugin extensibility core for content-management hosts: install, load,
//! activate, deactivate and update extension modules at runtime, and let them
//! alter host behaviour through a priority-ordered action/filter hook bus.
//!
//! This crate provides:
//! - **Plugin Loading** - Validate plugin directories, resolve and construct modules under a timeout
//! - **Manifest Validation** - Sanitise and validate `plugin.json` manifests
//! - **Hook Bus** - Typed, priority-ordered actions and filters with crash isolation
//! - **Registry** - Status tracking, dependency checks, search and statistics
//! - **Lifecycle Management** - Concurrency-guarded install/activate/deactivate/uninstall/update
//! - **Hot Reload** - Reload plugins when their files change
//! - **Metrics Hooks** - Prometheus counters fed by lifecycle events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plugin_host::{HookHandler, ManagerConfig, PluginDefinition, PluginManager, StaticResolver};
//!
//! let resolver = StaticResolver::new().with("seo-helper", |_| {
//!     Ok(PluginDefinition::new()
//!         .handler("add_meta", HookHandler::filter(|html: &String, _: &()| Ok(format!("{html}<meta>")))))
//! });
//!
//! let manager = PluginManager::new(ManagerConfig::default(), Arc::new(resolver));
//! manager.install_plugin("plugins/seo-helper").await;
//! manager.activate_plugin("seo-helper").await;
//!
//! let html = manager.hooks().apply_filters("the_content", String::from("<p>hi</p>"), &());
//! ```
//!
//! ## Feature Flags
//!
//! - `watch`: Enable filesystem watching for hot reload
//! - `metrics-prometheus`: Prometheus metrics integration
//! - `dynamic`: Load plugins from shared libraries with `libloading`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod error;
mod hooks;
mod lifecycle;
mod loader;
mod manager;
mod manifest;
mod plugin;
mod registry;
mod routes;
mod store;
mod version;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

#[cfg(feature = "dynamic")]
pub mod dynamic;

pub use error::{Error, ErrorKind, Result};
pub use hooks::{
    DispatchReport, HookBus, HookError, HookFailure, HookId, HookKind, HookListing, HookOptions,
    HookResult, ScopedHooks,
};
pub use lifecycle::{EventBus, EventKind, PluginEvent, PluginStatus};
pub use loader::{
    compute_checksum, directory_size, BatchLoad, LoadOptions, LoaderConfig, ModuleRequest,
    ModuleResolver, PluginLoader, StaticResolver, DEFAULT_LOAD_TIMEOUT,
};
pub use manager::{
    InitializeReport, ManagerConfig, OperationError, OperationResult, PluginHookArgs, PluginManager,
    HOOK_ACTIVATED, HOOK_BEFORE_ACTIVATE, HOOK_DEACTIVATED,
};
pub use manifest::{
    sanitize_text, AdminMenu, Capability, HookDeclaration, Manifest, ManifestBuilder,
    RouteDescriptor, SettingDefinition, SettingKind, DEFAULT_PRIORITY,
};
pub use plugin::{
    HookHandler, LifecycleCallbacks, LifecycleFn, LifecycleFuture, LifecycleStage, LoadedPlugin,
    PluginContext, PluginDefinition, PluginFactory, PluginInstance, UpdateFn,
};
pub use registry::{DependencyReport, PluginRegistry, RegistryEntry, RegistryStats, VersionConflict};
pub use routes::{RouteRegistrar, RouteTable};
pub use store::{JsonFileStore, MemoryRecordStore, PluginRecord, RecordMetadata, RecordStore};
pub use version::{satisfies, Version};

#[cfg(feature = "watch")]
pub use watcher::{plugin_dir_for, reload_changed, ChangeKind, PluginChange, PluginWatcher, WatchConfig};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
