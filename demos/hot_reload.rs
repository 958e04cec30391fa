//! Hot-reload example.
//!
//! Loads every plugin under `./plugins`, activates them, then reloads a
//! plugin whenever a file inside its directory changes.
//!
//! Run with: cargo run --example hot_reload --features watch

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use plugin_host::{
    reload_changed, ManagerConfig, PluginDefinition, PluginManager, PluginStatus, PluginWatcher,
    StaticResolver, WatchConfig,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let plugins_dir = PathBuf::from("./plugins");
    if !plugins_dir.exists() {
        info!("Plugins directory not found, create ./plugins/<name>/ with plugin.json, package.json and index.js");
        return Ok(());
    }

    // Every plugin name resolves to an empty definition here; a real host
    // registers its compiled-in plugins or uses a dynamic resolver.
    let resolver = Arc::new(StaticResolver::new());
    for entry in std::fs::read_dir(&plugins_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            resolver.register(name, |_| Ok(PluginDefinition::new()));
        }
    }

    let manager = PluginManager::new(ManagerConfig::new().with_plugin_dir(&plugins_dir), resolver);
    let report = manager.initialize().await?;
    info!(registered = ?report.registered, failed = report.failed.len(), "Initialized");

    for name in manager.registry().names() {
        if manager.registry().status(&name) == Some(PluginStatus::Installed) {
            let result = manager.activate_plugin(&name).await;
            info!(plugin = %name, success = result.success, "{}", result.message);
        }
    }

    let config = WatchConfig::new()
        .with_debounce(Duration::from_millis(500))
        .with_extensions(vec!["js".into(), "json".into()]);
    let mut watcher = PluginWatcher::new(&plugins_dir, config)?;

    info!("Watching for file changes. Press Ctrl+C to exit.");

    loop {
        tokio::select! {
            change = watcher.next_change() => {
                let Some(change) = change else { break };
                match reload_changed(&manager, &change).await {
                    Some(result) if result.success => info!(plugin = %result.plugin_name, "Reloaded"),
                    Some(result) => warn!(plugin = %result.plugin_name, "{}", result.message),
                    None => info!(dir = %change.plugin_dir.display(), "Change outside a registered plugin"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}
