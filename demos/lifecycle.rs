//! Example walking a plugin through install, activate, update and uninstall.
//!
//! Run with: cargo run --example lifecycle

use std::sync::Arc;

use plugin_host::{
    HookHandler, ManagerConfig, Manifest, PluginDefinition, PluginManager, StaticResolver,
};
use serde_json::json;

fn seo_helper(manifest: &Manifest) -> Result<PluginDefinition, String> {
    let version = manifest.version.clone();
    Ok(PluginDefinition::new()
        .on_activate(|ctx| async move {
            println!("  [seo-helper] activated with settings {}", ctx.settings);
            Ok(())
        })
        .on_update(|_, from, to| async move {
            println!("  [seo-helper] migrating {} -> {}", from, to);
            Ok(())
        })
        .handler(
            "add_meta",
            HookHandler::filter(move |html: &String, _: &()| {
                Ok(format!("{}<meta name=\"generator\" content=\"seo-helper {}\">", html, version))
            }),
        ))
}

fn write_plugin(root: &std::path::Path, dir: &str, version: &str) -> std::io::Result<std::path::PathBuf> {
    let path = root.join(dir);
    std::fs::create_dir_all(&path)?;
    let manifest = json!({
        "name": "seo-helper",
        "version": version,
        "title": "SEO <b>Helper</b>",
        "main": "index.js",
        "filters": [{"name": "the_content", "handler": "add_meta"}],
        "settings": {"sitemap": {"type": "boolean", "default": true}},
    });
    std::fs::write(path.join("plugin.json"), manifest.to_string())?;
    std::fs::write(path.join("package.json"), r#"{"name": "seo-helper"}"#)?;
    std::fs::write(path.join("index.js"), format!("// seo-helper {}\n", version))?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Plugin Lifecycle Example ===\n");

    let workspace = tempfile::TempDir::new()?;
    let v1 = write_plugin(workspace.path(), "seo-helper", "1.0.0")?;
    let v2 = write_plugin(workspace.path(), "seo-helper-next", "1.1.0")?;

    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let config = ManagerConfig::new()
        .with_plugin_dir(workspace.path())
        .with_auto_load(false);
    let manager = PluginManager::new(config, resolver);

    manager.events().on_event(|event| {
        println!("  event: {} ({})", event.event_name(), event.plugin_name);
    });

    let report = |label: &str, result: plugin_host::OperationResult| {
        println!("{}: success={} message={}", label, result.success, result.message);
    };

    report("install", manager.install_plugin(&v1).await);
    if let Some(entry) = manager.registry().get("seo-helper") {
        println!("  title after sanitising: {:?}", entry.manifest.title);
    }

    report("activate", manager.activate_plugin("seo-helper").await);
    let html = manager
        .hooks()
        .apply_filters("the_content", String::from("<p>Hello</p>"), &());
    println!("  filtered: {}", html);

    report(
        "settings",
        manager.update_settings("seo-helper", json!({"sitemap": false})).await,
    );
    report("update", manager.update_plugin("seo-helper", &v2).await);
    let html = manager
        .hooks()
        .apply_filters("the_content", String::from("<p>Hello</p>"), &());
    println!("  filtered: {}", html);

    let stats = manager.registry().stats();
    println!("\n=== Registry ===");
    println!("  total: {}", stats.total);
    println!("  by status: {:?}", stats.by_status);

    report("uninstall", manager.uninstall_plugin("seo-helper").await);
    println!("  hooks left: {}", manager.hooks().len());

    manager.shutdown().await;
    println!("\n=== Done ===");
    Ok(())
}
