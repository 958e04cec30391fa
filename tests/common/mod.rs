//! Fixtures shared by the integration suites.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use plugin_host::{ManagerConfig, PluginManager, StaticResolver};
use serde_json::{json, Value};

/// Write a plugin directory under `root` and return its path.
///
/// The main entry named by the manifest is created next to `plugin.json`
/// unless it already exists.
pub fn write_plugin(root: &Path, dir: &str, manifest: Value) -> PathBuf {
    let path = root.join(dir);
    fs::create_dir_all(&path).unwrap();
    fs::write(
        path.join("plugin.json"),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
    fs::write(
        path.join("package.json"),
        json!({"name": dir, "private": true}).to_string(),
    )
    .unwrap();

    if let Some(main) = manifest.get("main").and_then(Value::as_str) {
        let main = path.join(main);
        if let Some(parent) = main.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        if !main.exists() {
            fs::write(&main, format!("// {}\n", dir)).unwrap();
        }
    }
    path
}

/// Minimal manifest for `name` at `version`.
pub fn manifest(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "main": "index.js",
    })
}

/// Manager over `root` without auto-loading.
pub fn manager(root: &Path, resolver: Arc<StaticResolver>) -> PluginManager {
    let config = ManagerConfig::new()
        .with_plugin_dir(root)
        .with_auto_load(false);
    PluginManager::new(config, resolver)
}

/// Route test logs to the test writer when `RUST_LOG` asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
