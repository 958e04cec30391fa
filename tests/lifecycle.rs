//! End-to-end lifecycle tests driven through the plugin manager.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use plugin_host::{
    EventBus, HookHandler, HookOptions, JsonFileStore, Manifest, ManagerConfig, PluginContext,
    PluginDefinition, PluginHookArgs, PluginManager, PluginStatus, RecordStore, RouteTable,
    StaticResolver, HOOK_ACTIVATED,
};
use serde_json::json;
use tempfile::TempDir;

use common::{init_tracing, manager, manifest, write_plugin};

fn seo_helper(_: &Manifest) -> Result<PluginDefinition, String> {
    Ok(PluginDefinition::new().handler(
        "add_meta",
        HookHandler::filter(|html: &String, _: &()| Ok(format!("{}<meta name=\"seo\">", html))),
    ))
}

fn seo_manifest(version: &str) -> serde_json::Value {
    json!({
        "name": "seo-helper",
        "version": version,
        "title": "SEO Helper",
        "main": "index.js",
        "filters": [{"name": "the_content", "handler": "add_meta", "priority": 10}],
        "routes": [{"method": "GET", "path": "/sitemap.xml", "handler": "sitemap"}],
        "settings": {
            "sitemap": {"type": "boolean", "default": true},
        },
    })
}

#[tokio::test]
async fn test_full_lifecycle_leaves_no_trace() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));

    let routes = Arc::new(RouteTable::new());
    let events = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.on_event(move |event| {
        if event.plugin_name == "seo-helper" {
            sink.lock().push(event.event_name());
        }
    });

    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver)
        .with_events(events)
        .with_routes(routes.clone());

    let result = manager.install_plugin(&dir).await;
    assert!(result.success, "{:?}", result);
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Installed));
    let record = manager.store().get("seo-helper").await.unwrap().unwrap();
    assert_eq!(record.settings, json!({"sitemap": true}));
    assert_eq!(record.metadata.checksum.len(), 64);

    let result = manager.activate_plugin("seo-helper").await;
    assert!(result.success, "{:?}", result);
    let html = manager
        .hooks()
        .apply_filters("the_content", String::from("<p>hi</p>"), &());
    assert_eq!(html, "<p>hi</p><meta name=\"seo\">");
    assert!(routes.find("GET", "/sitemap.xml").is_some());

    let result = manager.deactivate_plugin("seo-helper").await;
    assert!(result.success, "{:?}", result);
    assert!(manager.hooks().plugin_hooks("seo-helper").is_empty());
    assert!(routes.is_empty());
    let html = manager
        .hooks()
        .apply_filters("the_content", String::from("<p>hi</p>"), &());
    assert_eq!(html, "<p>hi</p>");

    let result = manager.uninstall_plugin("seo-helper").await;
    assert!(result.success, "{:?}", result);
    assert!(manager.registry().is_empty());
    assert!(manager.hooks().is_empty());
    assert!(manager.store().get("seo-helper").await.unwrap().is_none());
    assert!(!manager.loader().is_loaded("seo-helper"));

    let seen = seen.lock();
    for name in ["installed", "activated", "deactivated", "uninstalled"] {
        assert!(seen.contains(&name), "missing {} in {:?}", name, seen);
    }
}

#[tokio::test]
async fn test_concurrent_activation_runs_once() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "slow-start", manifest("slow-start", "1.0.0"));

    let activations = Arc::new(AtomicUsize::new(0));
    let counter = activations.clone();
    let resolver = Arc::new(StaticResolver::new().with("slow-start", move |_| {
        let counter = counter.clone();
        Ok(PluginDefinition::new().on_activate(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);

    let (first, second) = tokio::join!(
        manager.activate_plugin("slow-start"),
        manager.activate_plugin("slow-start"),
    );

    assert!(first.success, "{:?}", first);
    assert!(!second.success);
    assert_eq!(second.error_code(), Some("OPERATION_IN_PROGRESS"));
    assert_eq!(activations.load(Ordering::SeqCst), 1);
    assert!(!manager.is_busy("slow-start"));

    let again = manager.activate_plugin("slow-start").await;
    assert_eq!(again.error_code(), Some("ALREADY_ACTIVE"));
}

#[tokio::test]
async fn test_install_rejects_missing_dependency() {
    let tmp = TempDir::new().unwrap();
    let mut seo = seo_manifest("1.0.0");
    seo["dependencies"] = json!({"core-utils": "^1.0.0"});
    let dir = write_plugin(tmp.path(), "seo-helper", seo);

    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver.clone());

    let result = manager.install_plugin(&dir).await;
    assert!(!result.success);
    assert_eq!(result.error_code(), Some("DEPENDENCY_MISSING"));
    let error = result.error.unwrap();
    assert_eq!(error.context["missing"], json!(["core-utils"]));

    assert!(!manager.registry().contains("seo-helper"));
    assert_eq!(resolver.resolutions(), 0);
}

#[tokio::test]
async fn test_dependency_conflict_leaves_status_unchanged() {
    let tmp = TempDir::new().unwrap();
    let core = write_plugin(tmp.path(), "core-utils", manifest("core-utils", "0.9.0"));
    let mut seo = seo_manifest("1.0.0");
    seo["dependencies"] = json!({"core-utils": "^1.0.0"});
    let seo_dir = write_plugin(tmp.path(), "seo-helper", seo);

    let resolver = Arc::new(
        StaticResolver::new()
            .with("core-utils", |_| Ok(PluginDefinition::new()))
            .with("seo-helper", seo_helper),
    );
    let manager = manager(tmp.path(), resolver.clone());
    assert!(manager.install_plugin(&core).await.success);

    // Registered without an instance, so activation would load it lazily.
    let pending = manager.loader().read_manifest(&seo_dir).await.unwrap();
    manager.registry().register(pending, None, &seo_dir).unwrap();
    let resolutions = resolver.resolutions();

    let result = manager.activate_plugin("seo-helper").await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("DEPENDENCY_CONFLICT"));
    let conflicts = &result.error.as_ref().unwrap().context["conflicts"];
    assert!(conflicts[0].as_str().unwrap().contains("0.9.0"));
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Inactive));
    assert_eq!(resolver.resolutions(), resolutions);
}

#[tokio::test]
async fn test_lazy_activation_loads_registered_plugin() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver);

    let manifest = manager.loader().read_manifest(&dir).await.unwrap();
    manager.registry().register(manifest, None, &dir).unwrap();
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Inactive));

    let result = manager.activate_plugin("seo-helper").await;
    assert!(result.success, "{:?}", result);
    assert!(manager.registry().get_instance("seo-helper").is_some());
    assert_eq!(manager.hooks().filter_count("the_content"), 1);
}

#[tokio::test]
async fn test_one_shot_activation_hook_fires_once() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    manager
        .hooks()
        .add_action(
            HOOK_ACTIVATED,
            HookOptions::new().once().plugin("audit-log"),
            move |args: &PluginHookArgs| {
                sink.lock().push(args.manifest.version.clone());
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(manager.hooks().plugin_hooks("audit-log").len(), 1);

    assert!(manager.install_plugin(&dir).await.success);
    assert!(manager.activate_plugin("seo-helper").await.success);
    assert!(manager.deactivate_plugin("seo-helper").await.success);
    assert!(manager.activate_plugin("seo-helper").await.success);

    assert_eq!(*fired.lock(), vec!["1.0.0".to_string()]);
    assert!(manager.hooks().plugin_hooks("audit-log").is_empty());
    assert!(!manager.hooks().has_action(HOOK_ACTIVATED));
}

#[tokio::test]
async fn test_failed_activation_marks_error_and_removes_hooks() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "fragile", manifest("fragile", "1.0.0"));

    let resolver = Arc::new(StaticResolver::new().with("fragile", |_| {
        Ok(PluginDefinition::new().on_activate(|ctx| async move {
            if let Some(hooks) = ctx.hooks() {
                if let Err(e) = hooks.add_action("init", 10, |_: &()| Ok(())) {
                    return Err(e.to_string());
                }
            }
            Err("database unreachable".to_string())
        }))
    }));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);

    let result = manager.activate_plugin("fragile").await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("LIFECYCLE_FAILED"));
    assert!(result.message.contains("database unreachable"));

    let entry = manager.registry().get("fragile").unwrap();
    assert_eq!(entry.status, PluginStatus::Error);
    assert!(entry.error_message.unwrap().contains("database unreachable"));
    assert!(!manager.hooks().has_action("init"));

    let record = manager.store().get("fragile").await.unwrap().unwrap();
    assert_eq!(record.status, PluginStatus::Error);
}

async fn explode(_: PluginContext) -> Result<(), String> {
    panic!("activate exploded")
}

#[tokio::test]
async fn test_panicking_activation_is_contained() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "panicky", manifest("panicky", "1.0.0"));

    let resolver = Arc::new(StaticResolver::new().with("panicky", |_| {
        Ok(PluginDefinition::new().on_activate(explode))
    }));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);

    let result = manager.activate_plugin("panicky").await;

    assert_eq!(result.error_code(), Some("LIFECYCLE_FAILED"));
    assert_eq!(manager.registry().status("panicky"), Some(PluginStatus::Error));
    assert!(!manager.is_busy("panicky"));
}

#[tokio::test]
async fn test_update_keeps_settings_and_reactivates() {
    let tmp = TempDir::new().unwrap();
    let v1 = write_plugin(tmp.path(), "seo-helper-1", seo_manifest("1.0.0"));
    let mut next = seo_manifest("2.0.0");
    next["settings"]["robots"] = json!({"type": "string", "default": "index"});
    let v2 = write_plugin(tmp.path(), "seo-helper-2", next);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", move |manifest| {
        let sink = sink.clone();
        let version = manifest.version.clone();
        Ok(seo_helper(manifest)?.on_update(move |_, from, to| {
            sink.lock().push((version.clone(), from, to));
            async { Ok(()) }
        }))
    }));
    let manager = manager(tmp.path(), resolver);

    assert!(manager.install_plugin(&v1).await.success);
    assert!(manager
        .update_settings("seo-helper", json!({"sitemap": false}))
        .await
        .success);
    assert!(manager.activate_plugin("seo-helper").await.success);

    let result = manager.update_plugin("seo-helper", &v2).await;
    assert!(result.success, "{:?}", result);

    assert_eq!(
        *updates.lock(),
        vec![("1.0.0".to_string(), "1.0.0".to_string(), "2.0.0".to_string())]
    );
    let entry = manager.registry().get("seo-helper").unwrap();
    assert_eq!(entry.status, PluginStatus::Active);
    assert_eq!(entry.manifest.version, "2.0.0");

    let record = manager.store().get("seo-helper").await.unwrap().unwrap();
    assert_eq!(record.version, "2.0.0");
    assert_eq!(record.status, PluginStatus::Active);
    assert_eq!(record.settings, json!({"sitemap": false, "robots": "index"}));
    assert_eq!(manager.hooks().filter_count("the_content"), 1);
}

#[tokio::test]
async fn test_update_rejects_other_plugin() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let other = write_plugin(tmp.path(), "gallery", manifest("gallery", "1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);

    let result = manager.update_plugin("seo-helper", &other).await;

    assert_eq!(result.error_code(), Some("NAME_MISMATCH"));
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Installed));
}

#[tokio::test]
async fn test_reload_replaces_instance() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);
    assert!(manager.activate_plugin("seo-helper").await.success);
    let before = manager.registry().get_instance("seo-helper").unwrap().id();

    std::fs::write(dir.join("index.js"), "// v1.0.1\n").unwrap();
    let result = manager.reload_plugin("seo-helper").await;
    assert!(result.success, "{:?}", result);

    let after = manager.registry().get_instance("seo-helper").unwrap().id();
    assert_ne!(before, after);
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Active));
    assert_eq!(manager.hooks().filter_count("the_content"), 1);
}

#[tokio::test]
async fn test_settings_are_checked_against_schema() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver);
    assert!(manager.install_plugin(&dir).await.success);

    let result = manager
        .update_settings("seo-helper", json!({"unknown": 1}))
        .await;
    assert_eq!(result.error_code(), Some("SETTINGS_INVALID"));

    let result = manager.update_settings("seo-helper", json!(["not", "an", "object"])).await;
    assert_eq!(result.error_code(), Some("SETTINGS_INVALID"));

    assert!(manager
        .update_settings("seo-helper", json!({"sitemap": false}))
        .await
        .success);
    assert_eq!(
        manager.settings("seo-helper").await.unwrap(),
        json!({"sitemap": false})
    );
}

#[tokio::test]
async fn test_restart_restores_active_plugins() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    write_plugin(&plugins, "seo-helper", seo_manifest("1.0.0"));
    write_plugin(&plugins, "gallery", manifest("gallery", "1.0.0"));
    let state = tmp.path().join("state").join("plugins.json");

    let resolver = Arc::new(
        StaticResolver::new()
            .with("seo-helper", seo_helper)
            .with("gallery", |_| Ok(PluginDefinition::new())),
    );
    let config = ManagerConfig::new().with_plugin_dir(&plugins);

    {
        let store = Arc::new(JsonFileStore::open(&state).await.unwrap());
        let manager = PluginManager::new(config.clone(), resolver.clone()).with_store(store);
        let report = manager.initialize().await.unwrap();
        assert_eq!(report.registered, vec!["gallery", "seo-helper"]);
        assert!(report.reactivated.is_empty());

        assert!(manager.activate_plugin("seo-helper").await.success);
        manager.shutdown().await;
        assert!(manager.registry().is_empty());
        assert!(manager.hooks().is_empty());
    }

    let store = Arc::new(JsonFileStore::open(&state).await.unwrap());
    assert_eq!(
        store.get("seo-helper").await.unwrap().unwrap().status,
        PluginStatus::Active
    );

    let manager = PluginManager::new(config, resolver).with_store(store);
    let report = manager.initialize().await.unwrap();

    assert_eq!(report.reactivated, vec!["seo-helper"]);
    assert!(report.reactivation_failures.is_empty());
    assert_eq!(manager.registry().status("seo-helper"), Some(PluginStatus::Active));
    assert_eq!(manager.registry().status("gallery"), Some(PluginStatus::Installed));
    assert_eq!(manager.hooks().filter_count("the_content"), 1);
}

#[tokio::test]
async fn test_install_twice_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "seo-helper", seo_manifest("1.0.0"));
    let resolver = Arc::new(StaticResolver::new().with("seo-helper", seo_helper));
    let manager = manager(tmp.path(), resolver.clone());

    assert!(manager.install_plugin(&dir).await.success);
    let resolutions = resolver.resolutions();
    let result = manager.install_plugin(&dir).await;

    assert_eq!(result.error_code(), Some("ALREADY_INSTALLED"));
    assert_eq!(resolver.resolutions(), resolutions);
    assert!(manager.loader().is_loaded("seo-helper"));
}

#[tokio::test]
async fn test_unknown_plugin_operations_fail_cleanly() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(tmp.path(), Arc::new(StaticResolver::new()));

    for result in [
        manager.activate_plugin("ghost").await,
        manager.deactivate_plugin("ghost").await,
        manager.uninstall_plugin("ghost").await,
        manager.reload_plugin("ghost").await,
    ] {
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("PLUGIN_NOT_FOUND"));
        assert_eq!(result.plugin_name, "ghost");
    }

    let result = manager.install_plugin(tmp.path().join("ghost")).await;
    assert_eq!(result.error_code(), Some("DIRECTORY_NOT_FOUND"));
}
