//! Plugin status and lifecycle notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::manifest::Manifest;

/// Status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Registered with a live instance, not active.
    Installed,
    /// Active; hooks registered.
    Active,
    /// Registered without an instance.
    Inactive,
    /// Last operation failed.
    Error,
    /// Update in progress.
    Updating,
    /// Uninstall in progress.
    Uninstalling,
}

impl PluginStatus {
    /// Check if the plugin can be activated.
    pub fn can_activate(&self) -> bool {
        matches!(self, Self::Installed | Self::Inactive | Self::Error)
    }

    /// Check if the plugin can be deactivated.
    pub fn can_deactivate(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the plugin can be uninstalled without deactivating first.
    pub fn can_uninstall(&self) -> bool {
        matches!(self, Self::Installed | Self::Inactive | Self::Error)
    }

    /// Check if an update or uninstall is running.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Updating | Self::Uninstalling)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Installed => "Plugin installed and ready to activate",
            Self::Active => "Plugin active and hooked into the host",
            Self::Inactive => "Plugin registered but not loaded",
            Self::Error => "Plugin in error state",
            Self::Updating => "Plugin update in progress",
            Self::Uninstalling => "Plugin uninstall in progress",
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Updating => "updating",
            Self::Uninstalling => "uninstalling",
        };
        write!(f, "{}", name)
    }
}

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Plugin was installed.
    Installed,
    /// Plugin was activated.
    Activated,
    /// Plugin was deactivated.
    Deactivated,
    /// Plugin was uninstalled.
    Uninstalled,
    /// Plugin was updated to a new version.
    Updated,
    /// Registry status changed.
    StatusChanged,
    /// Entry added to the registry.
    Registered,
    /// Entry removed from the registry.
    Unregistered,
    /// A hook callback failed during dispatch.
    HookFailed,
}

impl EventKind {
    /// Get the event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
            Self::Uninstalled => "uninstalled",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
            Self::HookFailed => "hook_failed",
        }
    }
}

/// Lifecycle notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Plugin name.
    pub plugin_name: String,
    /// Manifest at the time of the event.
    pub manifest: Option<Manifest>,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific fields.
    pub extra: Map<String, Value>,
}

impl PluginEvent {
    /// Create an event.
    pub fn new(kind: EventKind, plugin_name: impl Into<String>, manifest: Option<&Manifest>) -> Self {
        Self {
            kind,
            plugin_name: plugin_name.into(),
            manifest: manifest.cloned(),
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Attach an extra field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Status transition event.
    pub fn status_changed(
        plugin_name: &str,
        manifest: &Manifest,
        from: PluginStatus,
        to: PluginStatus,
        error_message: Option<&str>,
    ) -> Self {
        let event = Self::new(EventKind::StatusChanged, plugin_name, Some(manifest))
            .with("from", from.to_string())
            .with("to", to.to_string());
        match error_message {
            Some(msg) => event.with("errorMessage", msg),
            None => event,
        }
    }

    /// Hook callback failure event.
    pub fn hook_failed(plugin_name: &str, hook: &str, message: &str) -> Self {
        Self::new(EventKind::HookFailed, plugin_name, None)
            .with("hook", hook)
            .with("error", message)
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        self.kind.as_str()
    }
}

type EventHandler = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Fan-out of lifecycle notifications to subscribers.
pub struct EventBus {
    handlers: RwLock<Vec<EventHandler>>,
}

impl EventBus {
    /// Create an event bus without subscribers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: PluginEvent) {
        tracing::debug!(event = event.event_name(), plugin = %event.plugin_name, "Plugin event");
        let handlers: Vec<EventHandler> = self.handlers.read().clone();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of subscribers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}
