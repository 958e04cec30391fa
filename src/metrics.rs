//! Prometheus metrics for plugin lifecycle and hook dispatch.

use std::sync::Arc;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use crate::error::{Error, Result};
use crate::lifecycle::{EventBus, EventKind, PluginEvent};

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "plugin_host".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Plugin metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    lifecycle: IntCounterVec,
    failures: IntCounter,
    hook_failures: IntCounterVec,
    load_duration: Histogram,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Config(format!("metrics: {}", e))
}

impl PluginMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let lifecycle = IntCounterVec::new(
            Opts::new(
                format!("{}_lifecycle_events_total", config.prefix),
                "Plugin lifecycle transitions by event",
            ),
            &["event"],
        )
        .map_err(metric_error)?;

        let failures = IntCounter::new(
            format!("{}_failures_total", config.prefix),
            "Plugins moved to the error state",
        )
        .map_err(metric_error)?;

        let hook_failures = IntCounterVec::new(
            Opts::new(
                format!("{}_hook_failures_total", config.prefix),
                "Hook callbacks that failed during dispatch",
            ),
            &["plugin"],
        )
        .map_err(metric_error)?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", config.prefix),
                "Plugin load duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(lifecycle.clone())).map_err(metric_error)?;
        registry.register(Box::new(failures.clone())).map_err(metric_error)?;
        registry.register(Box::new(hook_failures.clone())).map_err(metric_error)?;
        registry.register(Box::new(load_duration.clone())).map_err(metric_error)?;

        Ok(Self {
            config,
            registry,
            lifecycle,
            failures,
            hook_failures,
            load_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Subscribe to an event bus.
    pub fn attach(self: &Arc<Self>, events: &EventBus) {
        let metrics = Arc::clone(self);
        events.on_event(move |event| metrics.observe(event));
    }

    /// Count one lifecycle event.
    pub fn observe(&self, event: &PluginEvent) {
        match event.kind {
            EventKind::HookFailed => {
                self.hook_failures.with_label_values(&[event.plugin_name.as_str()]).inc();
            }
            EventKind::StatusChanged => {
                if event.extra.get("to").and_then(|v| v.as_str()) == Some("error") {
                    self.failures.inc();
                }
            }
            EventKind::Registered | EventKind::Unregistered => {}
            kind => self.lifecycle.with_label_values(&[kind.as_str()]).inc(),
        }
    }

    /// Record how long a load took.
    pub fn record_load(&self, duration_secs: f64) {
        self.load_duration.observe(duration_secs);
    }

    /// Count of a lifecycle event, e.g. `activated`.
    pub fn lifecycle_total(&self, event: &str) -> u64 {
        self.lifecycle.with_label_values(&[event]).get()
    }

    /// Total plugins moved to the error state.
    pub fn failures_total(&self) -> u64 {
        self.failures.get()
    }

    /// Hook failures attributed to a plugin.
    pub fn hook_failures_total(&self, plugin: &str) -> u64 {
        self.hook_failures.with_label_values(&[plugin]).get()
    }

    /// Number of recorded loads.
    pub fn loads_total(&self) -> u64 {
        self.load_duration.get_sample_count()
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("failures", &self.failures_total())
            .field("loads", &self.loads_total())
            .finish()
    }
}
