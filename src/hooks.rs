//! Action/filter hook bus.
//!
//! Subscribers are kept per channel in ascending priority order. Ties keep
//! registration order because the sort is stable. Every channel is bound to
//! the Rust payload type of its first registration; later registrations with
//! another type are rejected.
//!
//! Dispatch never holds a lock while a callback runs, so callbacks may
//! register, remove or dispatch hooks themselves. A callback that returns an
//! error or panics is logged, reported on the event bus and skipped; the
//! remaining subscribers still run.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::lifecycle::{EventBus, PluginEvent};
use crate::manifest::DEFAULT_PRIORITY;

/// Error returned by a hook callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<&str> for HookError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HookError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Result returned by hook callbacks.
pub type HookResult<T = ()> = std::result::Result<T, HookError>;

type ActionFn<A> = Arc<dyn Fn(&A) -> HookResult + Send + Sync>;
type FilterFn<V, A> = Arc<dyn Fn(&V, &A) -> HookResult<V> + Send + Sync>;

/// Identity of a single subscription, returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Side-effect subscribers.
    Action,
    /// Value-transforming pipeline.
    Filter,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => f.write_str("action"),
            Self::Filter => f.write_str("filter"),
        }
    }
}

/// Registration options.
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Ascending priority; lower runs first.
    pub priority: i32,
    /// Owning plugin, used for bulk teardown.
    pub plugin: Option<String>,
    /// Remove after the first dispatch cycle that invoked it (actions only).
    pub once: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            plugin: None,
            once: false,
        }
    }
}

impl HookOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the owning plugin.
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Mark as one-shot.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// A subscription as seen by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookListing {
    /// Subscription id.
    pub id: HookId,
    /// Channel kind.
    pub kind: HookKind,
    /// Channel name.
    pub name: String,
    /// Priority.
    pub priority: i32,
    /// One-shot flag.
    pub once: bool,
}

/// A callback failure observed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    /// Failed subscription.
    pub id: HookId,
    /// Owning plugin, if any.
    pub plugin: Option<String>,
    /// Error or panic message.
    pub message: String,
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Subscribers invoked, including failed ones.
    pub invoked: usize,
    /// Subscribers that failed.
    pub failures: Vec<HookFailure>,
}

impl DispatchReport {
    /// True when every invoked subscriber succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Subscription {
    id: HookId,
    priority: i32,
    plugin: Option<String>,
    once: bool,
    callback: Arc<dyn Any + Send + Sync>,
}

struct Channel {
    payload: TypeId,
    payload_name: &'static str,
    subs: Vec<Subscription>,
}

type Snapshot = Vec<(HookId, Option<String>, bool, Arc<dyn Any + Send + Sync>)>;

/// Named, priority-ordered action and filter dispatch.
pub struct HookBus {
    actions: RwLock<HashMap<String, Channel>>,
    filters: RwLock<HashMap<String, Channel>>,
    next_id: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl HookBus {
    /// Create an empty hook bus.
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events: None,
        }
    }

    /// Report callback failures on an event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn channels(&self, kind: HookKind) -> &RwLock<HashMap<String, Channel>> {
        match kind {
            HookKind::Action => &self.actions,
            HookKind::Filter => &self.filters,
        }
    }

    fn insert(
        &self,
        kind: HookKind,
        name: String,
        payload: TypeId,
        payload_name: &'static str,
        options: HookOptions,
        callback: Arc<dyn Any + Send + Sync>,
    ) -> Result<HookId> {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels(kind).write();
        let channel = channels.entry(name.clone()).or_insert_with(|| Channel {
            payload,
            payload_name,
            subs: Vec::new(),
        });

        if channel.payload != payload {
            return Err(Error::PayloadMismatch {
                hook: name,
                expected: channel.payload_name,
                found: payload_name,
            });
        }

        channel.subs.push(Subscription {
            id,
            priority: options.priority,
            plugin: options.plugin.clone(),
            once: options.once && kind == HookKind::Action,
            callback,
        });
        channel.subs.sort_by_key(|s| s.priority);

        debug!(
            hook = %name,
            kind = %kind,
            plugin = ?options.plugin,
            priority = options.priority,
            "Hook registered"
        );

        Ok(id)
    }

    /// Subscribe to an action channel.
    pub fn add_action<A, F>(&self, name: impl Into<String>, options: HookOptions, callback: F) -> Result<HookId>
    where
        A: 'static,
        F: Fn(&A) -> HookResult + Send + Sync + 'static,
    {
        let callback: ActionFn<A> = Arc::new(callback);
        self.insert(
            HookKind::Action,
            name.into(),
            TypeId::of::<A>(),
            std::any::type_name::<A>(),
            options,
            Arc::new(callback),
        )
    }

    /// Subscribe to a filter channel.
    pub fn add_filter<V, A, F>(&self, name: impl Into<String>, options: HookOptions, callback: F) -> Result<HookId>
    where
        V: 'static,
        A: 'static,
        F: Fn(&V, &A) -> HookResult<V> + Send + Sync + 'static,
    {
        let callback: FilterFn<V, A> = Arc::new(callback);
        self.insert(
            HookKind::Filter,
            name.into(),
            TypeId::of::<(V, A)>(),
            std::any::type_name::<(V, A)>(),
            options,
            Arc::new(callback),
        )
    }

    fn snapshot(
        &self,
        kind: HookKind,
        name: &str,
        payload: TypeId,
        payload_name: &'static str,
    ) -> std::result::Result<Snapshot, String> {
        let channels = self.channels(kind).read();
        let Some(channel) = channels.get(name) else {
            return Ok(Vec::new());
        };
        if channel.payload != payload {
            return Err(format!(
                "{} {} carries {}, dispatched with {}",
                kind, name, channel.payload_name, payload_name
            ));
        }
        Ok(channel
            .subs
            .iter()
            .map(|s| (s.id, s.plugin.clone(), s.once, s.callback.clone()))
            .collect())
    }

    fn report_failure(&self, kind: HookKind, name: &str, failure: &HookFailure) {
        error!(
            hook = %name,
            kind = %kind,
            plugin = ?failure.plugin,
            error = %failure.message,
            "Hook callback failed"
        );
        if let Some(events) = &self.events {
            events.emit(PluginEvent::hook_failed(
                failure.plugin.as_deref().unwrap_or_default(),
                name,
                &failure.message,
            ));
        }
    }

    /// Invoke every subscriber of an action channel.
    pub fn do_action<A: 'static>(&self, name: &str, args: &A) -> DispatchReport {
        let mut report = DispatchReport::default();

        let subs = match self.snapshot(
            HookKind::Action,
            name,
            TypeId::of::<A>(),
            std::any::type_name::<A>(),
        ) {
            Ok(subs) => subs,
            Err(message) => {
                let failure = HookFailure {
                    id: HookId(0),
                    plugin: None,
                    message,
                };
                self.report_failure(HookKind::Action, name, &failure);
                report.failures.push(failure);
                return report;
            }
        };

        let mut fired_once = HashSet::new();
        for (id, plugin, once, callback) in subs {
            let Some(callback) = callback.downcast_ref::<ActionFn<A>>() else {
                continue;
            };

            report.invoked += 1;
            if once {
                fired_once.insert(id);
            }

            if let Err(message) = invoke(|| callback(args)) {
                let failure = HookFailure { id, plugin, message };
                self.report_failure(HookKind::Action, name, &failure);
                report.failures.push(failure);
            }
        }

        if !fired_once.is_empty() {
            let mut channels = self.actions.write();
            if let Some(channel) = channels.get_mut(name) {
                channel.subs.retain(|s| !fired_once.contains(&s.id));
                if channel.subs.is_empty() {
                    channels.remove(name);
                }
            }
        }

        report
    }

    /// Pass a value through every subscriber of a filter channel.
    ///
    /// A failing step leaves the running value unchanged.
    pub fn apply_filters<V: 'static, A: 'static>(&self, name: &str, value: V, args: &A) -> V {
        let subs = match self.snapshot(
            HookKind::Filter,
            name,
            TypeId::of::<(V, A)>(),
            std::any::type_name::<(V, A)>(),
        ) {
            Ok(subs) => subs,
            Err(message) => {
                let failure = HookFailure {
                    id: HookId(0),
                    plugin: None,
                    message,
                };
                self.report_failure(HookKind::Filter, name, &failure);
                return value;
            }
        };

        let mut value = value;
        for (id, plugin, _, callback) in subs {
            let Some(callback) = callback.downcast_ref::<FilterFn<V, A>>() else {
                continue;
            };

            match invoke(|| callback(&value, args)) {
                Ok(next) => value = next,
                Err(message) => {
                    let failure = HookFailure { id, plugin, message };
                    self.report_failure(HookKind::Filter, name, &failure);
                }
            }
        }

        value
    }

    fn remove(&self, kind: HookKind, name: &str, id: HookId, plugin: Option<&str>) -> bool {
        let mut channels = self.channels(kind).write();
        let Some(channel) = channels.get_mut(name) else {
            return false;
        };

        let before = channel.subs.len();
        channel
            .subs
            .retain(|s| !(s.id == id && plugin.map_or(true, |p| s.plugin.as_deref() == Some(p))));
        let removed = before != channel.subs.len();
        if channel.subs.is_empty() {
            channels.remove(name);
        }
        removed
    }

    /// Remove one action subscription, optionally only if owned by `plugin`.
    pub fn remove_action(&self, name: &str, id: HookId, plugin: Option<&str>) -> bool {
        self.remove(HookKind::Action, name, id, plugin)
    }

    /// Remove one filter subscription, optionally only if owned by `plugin`.
    pub fn remove_filter(&self, name: &str, id: HookId, plugin: Option<&str>) -> bool {
        self.remove(HookKind::Filter, name, id, plugin)
    }

    /// Remove every action and filter owned by a plugin.
    pub fn remove_plugin_hooks(&self, plugin: &str) -> usize {
        let mut removed = 0;
        for kind in [HookKind::Action, HookKind::Filter] {
            let mut channels = self.channels(kind).write();
            for channel in channels.values_mut() {
                let before = channel.subs.len();
                channel.subs.retain(|s| s.plugin.as_deref() != Some(plugin));
                removed += before - channel.subs.len();
            }
            channels.retain(|_, c| !c.subs.is_empty());
        }

        if removed > 0 {
            debug!(plugin = %plugin, removed, "Plugin hooks removed");
        }
        removed
    }

    /// List every subscription owned by a plugin.
    pub fn plugin_hooks(&self, plugin: &str) -> Vec<HookListing> {
        let mut listing = Vec::new();
        for kind in [HookKind::Action, HookKind::Filter] {
            let channels = self.channels(kind).read();
            for (name, channel) in channels.iter() {
                listing.extend(
                    channel
                        .subs
                        .iter()
                        .filter(|s| s.plugin.as_deref() == Some(plugin))
                        .map(|s| HookListing {
                            id: s.id,
                            kind,
                            name: name.clone(),
                            priority: s.priority,
                            once: s.once,
                        }),
                );
            }
        }
        listing.sort_by_key(|l| l.id);
        listing
    }

    /// Number of subscribers on an action channel.
    pub fn action_count(&self, name: &str) -> usize {
        self.actions.read().get(name).map_or(0, |c| c.subs.len())
    }

    /// Number of subscribers on a filter channel.
    pub fn filter_count(&self, name: &str) -> usize {
        self.filters.read().get(name).map_or(0, |c| c.subs.len())
    }

    /// Whether an action channel has subscribers.
    pub fn has_action(&self, name: &str) -> bool {
        self.action_count(name) > 0
    }

    /// Whether a filter channel has subscribers.
    pub fn has_filter(&self, name: &str) -> bool {
        self.filter_count(name) > 0
    }

    /// Total subscriptions across all channels.
    pub fn len(&self) -> usize {
        let count = |map: &HashMap<String, Channel>| map.values().map(|c| c.subs.len()).sum::<usize>();
        count(&self.actions.read()) + count(&self.filters.read())
    }

    /// Whether no subscriptions exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every channel.
    pub fn clear(&self) {
        self.actions.write().clear();
        self.filters.write().clear();
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBus")
            .field("actions", &self.actions.read().len())
            .field("filters", &self.filters.read().len())
            .finish()
    }
}

fn invoke<T>(f: impl FnOnce() -> HookResult<T>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.0),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Hook bus handle that tags every registration with one plugin's name.
#[derive(Clone)]
pub struct ScopedHooks {
    bus: Arc<HookBus>,
    plugin: String,
}

impl ScopedHooks {
    /// Create a handle for `plugin`.
    pub fn new(bus: Arc<HookBus>, plugin: impl Into<String>) -> Self {
        Self {
            bus,
            plugin: plugin.into(),
        }
    }

    /// Owning plugin.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    fn options(&self, priority: i32) -> HookOptions {
        HookOptions::new().priority(priority).plugin(self.plugin.clone())
    }

    /// Subscribe to an action channel.
    pub fn add_action<A, F>(&self, name: impl Into<String>, priority: i32, callback: F) -> Result<HookId>
    where
        A: 'static,
        F: Fn(&A) -> HookResult + Send + Sync + 'static,
    {
        self.bus.add_action(name, self.options(priority), callback)
    }

    /// Subscribe to an action channel for a single dispatch.
    pub fn add_action_once<A, F>(&self, name: impl Into<String>, priority: i32, callback: F) -> Result<HookId>
    where
        A: 'static,
        F: Fn(&A) -> HookResult + Send + Sync + 'static,
    {
        self.bus.add_action(name, self.options(priority).once(), callback)
    }

    /// Subscribe to a filter channel.
    pub fn add_filter<V, A, F>(&self, name: impl Into<String>, priority: i32, callback: F) -> Result<HookId>
    where
        V: 'static,
        A: 'static,
        F: Fn(&V, &A) -> HookResult<V> + Send + Sync + 'static,
    {
        self.bus.add_filter(name, self.options(priority), callback)
    }

    /// Remove one of this plugin's actions.
    pub fn remove_action(&self, name: &str, id: HookId) -> bool {
        self.bus.remove_action(name, id, Some(&self.plugin))
    }

    /// Remove one of this plugin's filters.
    pub fn remove_filter(&self, name: &str, id: HookId) -> bool {
        self.bus.remove_filter(name, id, Some(&self.plugin))
    }

    /// Fire an action.
    pub fn do_action<A: 'static>(&self, name: &str, args: &A) -> DispatchReport {
        self.bus.do_action(name, args)
    }

    /// Run a filter chain.
    pub fn apply_filters<V: 'static, A: 'static>(&self, name: &str, value: V, args: &A) -> V {
        self.bus.apply_filters(name, value, args)
    }
}

impl std::fmt::Debug for ScopedHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHooks")
            .field("plugin", &self.plugin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_priority_ordering() {
        let bus = HookBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for priority in [20, 5, 10] {
            let order = order.clone();
            bus.add_action("init", HookOptions::new().priority(priority), move |_: &()| {
                order.lock().push(priority);
                Ok(())
            })
            .unwrap();
        }

        let report = bus.do_action("init", &());
        assert_eq!(report.invoked, 3);
        assert_eq!(*order.lock(), vec![5, 10, 20]);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let bus = HookBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let order = order.clone();
            bus.add_action("init", HookOptions::new(), move |_: &()| {
                order.lock().push(label);
                Ok(())
            })
            .unwrap();
        }
        let order_early = order.clone();
        bus.add_action("init", HookOptions::new().priority(1), move |_: &()| {
            order_early.lock().push("early");
            Ok(())
        })
        .unwrap();

        bus.do_action("init", &());
        assert_eq!(*order.lock(), vec!["early", "a", "b", "c"]);
    }

    #[test]
    fn test_failing_action_does_not_stop_dispatch() {
        let bus = HookBus::new();
        let hits = Arc::new(Mutex::new(0));

        bus.add_action("save_post", HookOptions::new().priority(1), |_: &u32| {
            Err("database down".into())
        })
        .unwrap();
        bus.add_action("save_post", HookOptions::new().priority(2), |_: &u32| {
            panic!("plugin bug")
        })
        .unwrap();
        let counter = hits.clone();
        bus.add_action("save_post", HookOptions::new().priority(3), move |id: &u32| {
            *counter.lock() += *id;
            Ok(())
        })
        .unwrap();

        let report = bus.do_action("save_post", &7u32);
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[1].message.contains("plugin bug"));
        assert_eq!(*hits.lock(), 7);
    }

    #[test]
    fn test_filter_chain() {
        let bus = HookBus::new();

        bus.add_filter("the_title", HookOptions::new().priority(20), |v: &String, _: &()| {
            Ok(format!("{}!", v))
        })
        .unwrap();
        bus.add_filter("the_title", HookOptions::new().priority(5), |v: &String, _: &()| {
            Ok(v.to_uppercase())
        })
        .unwrap();

        let out = bus.apply_filters("the_title", "hello".to_string(), &());
        assert_eq!(out, "HELLO!");
    }

    #[test]
    fn test_failing_filter_keeps_value() {
        let bus = HookBus::new();

        bus.add_filter("price", HookOptions::new().priority(1), |v: &i64, _: &()| Ok(v + 1))
            .unwrap();
        bus.add_filter("price", HookOptions::new().priority(2), |_: &i64, _: &()| {
            Err("nope".into())
        })
        .unwrap();
        bus.add_filter("price", HookOptions::new().priority(3), |v: &i64, _: &()| Ok(v * 10))
            .unwrap();

        assert_eq!(bus.apply_filters("price", 1i64, &()), 20);
    }

    #[test]
    fn test_filter_without_subscribers_passes_through() {
        let bus = HookBus::new();
        assert_eq!(bus.apply_filters("nothing", 42u8, &"extra"), 42);
    }

    #[test]
    fn test_filter_extra_args() {
        let bus = HookBus::new();
        bus.add_filter("excerpt", HookOptions::new(), |v: &String, len: &usize| {
            Ok(v.chars().take(*len).collect())
        })
        .unwrap();

        assert_eq!(bus.apply_filters("excerpt", "abcdef".to_string(), &3usize), "abc");
    }

    #[test]
    fn test_once_removed_after_cycle() {
        let bus = HookBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();

        bus.add_action("boot", HookOptions::new().once().plugin("p"), move |_: &()| {
            *counter.lock() += 1;
            Ok(())
        })
        .unwrap();

        bus.do_action("boot", &());
        bus.do_action("boot", &());
        assert_eq!(*hits.lock(), 1);
        assert!(bus.plugin_hooks("p").is_empty());
    }

    #[test]
    fn test_payload_type_is_fixed_per_channel() {
        let bus = HookBus::new();
        bus.add_action("typed", HookOptions::new(), |_: &u32| Ok(())).unwrap();

        let err = bus
            .add_action("typed", HookOptions::new(), |_: &String| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::PayloadMismatch { .. }));

        let report = bus.do_action("typed", &"wrong".to_string());
        assert_eq!(report.invoked, 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_remove_by_id_and_owner() {
        let bus = HookBus::new();
        let id = bus
            .add_action("x", HookOptions::new().plugin("a"), |_: &()| Ok(()))
            .unwrap();

        assert!(!bus.remove_action("x", id, Some("b")));
        assert!(bus.remove_action("x", id, Some("a")));
        assert!(!bus.has_action("x"));

        let id = bus.add_filter("y", HookOptions::new(), |v: &u8, _: &()| Ok(*v)).unwrap();
        assert!(bus.remove_filter("y", id, None));
    }

    #[test]
    fn test_remove_plugin_hooks() {
        let bus = Arc::new(HookBus::new());
        let scope = ScopedHooks::new(bus.clone(), "seo-helper");

        scope.add_action("wp_head", 10, |_: &()| Ok(())).unwrap();
        scope.add_filter("the_content", 10, |v: &String, _: &()| Ok(v.clone())).unwrap();
        bus.add_action("wp_head", HookOptions::new().plugin("other"), |_: &()| Ok(()))
            .unwrap();

        assert_eq!(bus.plugin_hooks("seo-helper").len(), 2);
        assert_eq!(bus.remove_plugin_hooks("seo-helper"), 2);
        assert!(bus.plugin_hooks("seo-helper").is_empty());
        assert_eq!(bus.action_count("wp_head"), 1);
    }

    #[test]
    fn test_channel_released_after_teardown() {
        let bus = HookBus::new();
        bus.add_action("render", HookOptions::new().plugin("a"), |_: &u32| Ok(()))
            .unwrap();

        assert_eq!(bus.remove_plugin_hooks("a"), 1);
        assert!(bus.is_empty());

        bus.add_action("render", HookOptions::new().plugin("b"), |_: &String| Ok(()))
            .unwrap();
        assert_eq!(bus.action_count("render"), 1);
        assert_eq!(bus.do_action("render", &"page".to_string()).invoked, 1);
    }

    #[test]
    fn test_channel_released_after_last_removal() {
        let bus = HookBus::new();
        let id = bus.add_filter("title", HookOptions::new(), |v: &u8, _: &()| Ok(*v)).unwrap();
        assert!(bus.remove_filter("title", id, None));
        bus.add_filter("title", HookOptions::new(), |v: &String, _: &()| Ok(v.clone()))
            .unwrap();

        bus.add_action("boot", HookOptions::new().once(), |_: &()| Ok(())).unwrap();
        bus.do_action("boot", &());
        bus.add_action("boot", HookOptions::new(), |_: &u64| Ok(())).unwrap();
        assert_eq!(bus.do_action("boot", &7u64).invoked, 1);
    }

    #[test]
    fn test_callbacks_may_reenter_bus() {
        let bus = Arc::new(HookBus::new());
        let inner = bus.clone();

        bus.add_action("outer", HookOptions::new(), move |_: &()| {
            inner
                .add_action("late", HookOptions::new(), |_: &()| Ok(()))
                .map(|_| ())
                .map_err(|e| HookError(e.to_string()))
        })
        .unwrap();

        bus.do_action("outer", &());
        assert!(bus.has_action("late"));
    }
}
