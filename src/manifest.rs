//! Plugin manifest schema, sanitising and validation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::version::Version;

/// Fields that must be present in every manifest.
pub const REQUIRED_FIELDS: &[&str] = &["name", "version", "main"];

/// Default subscription priority.
pub const DEFAULT_PRIORITY: i32 = 10;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static regex"));

/// Feature category a plugin claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Adds screens or menus to the admin interface.
    AdminInterface,
    /// Transforms content through filters.
    ContentFilters,
    /// Sends or receives webhooks.
    Webhooks,
    /// Declares HTTP routes.
    Routes,
    /// Provides widgets.
    Widgets,
    /// Provides shortcodes.
    Shortcodes,
    /// Runs scheduled tasks.
    ScheduledTasks,
    /// Exposes a settings page.
    Settings,
    /// Owns database tables.
    Database,
    /// Sends email.
    Email,
    /// Processes media.
    Media,
    /// Extends search.
    Search,
}

impl Capability {
    /// Wire name of the capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdminInterface => "admin-interface",
            Self::ContentFilters => "content-filters",
            Self::Webhooks => "webhooks",
            Self::Routes => "routes",
            Self::Widgets => "widgets",
            Self::Shortcodes => "shortcodes",
            Self::ScheduledTasks => "scheduled-tasks",
            Self::Settings => "settings",
            Self::Database => "database",
            Self::Email => "email",
            Self::Media => "media",
            Self::Search => "search",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action or filter subscription declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDeclaration {
    /// Channel name, e.g. `the_content`.
    pub name: String,
    /// Name of the handler the plugin instance provides.
    pub handler: String,
    /// Ascending priority.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Remove after first dispatch (actions only).
    #[serde(default)]
    pub once: bool,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// HTTP route handed to the host's route collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// HTTP method.
    pub method: String,
    /// Path relative to the plugin's route prefix.
    pub path: String,
    /// Handler identifier.
    pub handler: String,
    /// Permission required to call the route.
    #[serde(default)]
    pub permission: Option<String>,
}

/// Admin menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMenu {
    /// Menu label.
    pub title: String,
    /// URL slug.
    pub slug: String,
    /// Icon identifier.
    #[serde(default)]
    pub icon: Option<String>,
    /// Sort position.
    #[serde(default)]
    pub position: Option<i32>,
    /// Parent menu slug.
    #[serde(default)]
    pub parent: Option<String>,
}

/// Type of a settings field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    /// Free text.
    String,
    /// Numeric value.
    Number,
    /// Flag.
    Boolean,
    /// One of a fixed set.
    Select,
    /// Arbitrary JSON.
    Json,
}

/// Settings schema entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    /// Field type.
    #[serde(rename = "type")]
    pub kind: SettingKind,
    /// Value seeded on install.
    #[serde(default)]
    pub default: Option<Value>,
    /// Form label.
    #[serde(default)]
    pub label: Option<String>,
    /// Help text.
    #[serde(default)]
    pub description: Option<String>,
}

/// Plugin manifest defining metadata and requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Plugin name (unique identifier).
    pub name: String,

    /// Plugin version.
    pub version: String,

    /// Display title.
    #[serde(default)]
    pub title: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Plugin author.
    #[serde(default)]
    pub author: String,

    /// Plugin license.
    #[serde(default)]
    pub license: Option<String>,

    /// Main entry, relative to the plugin directory.
    pub main: String,

    /// Project homepage.
    #[serde(default)]
    pub homepage: Option<String>,

    /// Source repository.
    #[serde(default)]
    pub repository: Option<String>,

    /// Plugin tags for categorization.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Required plugins and their version ranges.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Declared action subscriptions.
    #[serde(default)]
    pub hooks: Vec<HookDeclaration>,

    /// Declared filter subscriptions.
    #[serde(default)]
    pub filters: Vec<HookDeclaration>,

    /// Admin menu entry.
    #[serde(default)]
    pub admin_menu: Option<AdminMenu>,

    /// HTTP routes.
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,

    /// Settings schema.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingDefinition>,

    /// Permissions the plugin asks for.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Manifest {
    /// Create a new manifest with required fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>, main: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            version: version.into(),
            description: String::new(),
            author: String::new(),
            license: None,
            main: main.into(),
            homepage: None,
            repository: None,
            tags: Vec::new(),
            capabilities: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            hooks: Vec::new(),
            filters: Vec::new(),
            admin_menu: None,
            routes: Vec::new(),
            settings: BTreeMap::new(),
            permissions: Vec::new(),
        }
    }

    /// Parse, sanitise and validate manifest JSON.
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let mut raw: Value = serde_json::from_slice(content)
            .map_err(|e| Error::invalid_manifest(format!("malformed JSON: {}", e)))?;

        if !raw.is_object() {
            return Err(Error::invalid_manifest("manifest must be a JSON object"));
        }

        sanitize_value(&mut raw);

        for field in REQUIRED_FIELDS {
            match raw.get(*field) {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => return Err(Error::missing_field(*field)),
            }
        }

        let mut manifest: Manifest =
            serde_json::from_value(raw).map_err(|e| Error::invalid_manifest(e.to_string()))?;

        if manifest.title.is_empty() {
            manifest.title = manifest.name.clone();
        }

        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::invalid_manifest(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::missing_field("name"));
        }
        if !NAME_PATTERN.is_match(&self.name) {
            return Err(Error::invalid_manifest(format!(
                "plugin name must be lowercase letters, digits, '-' or '_': {}",
                self.name
            )));
        }

        if self.version.is_empty() {
            return Err(Error::missing_field("version"));
        }
        Version::parse(&self.version)?;

        if self.main.is_empty() {
            return Err(Error::missing_field("main"));
        }

        for (field, value) in [("homepage", &self.homepage), ("repository", &self.repository)] {
            if let Some(value) = value {
                validate_url(field, value)?;
            }
        }

        for dep in self.dependencies.keys() {
            if dep == &self.name {
                return Err(Error::invalid_manifest("plugin cannot depend on itself"));
            }
        }

        for decl in self.hooks.iter().chain(self.filters.iter()) {
            if decl.name.is_empty() || decl.handler.is_empty() {
                return Err(Error::invalid_manifest(
                    "hook declarations need a name and a handler",
                ));
            }
        }

        for route in &self.routes {
            let method = route.method.to_ascii_uppercase();
            if !matches!(
                method.as_str(),
                "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD" | "OPTIONS"
            ) {
                return Err(Error::invalid_manifest(format!(
                    "unsupported route method: {}",
                    route.method
                )));
            }
            if !route.path.starts_with('/') {
                return Err(Error::invalid_manifest(format!(
                    "route path must start with '/': {}",
                    route.path
                )));
            }
        }

        Ok(())
    }

    /// Check if this manifest declares a capability.
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Settings seeded from schema defaults.
    pub fn default_settings(&self) -> serde_json::Map<String, Value> {
        self.settings
            .iter()
            .filter_map(|(key, def)| def.default.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Handler names referenced by hook and filter declarations.
    pub fn declared_handlers(&self) -> impl Iterator<Item = &str> {
        self.hooks
            .iter()
            .chain(self.filters.iter())
            .map(|d| d.handler.as_str())
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::invalid_manifest(format!("{} is not a valid URL: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::invalid_manifest(format!(
            "{} uses disallowed scheme: {}",
            field, other
        ))),
    }
}

/// Strip markup and control characters from a piece of manifest text.
pub fn sanitize_text(input: &str) -> String {
    let stripped = TAG_PATTERN.replace_all(input, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = sanitize_text(s),
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => map.values_mut().for_each(sanitize_value),
        _ => {}
    }
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manifest: Manifest::new(name, version, "index.js"),
        }
    }

    /// Set the main entry.
    pub fn main(mut self, main: impl Into<String>) -> Self {
        self.manifest.main = main.into();
        self
    }

    /// Set the title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.manifest.title = title.into();
        self
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = desc.into();
        self
    }

    /// Set the author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.manifest.author = author.into();
        self
    }

    /// Set the license.
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.manifest.license = Some(license.into());
        self
    }

    /// Set the homepage.
    pub fn homepage(mut self, url: impl Into<String>) -> Self {
        self.manifest.homepage = Some(url.into());
        self
    }

    /// Add a capability.
    pub fn capability(mut self, cap: Capability) -> Self {
        self.manifest.capabilities.insert(cap);
        self
    }

    /// Add a dependency.
    pub fn dependency(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        self.manifest.dependencies.insert(name.into(), range.into());
        self
    }

    /// Declare an action subscription.
    pub fn hook(mut self, name: impl Into<String>, handler: impl Into<String>, priority: i32) -> Self {
        self.manifest.hooks.push(HookDeclaration {
            name: name.into(),
            handler: handler.into(),
            priority,
            once: false,
        });
        self
    }

    /// Declare a one-shot action subscription.
    pub fn hook_once(mut self, name: impl Into<String>, handler: impl Into<String>) -> Self {
        self.manifest.hooks.push(HookDeclaration {
            name: name.into(),
            handler: handler.into(),
            priority: DEFAULT_PRIORITY,
            once: true,
        });
        self
    }

    /// Declare a filter subscription.
    pub fn filter(mut self, name: impl Into<String>, handler: impl Into<String>, priority: i32) -> Self {
        self.manifest.filters.push(HookDeclaration {
            name: name.into(),
            handler: handler.into(),
            priority,
            once: false,
        });
        self
    }

    /// Declare a route.
    pub fn route(mut self, method: impl Into<String>, path: impl Into<String>, handler: impl Into<String>) -> Self {
        self.manifest.routes.push(RouteDescriptor {
            method: method.into(),
            path: path.into(),
            handler: handler.into(),
            permission: None,
        });
        self
    }

    /// Declare a setting.
    pub fn setting(mut self, key: impl Into<String>, kind: SettingKind, default: Option<Value>) -> Self {
        self.manifest.settings.insert(
            key.into(),
            SettingDefinition {
                kind,
                default,
                label: None,
                description: None,
            },
        );
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.manifest.tags.push(tag.into());
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<Manifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> Manifest {
        self.manifest
    }
}
