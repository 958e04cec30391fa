//! Hand-off of plugin route descriptors to the host's HTTP layer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::manifest::RouteDescriptor;

/// Receives route descriptors of active plugins.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Mount a plugin's routes.
    async fn register_routes(&self, plugin: &str, routes: &[RouteDescriptor]) -> Result<()>;

    /// Unmount every route of a plugin.
    async fn unregister_routes(&self, plugin: &str) -> Result<()>;
}

/// Registrar that only keeps the table, for hosts that poll it.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<BTreeMap<String, Vec<RouteDescriptor>>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes mounted for a plugin.
    pub fn routes_for(&self, plugin: &str) -> Vec<RouteDescriptor> {
        self.routes.read().get(plugin).cloned().unwrap_or_default()
    }

    /// Find the route serving `method` and `path`.
    pub fn find(&self, method: &str, path: &str) -> Option<(String, RouteDescriptor)> {
        self.routes.read().iter().find_map(|(plugin, routes)| {
            routes
                .iter()
                .find(|r| r.method.eq_ignore_ascii_case(method) && r.path == path)
                .map(|r| (plugin.clone(), r.clone()))
        })
    }

    /// Total mounted routes.
    pub fn len(&self) -> usize {
        self.routes.read().values().map(Vec::len).sum()
    }

    /// Check if no routes are mounted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RouteRegistrar for RouteTable {
    async fn register_routes(&self, plugin: &str, routes: &[RouteDescriptor]) -> Result<()> {
        if !routes.is_empty() {
            self.routes.write().insert(plugin.to_string(), routes.to_vec());
        }
        Ok(())
    }

    async fn unregister_routes(&self, plugin: &str) -> Result<()> {
        self.routes.write().remove(plugin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, path: &str) -> RouteDescriptor {
        RouteDescriptor {
            method: method.to_string(),
            path: path.to_string(),
            handler: "handle".to_string(),
            permission: None,
        }
    }

    #[tokio::test]
    async fn test_route_table() {
        let table = RouteTable::new();
        table
            .register_routes("seo-helper", &[route("GET", "/sitemap.xml"), route("POST", "/ping")])
            .await
            .unwrap();

        assert_eq!(table.len(), 2);
        let (plugin, found) = table.find("get", "/sitemap.xml").unwrap();
        assert_eq!(plugin, "seo-helper");
        assert_eq!(found.handler, "handle");

        table.unregister_routes("seo-helper").await.unwrap();
        assert!(table.is_empty());
        assert!(table.find("GET", "/sitemap.xml").is_none());
    }
}
