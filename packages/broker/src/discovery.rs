//! Discovery seams.
//!
//! [`ServiceDiscovery`] is the outward view of the route table that generic
//! discovery clients build on. [`DiscoveryClient`] is the inward,
//! injectable "list endpoints for a logical name" collaborator used to seed
//! gossip and re-resolve upstream clusters.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use meshrpc_core::{AppMetadata, ServiceLocator};
use parking_lot::RwLock;

use crate::registry::RouteTable;

/// Read-only discovery view over `SERVING` providers.
pub trait ServiceDiscovery: Send + Sync {
    /// Canonical GSV strings of every service with at least one serving
    /// provider, sorted.
    fn service_names(&self) -> Vec<String>;

    /// Serving providers of `gsv`. Unknown or malformed names yield nothing.
    fn instances(&self, gsv: &str) -> Vec<AppMetadata>;
}

impl ServiceDiscovery for RouteTable {
    fn service_names(&self) -> Vec<String> {
        self.responders()
            .iter()
            .filter(|r| r.is_serving())
            .flat_map(|r| r.services())
            .map(|l| l.gsv().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn instances(&self, gsv: &str) -> Vec<AppMetadata> {
        let Ok(locator) = ServiceLocator::parse(gsv) else {
            return Vec::new();
        };
        self.serving_by_hash(locator.routing_hash())
            .into_iter()
            .filter(|r| r.exposes(&locator))
            .map(|r| r.app().clone())
            .collect()
    }
}

/// Resolves a logical name to endpoint URIs.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// `Ok(None)` means the name is not managed by this client and its
    /// current endpoint set must be left alone.
    ///
    /// # Errors
    ///
    /// Backend failures; callers keep their previous view.
    async fn resolve(&self, name: &str) -> anyhow::Result<Option<Vec<String>>>;
}

/// Fixed name-to-URIs table, editable at runtime.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, name: impl Into<String>, uris: Vec<String>) -> Self {
        self.set(name, uris);
        self
    }

    pub fn set(&self, name: impl Into<String>, uris: Vec<String>) {
        self.entries.write().insert(name.into(), uris);
    }

    pub fn remove(&self, name: &str) -> Option<Vec<String>> {
        self.entries.write().remove(name)
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn resolve(&self, name: &str) -> anyhow::Result<Option<Vec<String>>> {
        Ok(self.entries.read().get(name).cloned())
    }
}
