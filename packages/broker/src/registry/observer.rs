use std::sync::Arc;

use meshrpc_core::{AppStatus, ServiceLocator};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::balancer::LoadBalancer;

/// A change applied to the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChange {
    Registered {
        instance_id: Uuid,
        app_name: String,
        /// Locators newly exposed by this change.
        services: Vec<ServiceLocator>,
    },
    Unregistered {
        instance_id: Uuid,
        app_name: String,
        services: Vec<ServiceLocator>,
        /// The responder itself left the table.
        removed: bool,
    },
    StatusChanged {
        instance_id: Uuid,
        app_name: String,
        services: Vec<ServiceLocator>,
        from: AppStatus,
        to: AppStatus,
    },
}

impl RouteChange {
    /// Metric label for this change.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Unregistered { removed: true, .. } => "removed",
            Self::Unregistered { .. } => "unregistered",
            Self::StatusChanged { .. } => "status",
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::Registered { instance_id, .. }
            | Self::Unregistered { instance_id, .. }
            | Self::StatusChanged { instance_id, .. } => *instance_id,
        }
    }

    /// Locators whose candidate sets this change affects.
    #[must_use]
    pub fn services(&self) -> &[ServiceLocator] {
        match self {
            Self::Registered { services, .. }
            | Self::Unregistered { services, .. }
            | Self::StatusChanged { services, .. } => services,
        }
    }
}

/// Synchronous reaction to route-table changes.
pub trait RouteObserver: Send + Sync {
    fn on_change(&self, change: &RouteChange);
}

/// Fans a change out to every registered observer, in registration order.
#[derive(Default)]
pub struct CompositeRouteObserver {
    observers: RwLock<Vec<Arc<dyn RouteObserver>>>,
}

impl CompositeRouteObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn RouteObserver>>) -> Self {
        Self {
            observers: RwLock::new(observers),
        }
    }

    pub fn add(&self, observer: Arc<dyn RouteObserver>) {
        self.observers.write().push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

impl RouteObserver for CompositeRouteObserver {
    fn on_change(&self, change: &RouteChange) {
        for observer in self.observers.read().iter() {
            observer.on_change(change);
        }
    }
}

/// Drops a balancer's cached per-hash state whenever a hash's candidate set
/// changes.
pub struct BalancerInvalidator {
    balancer: Arc<dyn LoadBalancer>,
}

impl BalancerInvalidator {
    #[must_use]
    pub fn new(balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { balancer }
    }
}

impl RouteObserver for BalancerInvalidator {
    fn on_change(&self, change: &RouteChange) {
        for locator in change.services() {
            self.balancer.invalidate(locator.routing_hash());
        }
        if let RouteChange::Unregistered { removed: true, instance_id, .. } = change {
            self.balancer.evict(&instance_id.to_string());
        }
    }
}
