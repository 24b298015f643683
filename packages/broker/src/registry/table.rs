//! Route table: routing hash to responders, plus the responder registry.
//!
//! Two coupled indices back every lookup:
//! - `by_hash`: routing hash -> instance ids exposing a service with that hash
//! - `responders`: instance id -> responder
//!
//! Writers are serialized by one mutex; readers never take it. A responder is
//! inserted before any of its hashes and its hashes are removed before the
//! responder, so a reader that finds an id in `by_hash` finds the responder
//! too (or sees the id filtered out if it raced a removal).

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use meshrpc_core::{AppStatus, ServiceLocator};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::observer::{CompositeRouteObserver, RouteChange, RouteObserver};
use super::responder::ServiceResponder;

#[derive(Default)]
pub struct RouteTable {
    by_hash: DashMap<u32, HashSet<Uuid>>,
    responders: DashMap<Uuid, Arc<ServiceResponder>>,
    by_app: DashMap<String, HashSet<Uuid>>,
    write_lock: Mutex<()>,
    observers: CompositeRouteObserver,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RouteChange>>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a synchronous observer, called after every applied change.
    ///
    /// Observers run while the write lock is held and must not mutate the
    /// table.
    pub fn add_observer(&self, observer: Arc<dyn RouteObserver>) {
        self.observers.add(observer);
    }

    /// Returns a receiver of every change applied from now on.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<RouteChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Registers `responder` (if new) and the given locators for it.
    ///
    /// Re-registering known locators is a no-op. If a responder with the
    /// same instance id is already present, the existing one is kept and
    /// the locators are added to it. Returns the responder now in the table.
    pub fn register(
        &self,
        responder: Arc<ServiceResponder>,
        locators: &[ServiceLocator],
    ) -> Arc<ServiceResponder> {
        let _guard = self.write_lock.lock();
        let instance_id = responder.instance_id();

        let (current, inserted) = match self.get_by_instance_id(instance_id) {
            Some(existing) => (existing, false),
            None => {
                self.responders.insert(instance_id, Arc::clone(&responder));
                self.by_app
                    .entry(responder.app_name().to_string())
                    .or_default()
                    .insert(instance_id);
                (responder, true)
            }
        };

        let added = current.add_services(locators);
        for locator in &added {
            self.by_hash
                .entry(locator.routing_hash())
                .or_default()
                .insert(instance_id);
        }

        if inserted || !added.is_empty() {
            tracing::info!(
                %instance_id,
                app = %current.app_name(),
                services = added.len(),
                "responder registered"
            );
            self.notify(&RouteChange::Registered {
                instance_id,
                app_name: current.app_name().to_string(),
                services: added,
            });
        }
        current
    }

    /// Withdraws locators (all of them when `locators` is empty) from a
    /// responder. The responder itself stays registered.
    pub fn unregister(&self, instance_id: Uuid, locators: &[ServiceLocator]) -> Vec<ServiceLocator> {
        let _guard = self.write_lock.lock();
        let Some(responder) = self.get_by_instance_id(instance_id) else {
            return Vec::new();
        };
        let removed = responder.remove_services(locators);
        self.drop_hashes(instance_id, &removed, &responder);

        if !removed.is_empty() {
            tracing::info!(%instance_id, services = removed.len(), "services unregistered");
            self.notify(&RouteChange::Unregistered {
                instance_id,
                app_name: responder.app_name().to_string(),
                services: removed.clone(),
                removed: false,
            });
        }
        removed
    }

    /// Removes a responder and everything it exposes, marking it `STOPPED`.
    ///
    /// Never fails; unknown ids are a no-op.
    pub fn remove(&self, instance_id: Uuid) -> Option<Arc<ServiceResponder>> {
        let _guard = self.write_lock.lock();
        let responder = self.get_by_instance_id(instance_id)?;

        let services = responder.remove_services(&[]);
        self.drop_hashes(instance_id, &services, &responder);
        self.by_app.remove_if_mut(responder.app_name(), |_, ids| {
            ids.remove(&instance_id);
            ids.is_empty()
        });
        self.responders.remove(&instance_id);
        responder.swap_status(AppStatus::Stopped);

        tracing::info!(%instance_id, app = %responder.app_name(), "responder removed");
        self.notify(&RouteChange::Unregistered {
            instance_id,
            app_name: responder.app_name().to_string(),
            services,
            removed: true,
        });
        Some(responder)
    }

    /// Applies a status transition. `STOPPED` removes the responder.
    ///
    /// Returns the previous status, or `None` for unknown ids.
    pub fn set_status(&self, instance_id: Uuid, status: AppStatus) -> Option<AppStatus> {
        if status == AppStatus::Stopped {
            return self.remove(instance_id).map(|_| AppStatus::Stopped);
        }
        let _guard = self.write_lock.lock();
        let responder = self.get_by_instance_id(instance_id)?;
        let previous = responder.swap_status(status);
        if previous != status {
            tracing::info!(%instance_id, from = ?previous, to = ?status, "responder status changed");
            self.notify(&RouteChange::StatusChanged {
                instance_id,
                app_name: responder.app_name().to_string(),
                services: responder.services(),
                from: previous,
                to: status,
            });
        }
        Some(previous)
    }

    /// Registers locators and marks the responder `SERVING`.
    pub fn expose(&self, responder: Arc<ServiceResponder>, locators: &[ServiceLocator]) -> Arc<ServiceResponder> {
        let current = self.register(responder, locators);
        self.set_status(current.instance_id(), AppStatus::Serving);
        current
    }

    /// Withdraws locators; a responder left with nothing to serve goes `DOWN`.
    pub fn hide(&self, instance_id: Uuid, locators: &[ServiceLocator]) -> Vec<ServiceLocator> {
        let removed = self.unregister(instance_id, locators);
        if let Some(responder) = self.get_by_instance_id(instance_id) {
            if responder.services().is_empty() && responder.status() == AppStatus::Serving {
                self.set_status(instance_id, AppStatus::Down);
            }
        }
        removed
    }

    fn drop_hashes(&self, instance_id: Uuid, locators: &[ServiceLocator], responder: &ServiceResponder) {
        for locator in locators {
            let hash = locator.routing_hash();
            // Another locator of this responder may collide on the same hash.
            let still_exposed = responder
                .services()
                .iter()
                .any(|l| l.routing_hash() == hash);
            if still_exposed {
                continue;
            }
            self.by_hash.remove_if_mut(&hash, |_, ids| {
                ids.remove(&instance_id);
                ids.is_empty()
            });
        }
    }

    fn notify(&self, change: &RouteChange) {
        metrics::counter!("meshrpc_route_changes_total", "kind" => change.kind()).increment(1);
        self.observers.on_change(change);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Every responder exposing a service with `routing_hash`, in any status.
    #[must_use]
    pub fn get_by_hash(&self, routing_hash: u32) -> Vec<Arc<ServiceResponder>> {
        let ids: Vec<Uuid> = self
            .by_hash
            .get(&routing_hash)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.get_by_instance_id(id))
            .collect()
    }

    /// Responders for `routing_hash` that are `SERVING`.
    #[must_use]
    pub fn serving_by_hash(&self, routing_hash: u32) -> Vec<Arc<ServiceResponder>> {
        let mut serving: Vec<_> = self
            .get_by_hash(routing_hash)
            .into_iter()
            .filter(|r| r.is_serving())
            .collect();
        serving.sort_by_key(|r| r.instance_id());
        serving
    }

    #[must_use]
    pub fn get_by_instance_id(&self, instance_id: Uuid) -> Option<Arc<ServiceResponder>> {
        self.responders.get(&instance_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn get_by_app_name(&self, app_name: &str) -> Vec<Arc<ServiceResponder>> {
        let ids: Vec<Uuid> = self
            .by_app
            .get(app_name)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.get_by_instance_id(id))
            .collect()
    }

    /// Every locator exposed by any registered responder.
    #[must_use]
    pub fn all_services(&self) -> HashSet<ServiceLocator> {
        self.responders
            .iter()
            .flat_map(|r| r.value().services())
            .collect()
    }

    #[must_use]
    pub fn responders(&self) -> Vec<Arc<ServiceResponder>> {
        self.responders.iter().map(|r| Arc::clone(r.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.responders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}
