//! Built-in control-event consumers.
//!
//! Every consumer is idempotent: applying the same event twice leaves the
//! same state as applying it once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use meshrpc_core::{
    AppMetadata, AppStatus, AppStatusChanged, CacheInvalidate, ConfigChanged, PortsUpdated, ServicesExposed,
    ServicesHidden, UpstreamClusterChanged,
};
use uuid::Uuid;

use super::EventBus;
use crate::registry::{ResponderHandle, RouteTable, ServiceResponder};
use crate::upstream::UpstreamManager;

/// Key/value settings pushed to this application through `ConfigChanged`.
#[derive(Debug, Default)]
pub struct LocalConfig {
    values: DashMap<String, String>,
}

impl LocalConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Drops the given keys, or everything when `keys` is empty.
    pub fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            self.values.clear();
        } else {
            for key in keys {
                self.values.remove(key);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// State the built-in consumers write to.
#[derive(Clone)]
pub struct ConsumerContext {
    pub table: Arc<RouteTable>,
    pub upstreams: Arc<UpstreamManager>,
    pub config: Arc<LocalConfig>,
    /// Last known ports per provider instance.
    pub ports: Arc<DashMap<Uuid, BTreeMap<String, u16>>>,
    /// Name `ConfigChanged` and `CacheInvalidate` events must address.
    pub local_app_name: String,
    /// This broker's own URI. Exposure events pointing here are ignored so a
    /// provider is never reached by relaying to ourselves.
    pub self_uri: Option<String>,
}

impl ConsumerContext {
    #[must_use]
    pub fn new(table: Arc<RouteTable>, upstreams: Arc<UpstreamManager>, local_app_name: impl Into<String>) -> Self {
        Self {
            table,
            upstreams,
            config: Arc::new(LocalConfig::new()),
            ports: Arc::new(DashMap::new()),
            local_app_name: local_app_name.into(),
            self_uri: None,
        }
    }

    #[must_use]
    pub fn with_self_uri(mut self, uri: impl Into<String>) -> Self {
        self.self_uri = Some(uri.into());
        self
    }
}

/// Subscribes every built-in consumer to `bus`.
pub fn install_consumers(bus: &EventBus, ctx: &ConsumerContext) {
    let c = ctx.clone();
    bus.subscribe(move |e: ServicesExposed| {
        let c = c.clone();
        async move { apply_exposed(&c, e) }
    });

    let table = Arc::clone(&ctx.table);
    bus.subscribe(move |e: ServicesHidden| {
        let table = Arc::clone(&table);
        async move {
            let removed = table.hide(e.instance_id, &e.services);
            tracing::debug!(instance_id = %e.instance_id, removed = removed.len(), "services hidden");
        }
    });

    let c = ctx.clone();
    bus.subscribe(move |e: AppStatusChanged| {
        let c = c.clone();
        async move {
            if e.status == AppStatus::Stopped {
                c.ports.remove(&e.instance_id);
            }
            if c.table.set_status(e.instance_id, e.status).is_none() {
                tracing::debug!(instance_id = %e.instance_id, "status change for unknown responder");
            }
        }
    });

    let upstreams = Arc::clone(&ctx.upstreams);
    bus.subscribe(move |e: UpstreamClusterChanged| {
        let upstreams = Arc::clone(&upstreams);
        async move {
            let summary = upstreams.get_or_create(&e.destination).refresh_uris(e.uris).await;
            if !summary.is_unchanged() {
                tracing::info!(destination = %e.destination, added = ?summary.added, removed = ?summary.removed, "upstream cluster changed");
            }
        }
    });

    let c = ctx.clone();
    bus.subscribe(move |e: ConfigChanged| {
        let c = c.clone();
        async move {
            if e.accepts(&c.local_app_name) {
                tracing::info!(key = %e.key, "config changed");
                c.config.set(e.key, e.value);
            } else {
                tracing::trace!(app = %e.app_name, "config change addressed elsewhere");
            }
        }
    });

    let ports = Arc::clone(&ctx.ports);
    bus.subscribe(move |e: PortsUpdated| {
        let ports = Arc::clone(&ports);
        async move {
            ports.insert(e.instance_id, e.ports);
        }
    });

    let c = ctx.clone();
    bus.subscribe(move |e: CacheInvalidate| {
        let c = c.clone();
        async move {
            let addressed = match e.app_name.as_deref() {
                Some(name) => name.eq_ignore_ascii_case(&c.local_app_name),
                None => true,
            };
            if addressed {
                c.config.invalidate(&e.keys);
            }
        }
    });
}

fn apply_exposed(ctx: &ConsumerContext, event: ServicesExposed) {
    if event.broker_uri.is_some() && event.broker_uri == ctx.self_uri {
        return;
    }
    let existing = ctx.table.get_by_instance_id(event.instance_id);
    let responder = match (existing, event.broker_uri) {
        (Some(existing), Some(uri)) if is_relocated(&existing, &uri) => {
            tracing::info!(instance_id = %event.instance_id, %uri, "provider relocated");
            ctx.table.remove(event.instance_id);
            remote_responder(event.instance_id, &event.app_name, uri)
        }
        (Some(existing), _) => existing,
        (None, Some(uri)) => remote_responder(event.instance_id, &event.app_name, uri),
        (None, None) => {
            tracing::debug!(instance_id = %event.instance_id, "exposure for a provider with no known route");
            return;
        }
    };
    ctx.table.expose(responder, &event.services);
}

fn is_relocated(existing: &ServiceResponder, uri: &str) -> bool {
    match existing.handle() {
        ResponderHandle::Peer { broker_uri } => broker_uri != uri,
        ResponderHandle::Direct(_) => false,
    }
}

fn remote_responder(instance_id: Uuid, app_name: &str, broker_uri: String) -> Arc<ServiceResponder> {
    let mut app = AppMetadata::new(app_name, "");
    app.instance_id = instance_id;
    Arc::new(ServiceResponder::remote(app, broker_uri))
}

#[cfg(test)]
mod tests {
    use meshrpc_core::ServiceLocator;

    use super::*;
    use crate::transport::{LocalTransport, TransportRegistry};
    use crate::upstream::UpstreamConfig;

    fn calc() -> ServiceLocator {
        ServiceLocator::of("g", "Calc", "1").unwrap()
    }

    fn setup() -> (EventBus, ConsumerContext) {
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::new(LocalTransport::new()));
        let ctx = ConsumerContext::new(
            Arc::new(RouteTable::new()),
            Arc::new(UpstreamManager::new(transports, UpstreamConfig::default())),
            "calc",
        )
        .with_self_uri("local://b1");
        let bus = EventBus::new("b1");
        install_consumers(&bus, &ctx);
        (bus, ctx)
    }

    fn exposed(id: Uuid, uri: &str) -> ServicesExposed {
        ServicesExposed {
            instance_id: id,
            app_name: "calc".into(),
            services: vec![calc()],
            broker_uri: Some(uri.into()),
        }
    }

    #[tokio::test]
    async fn exposure_is_idempotent() {
        let (bus, ctx) = setup();
        let id = Uuid::new_v4();
        bus.publish(&exposed(id, "local://b2")).await.unwrap();
        bus.publish(&exposed(id, "local://b2")).await.unwrap();

        let serving = ctx.table.serving_by_hash(calc().routing_hash());
        assert_eq!(serving.len(), 1);
        assert_eq!(serving[0].instance_id(), id);
        assert!(serving[0].is_remote());
        assert_eq!(ctx.table.len(), 1);
    }

    #[tokio::test]
    async fn exposure_via_self_is_ignored() {
        let (bus, ctx) = setup();
        bus.publish(&exposed(Uuid::new_v4(), "local://b1")).await.unwrap();
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn relocation_replaces_the_route() {
        let (bus, ctx) = setup();
        let id = Uuid::new_v4();
        bus.publish(&exposed(id, "local://b2")).await.unwrap();
        bus.publish(&exposed(id, "local://b3")).await.unwrap();
        let responder = ctx.table.get_by_instance_id(id).unwrap();
        assert!(matches!(responder.handle(), ResponderHandle::Peer { broker_uri } if broker_uri == "local://b3"));
        assert!(responder.is_serving());
    }

    #[tokio::test]
    async fn hide_and_status_events_are_idempotent() {
        let (bus, ctx) = setup();
        let id = Uuid::new_v4();
        bus.publish(&exposed(id, "local://b2")).await.unwrap();

        let hidden = ServicesHidden {
            instance_id: id,
            app_name: "calc".into(),
            services: vec![],
        };
        bus.publish(&hidden).await.unwrap();
        bus.publish(&hidden).await.unwrap();
        assert_eq!(ctx.table.get_by_instance_id(id).unwrap().status(), AppStatus::Down);
        assert!(ctx.table.get_by_hash(calc().routing_hash()).is_empty());

        let stopped = AppStatusChanged {
            instance_id: id,
            app_name: "calc".into(),
            status: AppStatus::Stopped,
        };
        bus.publish(&stopped).await.unwrap();
        bus.publish(&stopped).await.unwrap();
        assert!(ctx.table.get_by_instance_id(id).is_none());
    }

    #[tokio::test]
    async fn config_changes_are_filtered_by_app_name() {
        let (bus, ctx) = setup();
        let mine = ConfigChanged {
            app_name: "CALC".into(),
            key: "timeout".into(),
            value: "5s".into(),
        };
        let theirs = ConfigChanged {
            app_name: "billing".into(),
            key: "limit".into(),
            value: "9".into(),
        };
        bus.publish(&mine).await.unwrap();
        bus.publish(&theirs).await.unwrap();
        bus.publish(&mine).await.unwrap();
        assert_eq!(ctx.config.get("timeout").as_deref(), Some("5s"));
        assert_eq!(ctx.config.get("limit"), None);
        assert_eq!(ctx.config.len(), 1);

        bus.publish(&CacheInvalidate {
            app_name: Some("billing".into()),
            keys: vec![],
        })
        .await
        .unwrap();
        assert_eq!(ctx.config.len(), 1);
        bus.publish(&CacheInvalidate {
            app_name: None,
            keys: vec!["timeout".into()],
        })
        .await
        .unwrap();
        assert!(ctx.config.is_empty());
    }

    #[tokio::test]
    async fn upstream_cluster_changes_refresh_pools() {
        let (bus, ctx) = setup();
        let changed = UpstreamClusterChanged {
            destination: "g!Calc:1".into(),
            uris: vec!["local://a".into(), "local://b".into()],
        };
        bus.publish(&changed).await.unwrap();
        bus.publish(&changed).await.unwrap();
        let cluster = ctx.upstreams.get("g!Calc:1").unwrap();
        assert_eq!(*cluster.uris(), vec!["local://a".to_string(), "local://b".to_string()]);
    }

    #[tokio::test]
    async fn ports_are_tracked_per_instance() {
        let (bus, ctx) = setup();
        let id = Uuid::new_v4();
        let ports: BTreeMap<String, u16> = [("tcp".to_string(), 7000)].into_iter().collect();
        bus.publish(&PortsUpdated {
            instance_id: id,
            ports: ports.clone(),
        })
        .await
        .unwrap();
        assert_eq!(ctx.ports.get(&id).map(|p| p.value().clone()), Some(ports));
    }

    #[tokio::test]
    async fn stopped_instance_forgets_its_ports() {
        let (bus, ctx) = setup();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        bus.publish(&exposed(id, "local://b2")).await.unwrap();
        for instance_id in [id, other] {
            bus.publish(&PortsUpdated {
                instance_id,
                ports: [("tcp".to_string(), 7000)].into_iter().collect(),
            })
            .await
            .unwrap();
        }

        let down = AppStatusChanged {
            instance_id: id,
            app_name: "calc".into(),
            status: AppStatus::Down,
        };
        bus.publish(&down).await.unwrap();
        assert!(ctx.ports.contains_key(&id));

        bus.publish(&AppStatusChanged {
            status: AppStatus::Stopped,
            ..down
        })
        .await
        .unwrap();
        assert!(!ctx.ports.contains_key(&id));
        assert!(ctx.ports.contains_key(&other));
        assert!(ctx.table.get_by_instance_id(id).is_none());
    }
}
