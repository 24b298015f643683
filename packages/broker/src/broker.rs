//! The broker: accepts providers, routes calls, and keeps peers in sync.
//!
//! A `Broker` wires the route table, router, upstream pools, event bus and
//! gossip membership together. Transports hand it connections through
//! [`Broker::on_connect`] and serve its [`Broker::endpoint`] handler.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use meshrpc_core::{
    AppStatus, AppStatusChanged, BrokerInfo, CompositeMetadata, EventEnvelope, Payload, ServiceLocator, ServicesExposed,
    ServicesHidden, SetupPayload, BROKER_DESTINATION,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::balancer::build_balancer;
use crate::cluster::{is_gossip, GossipMembership, GossipMessage, GossipTicker, MembershipChange};
use crate::config::BrokerConfig;
use crate::discovery::DiscoveryClient;
use crate::error::{MeshError, MeshResult};
use crate::events::{install_consumers, ConsumerContext, EventBus, LocalConfig};
use crate::registry::{BalancerInvalidator, ResponderHandle, RouteTable, Router, ServiceResponder};
use crate::transport::{Connection, PayloadHandler, PayloadStream, TransportRegistry};
use crate::upstream::{UpstreamCluster, UpstreamManager, UpstreamRefresher};
use crate::worker::BackgroundWorker;

/// `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

struct Workers {
    gossip: BackgroundWorker<GossipTicker>,
    refresher: BackgroundWorker<UpstreamRefresher>,
    watcher: JoinHandle<()>,
}

pub struct Broker {
    info: BrokerInfo,
    uri: String,
    config: BrokerConfig,
    table: Arc<RouteTable>,
    router: Router,
    upstreams: Arc<UpstreamManager>,
    inter_broker: Arc<UpstreamCluster>,
    bus: Arc<EventBus>,
    membership: Arc<GossipMembership>,
    consumers: ConsumerContext,
    discovery: Option<Arc<dyn DiscoveryClient>>,
    health: ArcSwap<HealthState>,
    workers: tokio::sync::Mutex<Option<Workers>>,
}

impl Broker {
    /// Builds a broker. Nothing runs until [`Broker::start`].
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        transports: Arc<TransportRegistry>,
        discovery: Option<Arc<dyn DiscoveryClient>>,
    ) -> Arc<Self> {
        let id = config.resolve_broker_id();
        let info = config.broker_info(&id, now_ms());
        let uri = info.url();

        let table = Arc::new(RouteTable::new());
        let balancer = build_balancer(config.load_balance, config.exploration);
        table.add_observer(Arc::new(BalancerInvalidator::new(Arc::clone(&balancer))));

        let upstreams = Arc::new(UpstreamManager::new(Arc::clone(&transports), config.upstream_config()));
        let inter_broker = upstreams.get_or_create(BROKER_DESTINATION);
        let upstream_config = config.upstream_config();
        let router = Router::new(id.clone(), Arc::clone(&table), balancer, upstream_config.call_timeout)
            .with_sticky_default(config.sticky)
            .with_peers(Arc::clone(&inter_broker));

        let mut membership = GossipMembership::new(info.clone(), config.membership_config(), transports)
            .with_inter_broker(Arc::clone(&inter_broker));
        if let Some(discovery) = &discovery {
            membership = membership.with_discovery(Arc::clone(discovery));
        }
        let membership = Arc::new(membership);

        let bus = Arc::new(EventBus::new(id));
        let consumers = ConsumerContext::new(Arc::clone(&table), Arc::clone(&upstreams), config.app_name.clone())
            .with_self_uri(uri.clone());
        install_consumers(&bus, &consumers);
        bus.set_broadcaster(membership.clone());
        membership.set_sink(bus.clone());

        Arc::new(Self {
            info,
            uri,
            config,
            table,
            router,
            upstreams,
            inter_broker,
            bus,
            membership,
            consumers,
            discovery,
            health: ArcSwap::from_pointee(HealthState::Starting),
            workers: tokio::sync::Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    #[must_use]
    pub fn info(&self) -> &BrokerInfo {
        &self.info
    }

    /// URI peers use to reach this broker.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[must_use]
    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    /// Pool over the other brokers of the cluster.
    #[must_use]
    pub fn inter_broker(&self) -> &Arc<UpstreamCluster> {
        &self.inter_broker
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn membership(&self) -> &Arc<GossipMembership> {
        &self.membership
    }

    /// Settings received through `ConfigChanged` events.
    #[must_use]
    pub fn local_config(&self) -> &Arc<LocalConfig> {
        &self.consumers.config
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Joins the broker cluster and starts the background workers.
    ///
    /// # Errors
    ///
    /// Fails if the broker was already started.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            anyhow::bail!("broker {} already started", self.info.id);
        }
        let watcher = self.spawn_membership_watcher();
        self.membership.start().await;

        let gossip_interval = self.config.membership_config().gossip_interval;
        let refresh_interval = self.config.upstream_config().refresh_interval;
        *workers = Some(Workers {
            gossip: BackgroundWorker::start(
                "gossip",
                GossipTicker::new(Arc::clone(&self.membership)),
                gossip_interval,
            ),
            refresher: BackgroundWorker::start(
                "upstream-refresh",
                UpstreamRefresher::new(Arc::clone(&self.upstreams), self.discovery.clone()),
                refresh_interval,
            ),
            watcher,
        });
        self.health.store(Arc::new(HealthState::Ready));
        tracing::info!(id = %self.info.id, uri = %self.uri, "broker ready");
        Ok(())
    }

    /// Leaves the cluster, stops the workers and closes upstream connections.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches `start`.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.health.store(Arc::new(HealthState::Draining));
        tracing::info!(id = %self.info.id, "broker draining");
        if let Some(mut workers) = self.workers.lock().await.take() {
            workers.gossip.stop().await;
            workers.refresher.stop().await;
            workers.watcher.abort();
        }
        self.membership.leave().await;
        self.upstreams.close_all();
        self.health.store(Arc::new(HealthState::Stopped));
        tracing::info!(id = %self.info.id, "broker stopped");
        Ok(())
    }

    /// Drops remote routes of brokers that leave or fail.
    /// Replays local routes to joining brokers and prunes routes of departed
    /// ones.
    fn spawn_membership_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.membership.subscribe_changes();
        let broker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                match change {
                    MembershipChange::MemberAdded(info) => {
                        broker.replay_routes_to(&info.url()).await;
                    }
                    MembershipChange::MemberRemoved { info, .. } => {
                        broker.prune_routes_via(&info.url());
                    }
                }
            }
        })
    }

    /// Sends the exposure, and any `DOWN` status, of every directly
    /// connected provider to the broker at `peer_uri`.
    ///
    /// Returns how many providers were announced.
    pub async fn replay_routes_to(&self, peer_uri: &str) -> usize {
        let mut announced = 0;
        for responder in self.table.responders() {
            let services = responder.services();
            if responder.is_remote() || services.is_empty() {
                continue;
            }
            let exposed = EventEnvelope::wrap(
                self.id(),
                &ServicesExposed {
                    instance_id: responder.instance_id(),
                    app_name: responder.app_name().to_string(),
                    services,
                    broker_uri: Some(self.uri.clone()),
                },
            );
            let down = (responder.status() == AppStatus::Down).then(|| {
                EventEnvelope::wrap(
                    self.id(),
                    &AppStatusChanged {
                        instance_id: responder.instance_id(),
                        app_name: responder.app_name().to_string(),
                        status: AppStatus::Down,
                    },
                )
            });
            for envelope in std::iter::once(exposed).chain(down) {
                let sent = match envelope {
                    Ok(envelope) => self.membership.send_event(peer_uri, envelope).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = sent {
                    tracing::warn!(%peer_uri, %err, "route replay failed");
                    return announced;
                }
            }
            announced += 1;
        }
        if announced > 0 {
            tracing::info!(%peer_uri, announced, "local routes replayed to joining broker");
        }
        announced
    }

    /// Removes every remote responder reached through `broker_uri`.
    /// Returns how many were removed.
    pub fn prune_routes_via(&self, broker_uri: &str) -> usize {
        let stale: Vec<Uuid> = self
            .table
            .responders()
            .into_iter()
            .filter(|r| matches!(r.handle(), ResponderHandle::Peer { broker_uri: uri } if uri == broker_uri))
            .map(|r| r.instance_id())
            .collect();
        for instance_id in &stale {
            self.table.remove(*instance_id);
        }
        if !stale.is_empty() {
            tracing::info!(%broker_uri, removed = stale.len(), "remote routes pruned");
        }
        stale.len()
    }

    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    /// Accepts a provider handshake on `connection`.
    ///
    /// The responder starts `CONNECTED`, or `SERVING` when the setup already
    /// lists services. It is removed as soon as the connection closes.
    ///
    /// # Errors
    ///
    /// `HandshakeFailed` for an empty application name or a nil instance id.
    pub async fn on_connect(
        self: &Arc<Self>,
        setup: SetupPayload,
        connection: Arc<dyn Connection>,
    ) -> MeshResult<Arc<ServiceResponder>> {
        let reject = |reason: &str| MeshError::HandshakeFailed {
            uri: connection.uri().to_string(),
            reason: reason.to_string(),
        };
        if setup.app.name.trim().is_empty() {
            return Err(reject("empty application name"));
        }
        if setup.app.instance_id.is_nil() {
            return Err(reject("nil instance id"));
        }

        let instance_id = setup.app.instance_id;
        let connection_id = connection.id();
        if let Some(previous) = self.table.get_by_instance_id(instance_id) {
            if previous.is_remote() || previous.connection_id() != connection_id {
                tracing::info!(%instance_id, "provider reconnected; replacing previous route");
                self.table.remove(instance_id);
            }
        }

        let responder = Arc::new(ServiceResponder::direct(setup.app, Arc::clone(&connection)));
        let responder = if setup.services.is_empty() {
            self.table.register(responder, &[])
        } else {
            self.table.expose(responder, &setup.services)
        };
        self.watch_connection(instance_id, connection);

        if !setup.services.is_empty() {
            self.announce_exposed(&responder, setup.services).await;
        }
        Ok(responder)
    }

    fn watch_connection(self: &Arc<Self>, instance_id: Uuid, connection: Arc<dyn Connection>) {
        let broker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(broker) = broker.upgrade() {
                broker.on_disconnect(instance_id, connection.id()).await;
            }
        });
    }

    /// Removes the responder bound to `connection_id`. Returns `true` if one
    /// was removed. A responder that already moved to a newer connection is
    /// left alone.
    pub async fn on_disconnect(&self, instance_id: Uuid, connection_id: u64) -> bool {
        let Some(responder) = self.table.get_by_instance_id(instance_id) else {
            return false;
        };
        if responder.is_remote() || responder.connection_id() != connection_id {
            return false;
        }
        self.table.remove(instance_id);
        tracing::info!(%instance_id, app = %responder.app_name(), "provider disconnected");
        let stopped = AppStatusChanged {
            instance_id,
            app_name: responder.app_name().to_string(),
            status: AppStatus::Stopped,
        };
        if let Err(err) = self.bus.publish(&stopped).await {
            tracing::warn!(%err, "failed to announce provider stop");
        }
        true
    }

    /// Marks services of a connected provider as served and tells the peers.
    ///
    /// # Errors
    ///
    /// `Internal` if the provider is not connected to this broker.
    pub async fn expose(&self, instance_id: Uuid, services: Vec<ServiceLocator>) -> MeshResult<()> {
        let responder = self.local_responder(instance_id)?;
        let responder = self.table.expose(responder, &services);
        self.announce_exposed(&responder, services).await;
        Ok(())
    }

    /// Withdraws services (all of them when `services` is empty).
    ///
    /// # Errors
    ///
    /// `Internal` if the provider is not connected to this broker.
    pub async fn hide(&self, instance_id: Uuid, services: Vec<ServiceLocator>) -> MeshResult<()> {
        let responder = self.local_responder(instance_id)?;
        self.table.hide(instance_id, &services);
        self.bus
            .publish(&ServicesHidden {
                instance_id,
                app_name: responder.app_name().to_string(),
                services,
            })
            .await?;
        Ok(())
    }

    /// Moves a connected provider to `status`; `STOPPED` removes it.
    ///
    /// # Errors
    ///
    /// `Internal` if the provider is not connected to this broker.
    pub async fn set_status(&self, instance_id: Uuid, status: AppStatus) -> MeshResult<()> {
        let responder = self.local_responder(instance_id)?;
        self.table.set_status(instance_id, status);
        self.bus
            .publish(&AppStatusChanged {
                instance_id,
                app_name: responder.app_name().to_string(),
                status,
            })
            .await?;
        Ok(())
    }

    fn local_responder(&self, instance_id: Uuid) -> MeshResult<Arc<ServiceResponder>> {
        self.table
            .get_by_instance_id(instance_id)
            .filter(|r| !r.is_remote())
            .ok_or_else(|| MeshError::Internal(anyhow::anyhow!("provider {instance_id} is not connected here")))
    }

    async fn announce_exposed(&self, responder: &ServiceResponder, services: Vec<ServiceLocator>) {
        let event = ServicesExposed {
            instance_id: responder.instance_id(),
            app_name: responder.app_name().to_string(),
            services,
            broker_uri: Some(self.uri.clone()),
        };
        if let Err(err) = self.bus.publish(&event).await {
            tracing::warn!(%err, "failed to announce exposed services");
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// See [`Router::request_response`].
    pub async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
        self.router.request_response(payload).await
    }

    /// # Errors
    ///
    /// See [`Router::fire_and_forget`].
    pub async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()> {
        self.router.fire_and_forget(payload).await
    }

    /// # Errors
    ///
    /// See [`Router::request_stream`].
    pub async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream> {
        self.router.request_stream(payload).await
    }

    /// Handler answering everything that arrives at this broker's URI:
    /// gossip from peers and calls from consumers or relaying brokers.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>) -> Arc<dyn PayloadHandler> {
        Arc::new(BrokerEndpoint {
            broker: Arc::downgrade(self),
        })
    }
}

// ---------------------------------------------------------------------------
// BrokerEndpoint
// ---------------------------------------------------------------------------

struct BrokerEndpoint {
    broker: Weak<Broker>,
}

impl BrokerEndpoint {
    fn broker(&self) -> MeshResult<Arc<Broker>> {
        self.broker.upgrade().ok_or_else(|| MeshError::Remote("broker stopped".to_string()))
    }
}

fn gossip_of(payload: &Payload) -> Option<MeshResult<GossipMessage>> {
    let metadata = CompositeMetadata::decode(&payload.metadata).ok()?;
    is_gossip(&metadata).then(|| GossipMessage::from_payload(payload))
}

#[async_trait]
impl PayloadHandler for BrokerEndpoint {
    async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
        let broker = self.broker()?;
        match gossip_of(&payload) {
            Some(message) => match broker.membership.handle(message?).await {
                Some(reply) => reply.to_payload(),
                None => Ok(Payload::default()),
            },
            None => broker.request_response(payload).await,
        }
    }

    async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream> {
        self.broker()?.request_stream(payload).await
    }

    async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()> {
        let broker = self.broker()?;
        match gossip_of(&payload) {
            Some(message) => {
                broker.membership.handle(message?).await;
                Ok(())
            }
            None => broker.fire_and_forget(payload).await,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
