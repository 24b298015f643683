//! Push-pull gossip over the broker transport.
//!
//! Every round a node pings each known member and every seed that is not a
//! member yet. A ping carries the sender's `BrokerInfo` and a digest of the
//! members it knows; the ack carries the same from the receiver. Members
//! learned only through a digest are confirmed with a `FETCH_BROKER_INFO`
//! request before they are added. Any departure (graceful leave or failure
//! detection) is final: the member is dropped and the inter-broker upstream
//! cluster is recomputed.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use meshrpc_core::{BrokerInfo, EventEnvelope, BROKER_DESTINATION};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::failure_detector::{DeadlineDetector, FailureDetector};
use super::messages::{GossipMessage, LeavePayload, MemberDigest, PingPayload};
use super::peers::PeerTable;
use super::types::{Departure, Member, MemberState, MembershipChange, MembershipConfig};
use crate::discovery::DiscoveryClient;
use crate::error::{MeshError, MeshResult};
use crate::events::{Broadcaster, ControlEventSink};
use crate::transport::{Connection, TransportRegistry};
use crate::upstream::UpstreamCluster;
use crate::worker::Periodic;

/// Tombstones outlive the failure timeout by this factor.
const TOMBSTONE_FACTOR: u32 = 3;

pub struct GossipMembership {
    local: BrokerInfo,
    local_uri: String,
    config: MembershipConfig,
    transports: Arc<TransportRegistry>,
    peers: PeerTable,
    detector: Arc<dyn FailureDetector>,
    inter_broker: Option<Arc<UpstreamCluster>>,
    discovery: Option<Arc<dyn DiscoveryClient>>,
    sink: RwLock<Option<Arc<dyn ControlEventSink>>>,
    connections: DashMap<String, Arc<dyn Connection>>,
    state: Mutex<MemberState>,
}

impl GossipMembership {
    #[must_use]
    pub fn new(local: BrokerInfo, config: MembershipConfig, transports: Arc<TransportRegistry>) -> Self {
        let timeout_ms = u64::try_from(config.failure_timeout.as_millis()).unwrap_or(u64::MAX);
        Self {
            local_uri: local.url(),
            local,
            config,
            transports,
            peers: PeerTable::new(),
            detector: Arc::new(DeadlineDetector::new(timeout_ms)),
            inter_broker: None,
            discovery: None,
            sink: RwLock::new(None),
            connections: DashMap::new(),
            state: Mutex::new(MemberState::Joining),
        }
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<dyn FailureDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Keeps `cluster`'s URI set equal to the member URIs.
    #[must_use]
    pub fn with_inter_broker(mut self, cluster: Arc<UpstreamCluster>) -> Self {
        self.inter_broker = Some(cluster);
        self
    }

    /// Adds discovered broker URIs to the seed list every round.
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryClient>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Where control events received from peers are delivered.
    pub fn set_sink(&self, sink: Arc<dyn ControlEventSink>) {
        *self.sink.write() = Some(sink);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn local(&self) -> &BrokerInfo {
        &self.local
    }

    #[must_use]
    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    #[must_use]
    pub fn state(&self) -> MemberState {
        *self.state.lock()
    }

    /// Peer brokers, this node excluded, sorted by id.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.peers.members()
    }

    #[must_use]
    pub fn member(&self, id: &str) -> Option<Member> {
        self.peers.get(id)
    }

    #[must_use]
    pub fn member_uris(&self) -> Vec<String> {
        self.peers.uris()
    }

    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<MembershipChange> {
        self.peers.subscribe_changes()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Contacts the seeds once and becomes `Active`.
    pub async fn start(&self) {
        tracing::info!(id = %self.local.id, uri = %self.local_uri, seeds = ?self.config.seeds, "joining broker cluster");
        self.gossip_round().await;
        *self.state.lock() = MemberState::Active;
        tracing::info!(id = %self.local.id, members = self.peers.len(), "broker cluster joined");
    }

    /// Tells every member this node is leaving, then drops all peer state.
    pub async fn leave(&self) {
        *self.state.lock() = MemberState::Leaving;
        let notice = GossipMessage::Leave(LeavePayload {
            id: self.local.id.clone(),
        });
        let uris = self.peers.uris();
        let sends = uris.iter().map(|uri| self.send(uri, &notice));
        for result in join_all(sends).await {
            if let Err(err) = result {
                tracing::debug!(%err, "leave notice not delivered");
            }
        }
        let now = now_ms();
        for member in self.peers.members() {
            self.peers.remove(member.id(), Departure::Left, now);
            self.detector.forget(member.id());
        }
        self.sync_upstream().await;
        self.close_connections();
        tracing::info!(id = %self.local.id, "left broker cluster");
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    /// Pings every member and every seed that is not a member yet.
    pub async fn gossip_round(&self) {
        let targets = self.round_targets().await;
        let ping = GossipMessage::Ping(self.digest());
        let ping = &ping;
        let exchanges = targets.iter().map(|uri| async move {
            match self.request(uri, ping).await {
                Ok(Some(GossipMessage::Ack(ack))) => self.observe(ack).await,
                Ok(_) => tracing::debug!(%uri, "unexpected gossip reply"),
                Err(err) => tracing::debug!(%uri, %err, "gossip exchange failed"),
            }
        });
        join_all(exchanges).await;
        let ttl = self.tombstone_ttl_ms();
        self.peers.forget_departed(now_ms(), ttl);
    }

    /// Removes members the failure detector gave up on. Returns their ids.
    pub async fn detect_failures(&self) -> Vec<String> {
        self.detect_failures_at(now_ms()).await
    }

    pub async fn detect_failures_at(&self, now_ms: u64) -> Vec<String> {
        let failed: Vec<String> = self
            .peers
            .members()
            .into_iter()
            .filter(|m| !self.detector.is_available(m.id(), now_ms))
            .map(|m| m.info.id)
            .collect();
        for id in &failed {
            tracing::warn!(%id, phi = self.detector.phi(id, now_ms), "broker failed");
            self.remove_member(id, Departure::Failed, now_ms).await;
        }
        failed
    }

    async fn round_targets(&self) -> Vec<String> {
        let mut targets = self.peers.uris();
        let mut seeds = self.config.seeds.clone();
        if let Some(discovery) = &self.discovery {
            match discovery.resolve(BROKER_DESTINATION).await {
                Ok(Some(found)) => seeds.extend(found),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "broker discovery failed"),
            }
        }
        for seed in seeds {
            if seed != self.local_uri && !targets.contains(&seed) {
                targets.push(seed);
            }
        }
        targets
    }

    fn digest(&self) -> PingPayload {
        PingPayload {
            from: self.local.clone(),
            members: self
                .peers
                .members()
                .into_iter()
                .map(|m| MemberDigest {
                    uri: m.uri(),
                    id: m.info.id,
                })
                .collect(),
        }
    }

    fn tombstone_ttl_ms(&self) -> u64 {
        let ttl = self.config.failure_timeout * TOMBSTONE_FACTOR;
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handles one gossip message and returns the reply, if any.
    pub async fn handle(&self, message: GossipMessage) -> Option<GossipMessage> {
        match message {
            GossipMessage::Ping(ping) => {
                self.observe(ping).await;
                return Some(GossipMessage::Ack(self.digest()));
            }
            GossipMessage::FetchBrokerInfo => return Some(GossipMessage::BrokerInfo(self.local.clone())),
            GossipMessage::Ack(ack) => self.observe(ack).await,
            GossipMessage::BrokerInfo(info) => self.add_member(info).await,
            GossipMessage::Leave(leave) => {
                tracing::info!(id = %leave.id, "broker left");
                self.remove_member(&leave.id, Departure::Left, now_ms()).await;
            }
            GossipMessage::ControlEvent(envelope) => {
                let sink = self.sink.read().clone();
                match sink {
                    Some(sink) => sink.deliver(envelope).await,
                    None => tracing::debug!(event_type = %envelope.event_type, "no event sink; control event dropped"),
                }
            }
        }
        None
    }

    /// Applies what a ping or ack says about the sender and its members.
    async fn observe(&self, payload: PingPayload) {
        let now = now_ms();
        let sender = payload.from;
        if sender.id == self.local.id {
            return;
        }
        self.detector.heartbeat(&sender.id, now);
        self.add_member(sender).await;

        let ttl = self.tombstone_ttl_ms();
        let unknown: Vec<MemberDigest> = payload
            .members
            .into_iter()
            .filter(|d| d.id != self.local.id && !self.peers.contains(&d.id))
            .filter(|d| !self.peers.recently_departed(&d.id, now, ttl))
            .collect();
        for digest in unknown {
            match self.request(&digest.uri, &GossipMessage::FetchBrokerInfo).await {
                Ok(Some(GossipMessage::BrokerInfo(info))) if info.id == digest.id => {
                    self.detector.heartbeat(&info.id, now_ms());
                    self.add_member(info).await;
                }
                Ok(_) => tracing::debug!(id = %digest.id, uri = %digest.uri, "broker info mismatch"),
                Err(err) => tracing::debug!(id = %digest.id, %err, "broker info fetch failed"),
            }
        }
    }

    async fn add_member(&self, info: BrokerInfo) {
        if info.id == self.local.id || !info.is_active() {
            return;
        }
        let id = info.id.clone();
        let uri = info.url();
        if self.peers.upsert(info, now_ms()) {
            self.detector.heartbeat(&id, now_ms());
            tracing::info!(%id, %uri, "broker joined");
            self.sync_upstream().await;
        }
    }

    async fn remove_member(&self, id: &str, reason: Departure, now_ms: u64) {
        let Some(member) = self.peers.remove(id, reason, now_ms) else {
            return;
        };
        self.detector.forget(id);
        if let Some((_, conn)) = self.connections.remove(&member.uri()) {
            conn.close();
        }
        tracing::info!(%id, ?reason, "broker removed");
        self.sync_upstream().await;
    }

    async fn sync_upstream(&self) {
        if let Some(cluster) = &self.inter_broker {
            cluster.refresh_uris(self.peers.uris()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Delivers one control event to a single broker, bypassing broadcast.
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be encoded or `uri` is unreachable.
    pub async fn send_event(&self, uri: &str, envelope: EventEnvelope) -> MeshResult<()> {
        self.send(uri, &GossipMessage::ControlEvent(envelope)).await
    }

    async fn connection(&self, uri: &str) -> MeshResult<Arc<dyn Connection>> {
        if let Some(conn) = self.connections.get(uri).map(|c| Arc::clone(c.value())) {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }
        let conn = self.transports.open(uri).await?;
        self.connections.insert(uri.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn request(&self, uri: &str, message: &GossipMessage) -> MeshResult<Option<GossipMessage>> {
        let payload = message.to_payload()?;
        let conn = self.connection(uri).await?;
        let reply = match tokio::time::timeout(self.config.request_timeout, conn.request_response(payload)).await {
            Ok(reply) => reply,
            Err(_) => Err(MeshError::Timeout {
                timeout_ms: u64::try_from(self.config.request_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };
        match reply {
            Ok(reply) if reply.data.is_empty() => Ok(None),
            Ok(reply) => GossipMessage::from_payload(&reply).map(Some),
            Err(err) => {
                self.drop_connection(uri);
                Err(err)
            }
        }
    }

    async fn send(&self, uri: &str, message: &GossipMessage) -> MeshResult<()> {
        let payload = message.to_payload()?;
        let conn = self.connection(uri).await?;
        let result = conn.fire_and_forget(payload).await;
        if result.is_err() {
            self.drop_connection(uri);
        }
        result
    }

    fn drop_connection(&self, uri: &str) {
        if let Some((_, conn)) = self.connections.remove(uri) {
            conn.close();
        }
    }

    fn close_connections(&self) {
        let uris: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for uri in uris {
            self.drop_connection(&uri);
        }
    }
}

#[async_trait]
impl Broadcaster for GossipMembership {
    async fn broadcast(&self, envelope: &EventEnvelope) {
        let message = GossipMessage::ControlEvent(envelope.clone());
        let uris = self.peers.uris();
        let sends = uris.iter().map(|uri| self.send(uri, &message));
        for (uri, result) in uris.iter().zip(join_all(sends).await) {
            if let Err(err) = result {
                tracing::debug!(%uri, event_type = %envelope.event_type, %err, "control event not delivered");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipCommand {
    /// Run a round and a failure check now.
    RoundNow,
}

/// Runs a gossip round and a failure check on every tick.
pub struct GossipTicker {
    membership: Arc<GossipMembership>,
}

impl GossipTicker {
    #[must_use]
    pub fn new(membership: Arc<GossipMembership>) -> Self {
        Self { membership }
    }

    async fn run(&self) {
        self.membership.gossip_round().await;
        self.membership.detect_failures().await;
    }
}

#[async_trait]
impl Periodic for GossipTicker {
    type Command = GossipCommand;

    async fn handle(&mut self, command: GossipCommand) {
        match command {
            GossipCommand::RoundNow => self.run().await,
        }
    }

    async fn on_tick(&mut self) {
        self.run().await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meshrpc_core::Payload;

    use super::*;
    use crate::transport::{LocalTransport, PayloadHandler};
    use crate::upstream::UpstreamConfig;

    /// Serves gossip for one membership on the local transport.
    struct GossipEndpoint(Arc<GossipMembership>);

    #[async_trait]
    impl PayloadHandler for GossipEndpoint {
        async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
            let message = GossipMessage::from_payload(&payload)?;
            match self.0.handle(message).await {
                Some(reply) => reply.to_payload(),
                None => Ok(Payload::default()),
            }
        }
    }

    fn info(id: &str) -> BrokerInfo {
        BrokerInfo {
            id: id.to_string(),
            schema: "local".to_string(),
            ip: id.to_string(),
            external_domain: None,
            port: 9999,
            web_port: 9998,
            start_time_ms: 1,
            status: 1,
        }
    }

    struct Net {
        local: Arc<LocalTransport>,
        transports: Arc<TransportRegistry>,
    }

    impl Net {
        fn new() -> Self {
            let local = Arc::new(LocalTransport::new());
            let transports = Arc::new(TransportRegistry::new());
            transports.register(local.clone());
            Self { local, transports }
        }

        fn node(&self, id: &str, seeds: &[&str]) -> Arc<GossipMembership> {
            let config = MembershipConfig {
                seeds: seeds.iter().map(|s| (*s).to_string()).collect(),
                failure_timeout: Duration::from_millis(500),
                ..MembershipConfig::default()
            };
            let node = Arc::new(GossipMembership::new(info(id), config, Arc::clone(&self.transports)));
            self.local
                .bind(format!("{id}:9999"), Arc::new(GossipEndpoint(Arc::clone(&node))));
            node
        }
    }

    fn ids(node: &GossipMembership) -> Vec<String> {
        node.members().into_iter().map(|m| m.info.id).collect()
    }

    #[tokio::test]
    async fn seed_join_is_mutual() {
        let net = Net::new();
        let b1 = net.node("b1", &[]);
        let b2 = net.node("b2", &["local://b1:9999"]);
        b1.start().await;
        b2.start().await;

        assert_eq!(b2.state(), MemberState::Active);
        assert_eq!(ids(&b2), vec!["b1"]);
        assert_eq!(ids(&b1), vec!["b2"]);
    }

    #[tokio::test]
    async fn members_learned_through_digests_are_fetched() {
        let net = Net::new();
        let b1 = net.node("b1", &[]);
        let b2 = net.node("b2", &["local://b1:9999"]);
        let b3 = net.node("b3", &["local://b1:9999"]);
        b1.start().await;
        b2.start().await;
        b3.start().await;

        assert_eq!(ids(&b3), vec!["b1", "b2"]);
        b2.gossip_round().await;
        assert_eq!(ids(&b2), vec!["b1", "b3"]);
    }

    #[tokio::test]
    async fn member_changes_drive_inter_broker_upstream() {
        let net = Net::new();
        let upstream = Arc::new(UpstreamCluster::new(
            BROKER_DESTINATION,
            Arc::clone(&net.transports),
            UpstreamConfig::default(),
        ));
        let config = MembershipConfig::default();
        let b1 = Arc::new(
            GossipMembership::new(info("b1"), config, Arc::clone(&net.transports))
                .with_inter_broker(Arc::clone(&upstream)),
        );
        net.local.bind("b1:9999", Arc::new(GossipEndpoint(Arc::clone(&b1))));
        let b2 = net.node("b2", &["local://b1:9999"]);
        let mut changes = b1.subscribe_changes();

        b2.start().await;
        assert_eq!(*upstream.uris(), vec!["local://b2:9999".to_string()]);
        assert!(matches!(changes.recv().await, Some(MembershipChange::MemberAdded(i)) if i.id == "b2"));

        b2.leave().await;
        assert!(upstream.uris().is_empty());
        assert!(b1.members().is_empty());
        assert!(matches!(
            changes.recv().await,
            Some(MembershipChange::MemberRemoved { reason: Departure::Left, .. })
        ));
    }

    #[tokio::test]
    async fn silent_member_is_removed_and_not_resurrected_by_stale_digests() {
        let net = Net::new();
        let b1 = net.node("b1", &[]);
        let b2 = net.node("b2", &["local://b1:9999"]);
        b2.start().await;
        assert_eq!(ids(&b1), vec!["b2"]);

        let failed = b1.detect_failures_at(now_ms() + 10_000).await;
        assert_eq!(failed, vec!["b2".to_string()]);
        assert!(b1.members().is_empty());

        // b2 is still reachable, but a stale digest must not bring it back.
        net.node("b3", &[]);
        b1.handle(GossipMessage::Ping(PingPayload {
            from: info("b3"),
            members: vec![MemberDigest {
                id: "b2".into(),
                uri: "local://b2:9999".into(),
            }],
        }))
        .await;
        assert_eq!(ids(&b1), vec!["b3"]);
    }

    struct Collect(Mutex<Vec<EventEnvelope>>);

    #[async_trait]
    impl ControlEventSink for Collect {
        async fn deliver(&self, envelope: EventEnvelope) {
            self.0.lock().push(envelope);
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_sink() {
        let net = Net::new();
        let b1 = net.node("b1", &[]);
        let b2 = net.node("b2", &["local://b1:9999"]);
        let b3 = net.node("b3", &["local://b1:9999"]);
        b2.start().await;
        b3.start().await;
        let sink2 = Arc::new(Collect(Mutex::new(Vec::new())));
        let sink3 = Arc::new(Collect(Mutex::new(Vec::new())));
        b2.set_sink(sink2.clone());
        b3.set_sink(sink3.clone());

        let envelope = EventEnvelope::wrap(
            "b1",
            &meshrpc_core::CacheInvalidate {
                app_name: None,
                keys: vec![],
            },
        )
        .unwrap();
        b1.broadcast(&envelope).await;
        assert_eq!(sink2.0.lock().as_slice(), &[envelope.clone()]);
        assert_eq!(sink3.0.lock().as_slice(), &[envelope]);
    }

    #[tokio::test]
    async fn unreachable_seed_is_tolerated() {
        let net = Net::new();
        let b1 = net.node("b1", &["local://nowhere:9999"]);
        b1.start().await;
        assert_eq!(b1.state(), MemberState::Active);
        assert!(b1.members().is_empty());
    }
}
