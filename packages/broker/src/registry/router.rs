//! Broker-side call routing: metadata in, one responder out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use meshrpc_core::{CompositeMetadata, Payload, RoutingMetadata};

use super::responder::{ResponderHandle, ServiceResponder};
use super::table::RouteTable;
use crate::balancer::{ConsistentHashBalancer, LoadBalancer};
use crate::error::{MeshError, MeshResult};
use crate::transport::PayloadStream;
use crate::upstream::UpstreamCluster;

/// Metadata entry marking a call relayed from another broker. The content is
/// the relaying broker's id. Relayed calls are only delivered to responders
/// connected to this broker, so a call crosses at most one broker hop.
pub const MIME_RELAY: &str = "message/x.meshrpc.relay.v0";

/// Where a resolved call goes.
struct Target {
    responder: Arc<ServiceResponder>,
    key: String,
    routing: RoutingMetadata,
    composite: CompositeMetadata,
}

/// Picks a `SERVING` responder for each call and forwards the payload.
pub struct Router {
    broker_id: String,
    table: Arc<RouteTable>,
    balancer: Arc<dyn LoadBalancer>,
    sticky: ConsistentHashBalancer,
    sticky_default: bool,
    peers: Option<Arc<UpstreamCluster>>,
    call_timeout: Duration,
}

impl Router {
    #[must_use]
    pub fn new(
        broker_id: impl Into<String>,
        table: Arc<RouteTable>,
        balancer: Arc<dyn LoadBalancer>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            broker_id: broker_id.into(),
            table,
            balancer,
            sticky: ConsistentHashBalancer::new(),
            sticky_default: false,
            peers: None,
            call_timeout,
        }
    }

    /// Treat every call as sticky, regardless of its routing flag.
    #[must_use]
    pub fn with_sticky_default(mut self, sticky: bool) -> Self {
        self.sticky_default = sticky;
        self
    }

    /// Inter-broker pool used to reach responders exposed on other brokers.
    #[must_use]
    pub fn with_peers(mut self, peers: Arc<UpstreamCluster>) -> Self {
        self.peers = Some(peers);
        self
    }

    #[must_use]
    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Drops cached sticky rings for `routing_hash`.
    pub fn invalidate(&self, routing_hash: u32) {
        self.sticky.invalidate(routing_hash);
        self.balancer.invalidate(routing_hash);
    }

    /// Chooses the responder for a call without sending anything.
    ///
    /// # Errors
    ///
    /// `MalformedRoutingMetadata` if the routing entry is missing or
    /// corrupt; `NoAvailableUpstream` if nothing serves the service.
    pub fn resolve(&self, payload: &Payload) -> MeshResult<Arc<ServiceResponder>> {
        self.target(payload).map(|t| t.responder)
    }

    fn target(&self, payload: &Payload) -> MeshResult<Target> {
        let (composite, routing) = match decode_routing(&payload.metadata) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(%err, "dropping call with malformed routing metadata");
                return Err(MeshError::MalformedRoutingMetadata(err));
            }
        };
        let relayed = composite.get(MIME_RELAY).is_some();
        let locator = routing.locator();
        let responders: Vec<Arc<ServiceResponder>> = self
            .table
            .serving_by_hash(routing.service_hash())
            .into_iter()
            .filter(|r| r.exposes(locator))
            .filter(|r| !relayed || !r.is_remote())
            .collect();
        let candidates: Vec<String> = responders.iter().map(|r| r.instance_id().to_string()).collect();

        let fingerprint = Some(&payload.data[..]);
        let chosen = if routing.is_sticky() || self.sticky_default {
            self.sticky.select(routing.service_hash(), fingerprint, &candidates)
        } else {
            self.balancer.select(routing.service_hash(), fingerprint, &candidates)
        };
        let Some(key) = chosen.cloned() else {
            return Err(MeshError::NoAvailableUpstream {
                destination: locator.gsv().to_string(),
            });
        };
        let Some(responder) = responders.into_iter().find(|r| r.instance_id().to_string() == key) else {
            return Err(MeshError::NoAvailableUpstream {
                destination: locator.gsv().to_string(),
            });
        };
        Ok(Target {
            responder,
            key,
            routing,
            composite,
        })
    }

    fn peers_for(&self, target: &Target) -> MeshResult<&Arc<UpstreamCluster>> {
        self.peers.as_ref().ok_or_else(|| MeshError::NoAvailableUpstream {
            destination: target.routing.locator().gsv().to_string(),
        })
    }

    /// Re-labels the payload so the next broker delivers it locally.
    fn relayed(&self, target: &Target, data: Bytes) -> MeshResult<Payload> {
        let mut composite = target.composite.clone();
        if composite.get(MIME_RELAY).is_none() {
            composite.push(MIME_RELAY, Bytes::from(self.broker_id.clone()));
        }
        Ok(Payload::new(composite.encode()?, data))
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    /// Routes a request-response call.
    ///
    /// Direct calls are bounded by the call timeout and feed the balancer's
    /// latency statistics; relayed calls are accounted by the inter-broker
    /// pool.
    ///
    /// # Errors
    ///
    /// Resolution errors, `Timeout`, `ConnectionClosed`, or the remote error.
    pub async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
        let target = self.target(&payload)?;
        match target.responder.handle() {
            ResponderHandle::Direct(conn) => {
                self.balancer.on_start(&target.key);
                let started = Instant::now();
                let result = match tokio::time::timeout(self.call_timeout, conn.request_response(payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::Timeout {
                        timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                };
                let failed = result.as_ref().err().is_some_and(MeshError::is_connection_failure);
                self.balancer.record(&target.key, started.elapsed(), !failed);
                result
            }
            ResponderHandle::Peer { broker_uri } => {
                let peers = self.peers_for(&target)?;
                let relayed = self.relayed(&target, payload.data)?;
                peers.request_response_to(broker_uri, relayed).await
            }
        }
    }

    /// Routes a fire-and-forget call.
    ///
    /// # Errors
    ///
    /// Resolution errors or a failed send.
    pub async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()> {
        let target = self.target(&payload)?;
        match target.responder.handle() {
            ResponderHandle::Direct(conn) => conn.fire_and_forget(payload).await,
            ResponderHandle::Peer { broker_uri } => {
                let conn = self.peers_for(&target)?.connection_to(broker_uri).await?;
                conn.fire_and_forget(self.relayed(&target, payload.data)?).await
            }
        }
    }

    /// Routes a request-stream call.
    ///
    /// # Errors
    ///
    /// Resolution errors or a failed stream setup.
    pub async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream> {
        let target = self.target(&payload)?;
        match target.responder.handle() {
            ResponderHandle::Direct(conn) => conn.request_stream(payload).await,
            ResponderHandle::Peer { broker_uri } => {
                let conn = self.peers_for(&target)?.connection_to(broker_uri).await?;
                conn.request_stream(self.relayed(&target, payload.data)?).await
            }
        }
    }
}

fn decode_routing(metadata: &[u8]) -> Result<(CompositeMetadata, RoutingMetadata), meshrpc_core::MetadataError> {
    let composite = CompositeMetadata::decode(metadata)?;
    let routing = composite.routing()?;
    Ok((composite, routing))
}
