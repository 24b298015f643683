//! Connection pool for one logical destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use meshrpc_core::{routing_hash, Payload};

use crate::balancer::{build_balancer, LoadBalancer};
use crate::config::LoadBalanceStrategyKind;
use crate::error::{MeshError, MeshResult};
use crate::transport::{Connection, TransportRegistry};

// ---------------------------------------------------------------------------
// UpstreamConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub strategy: LoadBalanceStrategyKind,
    /// Applied to every request-response call.
    pub call_timeout: Duration,
    /// Period of the unhealthy retry / discovery re-resolve loop.
    pub refresh_interval: Duration,
    /// Connect to new URIs during refresh rather than on first use.
    pub eager_connect: bool,
    pub exploration: f64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategyKind::RoundRobin,
            call_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            eager_connect: false,
            exploration: 0.1,
        }
    }
}

/// Outcome of [`UpstreamCluster::refresh_uris`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// URIs dropped because no transport accepts them.
    pub rejected: Vec<String>,
}

impl RefreshSummary {
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// UpstreamCluster
// ---------------------------------------------------------------------------

/// Keeps connections to every endpoint of one destination alive and picks
/// one per call.
///
/// `active` only ever holds URIs that are configured and not unhealthy. The
/// shared sets are locked per entry for the duration of a mutation, never
/// across a call.
pub struct UpstreamCluster {
    destination: String,
    routing_hash: u32,
    transports: Arc<TransportRegistry>,
    config: UpstreamConfig,
    balancer: Arc<dyn LoadBalancer>,
    uris: ArcSwap<Vec<String>>,
    active: DashMap<String, Arc<dyn Connection>>,
    unhealthy: DashSet<String>,
    refresh_lock: tokio::sync::Mutex<()>,
    last_refresh_ms: AtomicU64,
    last_health_check_ms: AtomicU64,
}

impl UpstreamCluster {
    #[must_use]
    pub fn new(
        destination: impl Into<String>,
        transports: Arc<TransportRegistry>,
        config: UpstreamConfig,
    ) -> Self {
        let balancer = build_balancer(config.strategy, config.exploration);
        Self::with_balancer(destination, transports, config, balancer)
    }

    #[must_use]
    pub fn with_balancer(
        destination: impl Into<String>,
        transports: Arc<TransportRegistry>,
        config: UpstreamConfig,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        let destination = destination.into();
        Self {
            routing_hash: routing_hash(&destination),
            destination,
            transports,
            config,
            balancer,
            uris: ArcSwap::from_pointee(Vec::new()),
            active: DashMap::new(),
            unhealthy: DashSet::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_refresh_ms: AtomicU64::new(0),
            last_health_check_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    #[must_use]
    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Configured URIs in order.
    #[must_use]
    pub fn uris(&self) -> Arc<Vec<String>> {
        self.uris.load_full()
    }

    #[must_use]
    pub fn active_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn unhealthy_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.unhealthy.iter().map(|u| u.key().clone()).collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn last_refresh_ms(&self) -> u64 {
        self.last_refresh_ms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_health_check_ms(&self) -> u64 {
        self.last_health_check_ms.load(Ordering::Relaxed)
    }

    fn is_configured(&self, uri: &str) -> bool {
        self.uris.load().iter().any(|u| u == uri)
    }

    // -----------------------------------------------------------------------
    // Membership of the URI set
    // -----------------------------------------------------------------------

    /// Replaces the endpoint set.
    ///
    /// Removed URIs are closed immediately, failing their in-flight calls.
    /// Added URIs are connected now when `eager_connect` is set, otherwise on
    /// first use. URIs no transport accepts are dropped with a warning.
    pub async fn refresh_uris(&self, new_uris: Vec<String>) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;
        let mut summary = RefreshSummary::default();

        let mut next: Vec<String> = Vec::with_capacity(new_uris.len());
        for uri in new_uris {
            if next.contains(&uri) {
                continue;
            }
            if self.transports.resolve(&uri).is_err() {
                tracing::warn!(destination = %self.destination, %uri, "dropping unresolvable upstream uri");
                summary.rejected.push(uri);
                continue;
            }
            next.push(uri);
        }

        let previous = self.uris.load_full();
        summary.added = next.iter().filter(|u| !previous.contains(*u)).cloned().collect();
        summary.removed = previous.iter().filter(|u| !next.contains(*u)).cloned().collect();

        // Publish the new set first so no new call picks a removed URI.
        self.uris.store(Arc::new(next));
        for uri in &summary.removed {
            self.unhealthy.remove(uri);
            if let Some((_, conn)) = self.active.remove(uri) {
                conn.close();
            }
            self.balancer.evict(uri);
        }
        if !summary.is_unchanged() {
            self.balancer.invalidate(self.routing_hash);
            tracing::info!(
                destination = %self.destination,
                added = ?summary.added,
                removed = ?summary.removed,
                "upstream uris refreshed"
            );
        }
        self.last_refresh_ms.store(now_ms(), Ordering::Relaxed);

        if self.config.eager_connect {
            let connects = summary.added.iter().map(|uri| self.ensure_connection(uri));
            for result in join_all(connects).await {
                if let Err(err) = result {
                    tracing::debug!(destination = %self.destination, %err, "eager connect failed");
                }
            }
        }
        summary
    }

    /// Moves `uri` to the unhealthy set and closes its connection.
    pub fn mark_unhealthy(&self, uri: &str) {
        if !self.is_configured(uri) {
            return;
        }
        if self.unhealthy.insert(uri.to_string()) {
            tracing::warn!(destination = %self.destination, %uri, "upstream marked unhealthy");
        }
        if let Some((_, conn)) = self.active.remove(uri) {
            conn.close();
        }
        self.balancer.invalidate(self.routing_hash);
    }

    /// Retries every unhealthy URI now; returns the URIs that recovered.
    pub async fn refresh_unhealthy_uris(&self) -> Vec<String> {
        let pending = self.unhealthy_uris();
        let attempts = pending.iter().map(|uri| async move {
            match self.transports.open(uri).await {
                Ok(conn) => Some((uri.clone(), conn)),
                Err(err) => {
                    tracing::debug!(destination = %self.destination, %uri, %err, "upstream still unhealthy");
                    None
                }
            }
        });

        let mut recovered = Vec::new();
        for (uri, conn) in join_all(attempts).await.into_iter().flatten() {
            if !self.is_configured(&uri) {
                conn.close();
                continue;
            }
            self.unhealthy.remove(&uri);
            if let Some(old) = self.active.insert(uri.clone(), Arc::clone(&conn)) {
                old.close();
            }
            if !self.is_configured(&uri) {
                self.active.remove_if(&uri, |_, c| Arc::ptr_eq(c, &conn));
                conn.close();
                continue;
            }
            tracing::info!(destination = %self.destination, %uri, "upstream recovered");
            recovered.push(uri);
        }
        if !recovered.is_empty() {
            self.balancer.invalidate(self.routing_hash);
        }
        self.last_health_check_ms.store(now_ms(), Ordering::Relaxed);
        recovered
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    async fn ensure_connection(&self, uri: &str) -> MeshResult<Arc<dyn Connection>> {
        if let Some(conn) = self.active.get(uri).map(|c| Arc::clone(c.value())) {
            if !conn.is_closed() {
                return Ok(conn);
            }
            self.active.remove_if(uri, |_, c| c.is_closed());
        }

        let conn = match self.transports.open(uri).await {
            Ok(conn) => conn,
            Err(err) => {
                self.mark_unhealthy(uri);
                return Err(err);
            }
        };

        self.adopt(uri, conn)
    }

    fn is_usable(&self, uri: &str) -> bool {
        self.is_configured(uri) && !self.unhealthy.contains(uri)
    }

    /// Stores a freshly opened connection as the active one for `uri`.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if `uri` is no longer configured or turned
    /// unhealthy while the connection was being opened.
    fn adopt(&self, uri: &str, conn: Arc<dyn Connection>) -> MeshResult<Arc<dyn Connection>> {
        let gone = || MeshError::ConnectionClosed {
            uri: uri.to_string(),
        };
        if !self.is_usable(uri) {
            conn.close();
            return Err(gone());
        }
        // Another task may have connected concurrently; keep the first.
        let kept = Arc::clone(
            self.active
                .entry(uri.to_string())
                .or_insert_with(|| Arc::clone(&conn))
                .value(),
        );
        if !Arc::ptr_eq(&kept, &conn) {
            conn.close();
        }
        // A removal may have landed between the check and the insert.
        if !self.is_usable(uri) {
            self.active.remove_if(uri, |_, c| Arc::ptr_eq(c, &kept));
            kept.close();
            return Err(gone());
        }
        Ok(kept)
    }

    /// Picks an endpoint and returns a live connection to it.
    ///
    /// Endpoints that fail to connect are marked unhealthy and the next
    /// candidate is tried.
    ///
    /// # Errors
    ///
    /// [`MeshError::NoAvailableUpstream`] when no endpoint is configured or
    /// every one is unhealthy.
    pub async fn get_connection(
        &self,
        fingerprint: Option<&[u8]>,
    ) -> MeshResult<(String, Arc<dyn Connection>)> {
        let mut candidates: Vec<String> = self
            .uris
            .load()
            .iter()
            .filter(|u| !self.unhealthy.contains(*u))
            .cloned()
            .collect();

        loop {
            let Some(uri) = self
                .balancer
                .select(self.routing_hash, fingerprint, &candidates)
                .cloned()
            else {
                return Err(MeshError::NoAvailableUpstream {
                    destination: self.destination.clone(),
                });
            };
            match self.ensure_connection(&uri).await {
                Ok(conn) => return Ok((uri, conn)),
                Err(err) => {
                    tracing::debug!(destination = %self.destination, %uri, %err, "upstream candidate failed");
                    candidates.retain(|c| *c != uri);
                }
            }
        }
    }

    /// Connection to one specific configured endpoint.
    ///
    /// # Errors
    ///
    /// `NoAvailableUpstream` if `uri` is not configured or unhealthy.
    pub async fn connection_to(&self, uri: &str) -> MeshResult<Arc<dyn Connection>> {
        if !self.is_configured(uri) || self.unhealthy.contains(uri) {
            return Err(MeshError::NoAvailableUpstream {
                destination: format!("{} ({uri})", self.destination),
            });
        }
        self.ensure_connection(uri).await
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Request-response through the balancer with the configured timeout.
    ///
    /// Timeouts and connection failures count as failed samples and mark the
    /// endpoint unhealthy.
    ///
    /// # Errors
    ///
    /// `NoAvailableUpstream`, `Timeout`, `ConnectionClosed`, or the remote
    /// error.
    pub async fn request_response(
        &self,
        payload: Payload,
        fingerprint: Option<&[u8]>,
    ) -> MeshResult<Payload> {
        let (uri, conn) = self.get_connection(fingerprint).await?;
        self.call(&uri, conn.as_ref(), payload).await
    }

    /// Request-response to one specific endpoint, with the same accounting.
    ///
    /// # Errors
    ///
    /// As [`Self::request_response`].
    pub async fn request_response_to(&self, uri: &str, payload: Payload) -> MeshResult<Payload> {
        let conn = self.connection_to(uri).await?;
        self.call(uri, conn.as_ref(), payload).await
    }

    async fn call(&self, uri: &str, conn: &dyn Connection, payload: Payload) -> MeshResult<Payload> {
        self.balancer.on_start(uri);
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.call_timeout, conn.request_response(payload)).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout {
                timeout_ms: u64::try_from(self.config.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        let failed_link = result.as_ref().err().is_some_and(MeshError::is_connection_failure);
        self.balancer.record(uri, started.elapsed(), !failed_link);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(MeshError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        metrics::counter!(
            "meshrpc_upstream_calls_total",
            "destination" => self.destination.clone(),
            "outcome" => outcome
        )
        .increment(1);

        if failed_link && !matches!(result, Err(MeshError::Timeout { .. })) {
            self.mark_unhealthy(uri);
        }
        result
    }

    /// Fire-and-forget to every healthy endpoint. Returns one result per URI.
    pub async fn broadcast(&self, payload: Payload) -> Vec<(String, MeshResult<()>)> {
        let targets: Vec<String> = self
            .uris
            .load()
            .iter()
            .filter(|u| !self.unhealthy.contains(*u))
            .cloned()
            .collect();
        let sends = targets.into_iter().map(|uri| {
            let payload = payload.clone();
            async move {
                let result = match self.ensure_connection(&uri).await {
                    Ok(conn) => conn.fire_and_forget(payload).await,
                    Err(err) => Err(err),
                };
                if result.as_ref().err().is_some_and(MeshError::is_connection_failure) {
                    self.mark_unhealthy(&uri);
                }
                (uri, result)
            }
        });
        join_all(sends).await
    }

    /// Closes every connection. The URI set is kept.
    pub fn close(&self) {
        let uris: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for uri in uris {
            if let Some((_, conn)) = self.active.remove(&uri) {
                conn.close();
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
