//! In-process `local://name` transport.
//!
//! Endpoints are bound by name to a [`PayloadHandler`]. Connections share a
//! cancellation token with their endpoint, so unbinding an endpoint closes
//! every connection to it the way a process exit would.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use meshrpc_core::Payload;
use tokio_util::sync::CancellationToken;

use super::{Connection, PayloadStream, Scheme, Transport, TransportUri};
use crate::error::{MeshError, MeshResult};

// ---------------------------------------------------------------------------
// PayloadHandler
// ---------------------------------------------------------------------------

/// Server side of a connection: answers the calls arriving on it.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn request_response(&self, payload: Payload) -> MeshResult<Payload>;

    async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream> {
        let _ = payload;
        Err(MeshError::Remote("request-stream not supported".to_string()))
    }

    async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()> {
        self.request_response(payload).await.map(|_| ())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PayloadHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<Payload>> + Send + 'static,
{
    async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
        (self.0)(payload).await
    }
}

/// Wraps an async closure as a request-response handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PayloadHandler>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MeshResult<Payload>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

struct Endpoint {
    handler: Arc<dyn PayloadHandler>,
    token: CancellationToken,
}

pub struct LocalTransport {
    endpoints: DashMap<String, Endpoint>,
    next_id: AtomicU64,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Binds `name` (the URI authority, e.g. `calc-1` or `b1:9999`).
    /// Rebinding closes the connections of the previous handler.
    pub fn bind(&self, name: impl Into<String>, handler: Arc<dyn PayloadHandler>) {
        let name = name.into();
        let previous = self.endpoints.insert(
            name.clone(),
            Endpoint {
                handler,
                token: CancellationToken::new(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        tracing::debug!(endpoint = %name, "local endpoint bound");
    }

    /// Removes the endpoint and closes every connection to it.
    pub fn unbind(&self, name: &str) -> bool {
        match self.endpoints.remove(name) {
            Some((_, endpoint)) => {
                endpoint.token.cancel();
                tracing::debug!(endpoint = %name, "local endpoint unbound");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_bound(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports(&self, uri: &TransportUri) -> bool {
        uri.scheme() == Scheme::Local
    }

    async fn open(&self, uri: &TransportUri) -> MeshResult<Arc<dyn Connection>> {
        let endpoint = self
            .endpoints
            .get(&uri.authority())
            .ok_or_else(|| MeshError::HandshakeFailed {
                uri: uri.to_string(),
                reason: "no endpoint bound".to_string(),
            })?;
        Ok(Arc::new(LocalConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            uri: uri.to_string(),
            handler: Arc::clone(&endpoint.handler),
            token: endpoint.token.child_token(),
        }))
    }
}

// ---------------------------------------------------------------------------
// LocalConnection
// ---------------------------------------------------------------------------

struct LocalConnection {
    id: u64,
    uri: String,
    handler: Arc<dyn PayloadHandler>,
    token: CancellationToken,
}

impl LocalConnection {
    fn closed_error(&self) -> MeshError {
        MeshError::ConnectionClosed {
            uri: self.uri.clone(),
        }
    }

    async fn guarded<T>(&self, call: impl Future<Output = MeshResult<T>>) -> MeshResult<T> {
        if self.token.is_cancelled() {
            return Err(self.closed_error());
        }
        tokio::select! {
            () = self.token.cancelled() => Err(self.closed_error()),
            result = call => result,
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
        self.guarded(self.handler.request_response(payload)).await
    }

    async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream> {
        let stream = self.guarded(self.handler.request_stream(payload)).await?;
        let until = self.token.clone();
        let after = self.token.clone();
        let uri = self.uri.clone();
        // A stream cut short by close ends with ConnectionClosed.
        let tail = futures_util::stream::once(async move {
            after
                .is_cancelled()
                .then_some(Err(MeshError::ConnectionClosed { uri }))
        })
        .filter_map(futures_util::future::ready);
        Ok(stream
            .take_until(async move { until.cancelled().await })
            .chain(tail)
            .boxed())
    }

    async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()> {
        self.guarded(self.handler.fire_and_forget(payload)).await
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }
}
