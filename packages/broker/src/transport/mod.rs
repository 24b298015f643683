//! Transport abstraction consumed by the routing core.
//!
//! The core never frames bytes itself. It opens a [`Connection`] for a
//! scheme-qualified URI through the [`TransportRegistry`] and issues calls on
//! it; each call carries a [`Payload`] whose metadata is the composite routing
//! block.

pub mod local;
pub mod registry;
pub mod tls;
pub mod uri;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use meshrpc_core::Payload;

use crate::error::MeshResult;

pub use local::{LocalTransport, PayloadHandler};
pub use registry::TransportRegistry;
pub use tls::{certificate_fingerprint, verify_fingerprint};
pub use uri::{Scheme, TransportUri};

/// Response stream of a request-stream call.
pub type PayloadStream = BoxStream<'static, MeshResult<Payload>>;

/// A live, multiplexed connection to one endpoint.
///
/// Every method is cancel-safe; dropping a call future abandons the call
/// locally only.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Process-unique connection id.
    fn id(&self) -> u64;

    fn uri(&self) -> &str;

    async fn request_response(&self, payload: Payload) -> MeshResult<Payload>;

    async fn request_stream(&self, payload: Payload) -> MeshResult<PayloadStream>;

    async fn fire_and_forget(&self, payload: Payload) -> MeshResult<()>;

    /// Closes the connection. Calls still in flight fail with
    /// `ConnectionClosed`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the connection is closed by either side.
    async fn closed(&self);

    /// DER certificate the peer presented, on secure transports.
    fn peer_certificate(&self) -> Option<&[u8]> {
        None
    }
}

/// Opens connections for the schemes it supports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn supports(&self, uri: &TransportUri) -> bool;

    /// # Errors
    ///
    /// Returns `HandshakeFailed` when the endpoint cannot be reached.
    async fn open(&self, uri: &TransportUri) -> MeshResult<Arc<dyn Connection>>;
}
