use meshrpc_core::MetadataError;

/// Errors surfaced by routing, upstream and transport operations.
///
/// Network and upstream failures always reach callers as one of these
/// variants, never as a raw transport error.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no available upstream for {destination}")]
    NoAvailableUpstream { destination: String },
    #[error("no transport registered for {uri}")]
    UnresolvedTransport { uri: String },
    #[error("handshake with {uri} failed: {reason}")]
    HandshakeFailed { uri: String, reason: String },
    #[error("malformed routing metadata: {0}")]
    MalformedRoutingMetadata(#[from] MetadataError),
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("connection to {uri} closed")]
    ConnectionClosed { uri: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MeshError {
    /// Whether the failure says something about the health of the remote end.
    ///
    /// Remote application errors and local codec errors do not.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed { .. } | Self::ConnectionClosed { .. } | Self::Timeout { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<meshrpc_core::EventError> for MeshError {
    fn from(err: meshrpc_core::EventError) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
