use std::sync::Arc;

use parking_lot::RwLock;

use super::{verify_fingerprint, Connection, Transport, TransportUri};
use crate::error::{MeshError, MeshResult};

/// Ordered list of transports; the first one that supports a URI opens it.
#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<Vec<Arc<dyn Transport>>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transport. Earlier registrations take precedence.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        tracing::debug!(transport = transport.name(), "transport registered");
        self.transports.write().push(transport);
    }

    /// Finds the transport for `uri` without opening anything.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::UnresolvedTransport`] if the URI is malformed or
    /// no registered transport accepts it.
    pub fn resolve(&self, uri: &str) -> MeshResult<(TransportUri, Arc<dyn Transport>)> {
        let parsed = TransportUri::parse(uri)?;
        let transport = self
            .transports
            .read()
            .iter()
            .find(|t| t.supports(&parsed))
            .cloned()
            .ok_or_else(|| MeshError::UnresolvedTransport {
                uri: uri.to_string(),
            })?;
        Ok((parsed, transport))
    }

    /// Opens a connection to `uri`.
    ///
    /// A `fingerprint` pin on the URI must match the certificate the peer
    /// presented, otherwise the connection is closed again.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedTransport` for unsupported URIs, `HandshakeFailed`
    /// on a pin mismatch, and whatever the selected transport reports when
    /// connecting.
    pub async fn open(&self, uri: &str) -> MeshResult<Arc<dyn Connection>> {
        let (parsed, transport) = self.resolve(uri)?;
        let conn = transport.open(&parsed).await?;
        if let Some(pinned) = parsed.fingerprint() {
            let trusted = conn
                .peer_certificate()
                .is_some_and(|cert| verify_fingerprint(pinned, cert));
            if !trusted {
                tracing::warn!(%uri, transport = transport.name(), "peer certificate does not match pin");
                conn.close();
                return Err(MeshError::HandshakeFailed {
                    uri: uri.to_string(),
                    reason: "certificate fingerprint mismatch".to_string(),
                });
            }
        }
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use meshrpc_core::Payload;

    use super::*;
    use crate::transport::{certificate_fingerprint, LocalTransport, PayloadStream, Scheme};

    struct Refusing(&'static str);

    #[async_trait]
    impl Transport for Refusing {
        fn name(&self) -> &'static str {
            self.0
        }

        fn supports(&self, uri: &TransportUri) -> bool {
            uri.scheme() == Scheme::Local
        }

        async fn open(&self, uri: &TransportUri) -> MeshResult<Arc<dyn Connection>> {
            Err(MeshError::HandshakeFailed {
                uri: uri.to_string(),
                reason: self.0.to_string(),
            })
        }
    }

    struct SecureConnection {
        uri: String,
        cert: Option<Vec<u8>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Connection for SecureConnection {
        fn id(&self) -> u64 {
            1
        }

        fn uri(&self) -> &str {
            &self.uri
        }

        async fn request_response(&self, payload: Payload) -> MeshResult<Payload> {
            Ok(payload)
        }

        async fn request_stream(&self, _payload: Payload) -> MeshResult<PayloadStream> {
            Err(MeshError::ConnectionClosed { uri: self.uri.clone() })
        }

        async fn fire_and_forget(&self, _payload: Payload) -> MeshResult<()> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn closed(&self) {}

        fn peer_certificate(&self) -> Option<&[u8]> {
            self.cert.as_deref()
        }
    }

    /// Hands out connections presenting a fixed certificate.
    struct Secure {
        cert: Option<Vec<u8>>,
        opened: parking_lot::Mutex<Vec<Arc<SecureConnection>>>,
    }

    impl Secure {
        fn presenting(cert: Option<&[u8]>) -> Arc<Self> {
            Arc::new(Self {
                cert: cert.map(<[u8]>::to_vec),
                opened: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn last_closed(&self) -> bool {
            self.opened.lock().last().is_some_and(|c| c.is_closed())
        }
    }

    #[async_trait]
    impl Transport for Secure {
        fn name(&self) -> &'static str {
            "secure"
        }

        fn supports(&self, uri: &TransportUri) -> bool {
            uri.scheme() == Scheme::Tls
        }

        async fn open(&self, uri: &TransportUri) -> MeshResult<Arc<dyn Connection>> {
            let conn = Arc::new(SecureConnection {
                uri: uri.to_string(),
                cert: self.cert.clone(),
                closed: AtomicBool::new(false),
            });
            self.opened.lock().push(conn.clone());
            Ok(conn as Arc<dyn Connection>)
        }
    }

    #[tokio::test]
    async fn pinned_certificate_is_accepted() {
        let registry = TransportRegistry::new();
        let secure = Secure::presenting(Some(b"server-cert"));
        registry.register(secure.clone());
        let pin = certificate_fingerprint(b"server-cert").to_ascii_uppercase();

        let conn = registry.open(&format!("tls://h:1?fingerprint={pin}")).await.unwrap();
        assert!(!conn.is_closed());
        // No pin, no check.
        assert!(registry.open("tcps://h:1").await.is_ok());
        assert!(!secure.last_closed());
    }

    #[tokio::test]
    async fn certificate_pin_mismatch_fails_the_handshake() {
        let registry = TransportRegistry::new();
        let secure = Secure::presenting(Some(b"impostor"));
        registry.register(secure.clone());
        let uri = format!("tls://h:1?fingerprint={}", certificate_fingerprint(b"server-cert"));

        let err = registry.open(&uri).await.err().unwrap();
        assert!(
            matches!(err, MeshError::HandshakeFailed { reason, .. } if reason == "certificate fingerprint mismatch")
        );
        assert!(secure.last_closed());
    }

    #[tokio::test]
    async fn pin_without_peer_certificate_is_rejected() {
        let registry = TransportRegistry::new();
        let secure = Secure::presenting(None);
        registry.register(secure.clone());
        let uri = format!("tcps://h:1?fingerprint={}", certificate_fingerprint(b"server-cert"));
        assert!(matches!(
            registry.open(&uri).await,
            Err(MeshError::HandshakeFailed { .. })
        ));
        assert!(secure.last_closed());
    }

    #[test]
    fn first_match_wins() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(Refusing("first")));
        registry.register(Arc::new(LocalTransport::new()));
        let (_, transport) = registry.resolve("local://x").unwrap();
        assert_eq!(transport.name(), "first");
    }

    #[test]
    fn unsupported_scheme_is_unresolved() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(LocalTransport::new()));
        assert!(matches!(
            registry.resolve("tcp://10.0.0.1:9999"),
            Err(MeshError::UnresolvedTransport { .. })
        ));
    }

    #[tokio::test]
    async fn open_reports_transport_errors() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(Refusing("down")));
        let err = registry.open("local://x").await.err().unwrap();
        assert!(matches!(err, MeshError::HandshakeFailed { reason, .. } if reason == "down"));
    }
}
