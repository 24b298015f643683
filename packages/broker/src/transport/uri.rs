use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::MeshError;

/// Transport schemes understood by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    /// `tcps://` and `tls://`.
    Tls,
    Ws,
    Wss,
    /// In-process transport used for tests and embedded deployments.
    Local,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Self::Tcp),
            "tcps" | "tls" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Tls | Self::Wss)
    }
}

/// Parsed, validated endpoint URI.
///
/// Secure schemes may pin the server certificate with
/// `?fingerprint=<sha256-hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUri {
    raw: String,
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    fingerprint: Option<String>,
}

impl TransportUri {
    /// # Errors
    ///
    /// Returns [`MeshError::UnresolvedTransport`] for malformed URIs, unknown
    /// schemes, a missing host, or a fingerprint on a plaintext scheme.
    pub fn parse(input: &str) -> Result<Self, MeshError> {
        let unresolved = || MeshError::UnresolvedTransport {
            uri: input.to_string(),
        };

        let url = Url::parse(input).map_err(|_| unresolved())?;
        let scheme = Scheme::parse(url.scheme()).ok_or_else(unresolved)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(unresolved)?
            .to_string();
        let fingerprint = url
            .query_pairs()
            .find(|(k, _)| k == "fingerprint")
            .map(|(_, v)| v.into_owned());
        if fingerprint.is_some() && !scheme.is_secure() {
            return Err(unresolved());
        }

        Ok(Self {
            raw: input.to_string(),
            scheme,
            host,
            port: url.port_or_known_default(),
            fingerprint,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host` or `host:port`.
    #[must_use]
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TransportUri {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_schemes() {
        let uri = TransportUri::parse("tcp://10.0.0.1:9999").unwrap();
        assert_eq!(uri.scheme(), Scheme::Tcp);
        assert_eq!(uri.host(), "10.0.0.1");
        assert_eq!(uri.port(), Some(9999));
        assert_eq!(uri.authority(), "10.0.0.1:9999");

        assert_eq!(TransportUri::parse("tls://h:1").unwrap().scheme(), Scheme::Tls);
        assert_eq!(TransportUri::parse("tcps://h:1").unwrap().scheme(), Scheme::Tls);
        assert_eq!(TransportUri::parse("ws://h:1").unwrap().scheme(), Scheme::Ws);
        assert_eq!(
            TransportUri::parse("local://calc-1").unwrap().authority(),
            "calc-1"
        );
    }

    #[test]
    fn known_default_ports_apply() {
        assert_eq!(TransportUri::parse("wss://broker.example.com").unwrap().port(), Some(443));
        assert_eq!(TransportUri::parse("local://x").unwrap().port(), None);
    }

    #[test]
    fn fingerprint_only_on_secure_schemes() {
        let uri = TransportUri::parse("tcps://h:1?fingerprint=AB:CD").unwrap();
        assert!(uri.scheme().is_secure());
        assert_eq!(uri.fingerprint(), Some("AB:CD"));
        assert!(matches!(
            TransportUri::parse("tcp://h:1?fingerprint=AB"),
            Err(MeshError::UnresolvedTransport { .. })
        ));
    }

    #[test]
    fn rejects_unknown_or_malformed() {
        for bad in ["udp://h:1", "not a uri", "tcp://", "local:"] {
            assert!(
                matches!(TransportUri::parse(bad), Err(MeshError::UnresolvedTransport { .. })),
                "{bad}"
            );
        }
    }
}
