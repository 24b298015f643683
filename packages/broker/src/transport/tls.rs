//! Certificate pinning for `tcps://`, `tls://` and `wss://` endpoints.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a DER-encoded certificate.
#[must_use]
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Checks a peer certificate against a pinned fingerprint.
///
/// The pin is compared case-insensitively and may use `:` separators
/// (`AB:CD:...`), as printed by most certificate tools.
#[must_use]
pub fn verify_fingerprint(pinned: &str, cert_der: &[u8]) -> bool {
    let normalized: String = pinned
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    normalized == certificate_fingerprint(cert_der)
}
