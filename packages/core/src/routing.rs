//! Call-envelope metadata: composite entries and the routing entry.
//!
//! Composite metadata is an ordered list of `(mime-type, length, bytes)`
//! entries. Each entry is laid out as:
//!
//! ```text
//! +----------------+-----------------+----------------------+-----------+
//! | mime len - 1   | mime (ASCII)    | content len (u24 BE) | content   |
//! | u8, high bit 0 | 1..=128 bytes   | 3 bytes              | n bytes   |
//! +----------------+-----------------+----------------------+-----------+
//! ```
//!
//! The routing entry comes in two encodings. The binary form is placed
//! first so the broker can dispatch on the leading service hash without
//! parsing strings:
//!
//! ```text
//! +-------------------+-------------------+-----------+-------------------------------+
//! | service hash u32  | handler hash u32  | flags u8  | routing key (UTF-8, to end)   |
//! +-------------------+-------------------+-----------+-------------------------------+
//! ```
//!
//! `flags` bit 0 is the sticky flag. The routing key is the textual fallback
//! `group!service.method:version`, which is also accepted on its own under
//! [`MIME_TEXT_ROUTING`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::hash::routing_hash;
use crate::locator::{format_gsv, LocatorError, ServiceLocator, GROUP_SEPARATOR, VERSION_SEPARATOR};

/// Mime type of the binary routing entry.
pub const MIME_BINARY_ROUTING: &str = "message/x.meshrpc.binary-routing.v0";

/// Mime type of the textual routing entry.
pub const MIME_TEXT_ROUTING: &str = "message/x.meshrpc.routing.v0";

const MAX_MIME_LEN: usize = 128;
const MAX_CONTENT_LEN: usize = 0x00FF_FFFF;
const BINARY_HEADER_LEN: usize = 9;
const FLAG_STICKY: u8 = 0b0000_0001;

/// Errors from decoding call metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("mime type length {0} is outside 1..=128")]
    MimeLength(usize),
    #[error("well-known mime ids are not supported (byte {0:#04x})")]
    WellKnownMime(u8),
    #[error("entry content of {0} bytes exceeds the 24-bit length field")]
    ContentTooLarge(usize),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("routing key {key:?} has no method segment")]
    MissingMethod { key: String },
    #[error("routing key {key:?} is not a valid locator: {source}")]
    InvalidLocator {
        key: String,
        #[source]
        source: LocatorError,
    },
    #[error("binary routing hash {declared:#010x} does not match routing key hash {computed:#010x}")]
    HashMismatch { declared: u32, computed: u32 },
    #[error("no routing entry in composite metadata")]
    NoRoutingEntry,
}

// ---------------------------------------------------------------------------
// Composite metadata
// ---------------------------------------------------------------------------

/// A single `(mime-type, bytes)` metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub mime_type: String,
    pub content: Bytes,
}

/// Ordered list of metadata entries carried in a call envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeMetadata {
    entries: Vec<MetadataEntry>,
}

impl CompositeMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, keeping insertion order.
    pub fn push(&mut self, mime_type: impl Into<String>, content: impl Into<Bytes>) {
        self.entries.push(MetadataEntry {
            mime_type: mime_type.into(),
            content: content.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Returns the first entry with the given mime type.
    #[must_use]
    pub fn get(&self, mime_type: &str) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| e.mime_type == mime_type)
    }

    /// Serializes all entries in order.
    ///
    /// # Errors
    ///
    /// Fails if a mime type is empty, longer than 128 bytes, or if a
    /// content block does not fit the 24-bit length field.
    pub fn encode(&self) -> Result<Bytes, MetadataError> {
        let mut buf = BytesMut::new();
        for entry in &self.entries {
            let mime = entry.mime_type.as_bytes();
            if mime.is_empty() || mime.len() > MAX_MIME_LEN {
                return Err(MetadataError::MimeLength(mime.len()));
            }
            if entry.content.len() > MAX_CONTENT_LEN {
                return Err(MetadataError::ContentTooLarge(entry.content.len()));
            }
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u8((mime.len() - 1) as u8);
            buf.put_slice(mime);
            #[allow(clippy::cast_possible_truncation)]
            let len = entry.content.len() as u32;
            buf.put_slice(&len.to_be_bytes()[1..]);
            buf.put_slice(&entry.content);
        }
        Ok(buf.freeze())
    }

    /// Parses a composite metadata block.
    ///
    /// # Errors
    ///
    /// Fails on truncation, well-known mime ids, or non-ASCII mime types.
    pub fn decode(mut data: &[u8]) -> Result<Self, MetadataError> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let header = data[0];
            if header & 0x80 != 0 {
                return Err(MetadataError::WellKnownMime(header));
            }
            let mime_len = usize::from(header) + 1;
            let mime = take(&mut data, 1 + mime_len)?;
            let mime = std::str::from_utf8(&mime[1..])
                .ok()
                .filter(|m| m.is_ascii())
                .ok_or(MetadataError::InvalidUtf8("mime type"))?
                .to_string();

            let len_bytes = take(&mut data, 3)?;
            let len = u32::from_be_bytes([0, len_bytes[0], len_bytes[1], len_bytes[2]]) as usize;
            let content = Bytes::copy_from_slice(take(&mut data, len)?);

            entries.push(MetadataEntry {
                mime_type: mime,
                content,
            });
        }
        Ok(Self { entries })
    }

    /// Extracts the routing entry, preferring the binary encoding.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NoRoutingEntry`] when neither encoding is
    /// present, or the decode error of the entry that was found.
    pub fn routing(&self) -> Result<RoutingMetadata, MetadataError> {
        if let Some(entry) = self.get(MIME_BINARY_ROUTING) {
            return RoutingMetadata::decode_binary(&entry.content);
        }
        if let Some(entry) = self.get(MIME_TEXT_ROUTING) {
            let key = std::str::from_utf8(&entry.content)
                .map_err(|_| MetadataError::InvalidUtf8("routing key"))?;
            return RoutingMetadata::parse_key(key, false);
        }
        Err(MetadataError::NoRoutingEntry)
    }
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8], MetadataError> {
    if data.len() < n {
        return Err(MetadataError::Truncated {
            needed: n,
            available: data.len(),
        });
    }
    let (head, tail) = data.split_at(n);
    *data = tail;
    Ok(head)
}

// ---------------------------------------------------------------------------
// Routing entry
// ---------------------------------------------------------------------------

/// Decoded routing entry: which method of which service a call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMetadata {
    locator: ServiceLocator,
    method: String,
    sticky: bool,
}

impl RoutingMetadata {
    #[must_use]
    pub fn new(locator: ServiceLocator, method: impl Into<String>, sticky: bool) -> Self {
        Self {
            locator,
            method: method.into(),
            sticky,
        }
    }

    #[must_use]
    pub fn locator(&self) -> &ServiceLocator {
        &self.locator
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Routing hash of the service (not the method).
    #[must_use]
    pub fn service_hash(&self) -> u32 {
        self.locator.routing_hash()
    }

    /// Hash of the full routing key, identifying one handler.
    #[must_use]
    pub fn handler_hash(&self) -> u32 {
        routing_hash(&self.routing_key())
    }

    /// Textual form: `group!service.method:version`.
    #[must_use]
    pub fn routing_key(&self) -> String {
        self.locator.method_key(&self.method)
    }

    /// Parses `group!service.method:version`; the method is everything
    /// after the last `.` of the service segment.
    ///
    /// # Errors
    ///
    /// Fails when no method segment is present or the remaining locator
    /// is invalid.
    pub fn parse_key(key: &str, sticky: bool) -> Result<Self, MetadataError> {
        let (group, rest) = match key.split_once(GROUP_SEPARATOR) {
            Some((group, rest)) => (group, rest),
            None => ("", key),
        };
        let (service_method, version) = match rest.split_once(VERSION_SEPARATOR) {
            Some((sm, version)) => (sm, version),
            None => (rest, ""),
        };
        let Some((service, method)) = service_method.rsplit_once('.') else {
            return Err(MetadataError::MissingMethod {
                key: key.to_string(),
            });
        };
        if method.is_empty() {
            return Err(MetadataError::MissingMethod {
                key: key.to_string(),
            });
        }
        let locator = ServiceLocator::parse(&format_gsv(group, service, version)).map_err(
            |source| MetadataError::InvalidLocator {
                key: key.to_string(),
                source,
            },
        )?;
        Ok(Self::new(locator, method, sticky))
    }

    /// Encodes the binary routing entry.
    #[must_use]
    pub fn encode_binary(&self) -> Bytes {
        let key = self.routing_key();
        let mut buf = BytesMut::with_capacity(BINARY_HEADER_LEN + key.len());
        buf.put_u32(self.service_hash());
        buf.put_u32(routing_hash(&key));
        buf.put_u8(if self.sticky { FLAG_STICKY } else { 0 });
        buf.put_slice(key.as_bytes());
        buf.freeze()
    }

    /// Decodes a binary routing entry, verifying the declared service hash.
    ///
    /// # Errors
    ///
    /// Fails on truncation, invalid UTF-8, an unparsable routing key, or a
    /// service hash that disagrees with the key.
    pub fn decode_binary(data: &[u8]) -> Result<Self, MetadataError> {
        let declared = peek_service_hash(data)?;
        let sticky = data[8] & FLAG_STICKY != 0;
        let key = std::str::from_utf8(&data[BINARY_HEADER_LEN..])
            .map_err(|_| MetadataError::InvalidUtf8("routing key"))?;
        let routing = Self::parse_key(key, sticky)?;
        let computed = routing.service_hash();
        if computed != declared {
            return Err(MetadataError::HashMismatch { declared, computed });
        }
        Ok(routing)
    }

    /// Builds a composite block holding the binary entry first and the
    /// textual fallback second.
    ///
    /// # Errors
    ///
    /// Propagates [`CompositeMetadata::encode`] failures.
    pub fn to_composite(&self) -> Result<Bytes, MetadataError> {
        let mut composite = CompositeMetadata::new();
        composite.push(MIME_BINARY_ROUTING, self.encode_binary());
        composite.push(MIME_TEXT_ROUTING, Bytes::from(self.routing_key()));
        composite.encode()
    }
}

/// Reads only the leading service hash of a binary routing entry.
///
/// # Errors
///
/// Returns [`MetadataError::Truncated`] when the fixed header is incomplete.
pub fn peek_service_hash(data: &[u8]) -> Result<u32, MetadataError> {
    if data.len() < BINARY_HEADER_LEN {
        return Err(MetadataError::Truncated {
            needed: BINARY_HEADER_LEN,
            available: data.len(),
        });
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_add(sticky: bool) -> RoutingMetadata {
        RoutingMetadata::new(
            ServiceLocator::of("g", "com.example.Calc", "1").unwrap(),
            "add",
            sticky,
        )
    }

    #[test]
    fn routing_key_text_form() {
        assert_eq!(calc_add(false).routing_key(), "g!com.example.Calc.add:1");
    }

    #[test]
    fn service_hash_excludes_method() {
        let add = calc_add(false);
        let sub = RoutingMetadata::new(add.locator().clone(), "sub", false);
        assert_eq!(add.service_hash(), sub.service_hash());
        assert_ne!(add.handler_hash(), sub.handler_hash());
        assert_eq!(add.service_hash(), routing_hash("g!com.example.calc:1"));
    }

    #[test]
    fn binary_layout_is_big_endian_header_then_key() {
        let routing = calc_add(true);
        let bytes = routing.encode_binary();
        assert_eq!(&bytes[0..4], &routing.service_hash().to_be_bytes());
        assert_eq!(&bytes[4..8], &routing.handler_hash().to_be_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..], b"g!com.example.Calc.add:1");
        assert_eq!(peek_service_hash(&bytes).unwrap(), routing.service_hash());
    }

    #[test]
    fn binary_decode_restores_sticky_flag() {
        let decoded = RoutingMetadata::decode_binary(&calc_add(true).encode_binary()).unwrap();
        assert!(decoded.is_sticky());
        assert_eq!(decoded.method(), "add");
        assert_eq!(decoded.locator().gsv(), "g!com.example.Calc:1");
    }

    #[test]
    fn binary_decode_rejects_tampered_hash() {
        let mut raw = calc_add(false).encode_binary().to_vec();
        raw[0] ^= 0xFF;
        assert!(matches!(
            RoutingMetadata::decode_binary(&raw),
            Err(MetadataError::HashMismatch { .. })
        ));
    }

    #[test]
    fn binary_decode_rejects_short_input() {
        assert_eq!(
            RoutingMetadata::decode_binary(&[1, 2, 3]),
            Err(MetadataError::Truncated {
                needed: 9,
                available: 3
            })
        );
    }

    #[test]
    fn parse_key_without_group_or_version() {
        let routing = RoutingMetadata::parse_key("Calc.add", false).unwrap();
        assert_eq!(routing.locator().gsv(), "Calc");
        assert_eq!(routing.method(), "add");
    }

    #[test]
    fn parse_key_requires_method() {
        assert!(matches!(
            RoutingMetadata::parse_key("g!Calc:1", false),
            Err(MetadataError::MissingMethod { .. })
        ));
        assert!(matches!(
            RoutingMetadata::parse_key("g!Calc.:1", false),
            Err(MetadataError::MissingMethod { .. })
        ));
    }

    #[test]
    fn composite_entry_layout() {
        let mut composite = CompositeMetadata::new();
        composite.push("text/plain", Bytes::from_static(b"hi"));
        let bytes = composite.encode().unwrap();
        // 'text/plain' is 10 bytes -> header 9, then mime, then 00 00 02, then content.
        assert_eq!(bytes[0], 9);
        assert_eq!(&bytes[1..11], b"text/plain");
        assert_eq!(&bytes[11..14], &[0, 0, 2]);
        assert_eq!(&bytes[14..], b"hi");
    }

    #[test]
    fn composite_prefers_binary_routing_entry() {
        let bytes = calc_add(true).to_composite().unwrap();
        let composite = CompositeMetadata::decode(&bytes).unwrap();
        assert_eq!(composite.entries().len(), 2);
        assert_eq!(composite.entries()[0].mime_type, MIME_BINARY_ROUTING);
        assert!(composite.routing().unwrap().is_sticky());
    }

    #[test]
    fn composite_falls_back_to_text_entry() {
        let mut composite = CompositeMetadata::new();
        composite.push("application/json", Bytes::from_static(b"{}"));
        composite.push(MIME_TEXT_ROUTING, Bytes::from_static(b"g!Calc.add:1"));
        let decoded = CompositeMetadata::decode(&composite.encode().unwrap()).unwrap();
        let routing = decoded.routing().unwrap();
        assert!(!routing.is_sticky());
        assert_eq!(routing.locator().gsv(), "g!Calc:1");
    }

    #[test]
    fn composite_without_routing_entry() {
        let mut composite = CompositeMetadata::new();
        composite.push("application/json", Bytes::from_static(b"{}"));
        assert_eq!(composite.routing(), Err(MetadataError::NoRoutingEntry));
    }

    #[test]
    fn composite_decode_rejects_garbage() {
        assert!(matches!(
            CompositeMetadata::decode(&[0x05, b'a']),
            Err(MetadataError::Truncated { .. })
        ));
        assert!(matches!(
            CompositeMetadata::decode(&[0x81]),
            Err(MetadataError::WellKnownMime(0x81))
        ));
    }

    #[test]
    fn composite_encode_rejects_empty_mime() {
        let mut composite = CompositeMetadata::new();
        composite.push("", Bytes::new());
        assert_eq!(composite.encode(), Err(MetadataError::MimeLength(0)));
    }
}
