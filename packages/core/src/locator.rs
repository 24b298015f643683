//! Service addressing: the `(group, service, version)` triple and its routing hash.
//!
//! The canonical string form ("GSV") is `group!service:version`, with the
//! group and version segments (and their separators) omitted when empty:
//!
//! - `g`, `Calc`, `1` -> `g!Calc:1`
//! - no group -> `Calc:1`
//! - no version -> `g!Calc`
//! - neither -> `Calc`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::routing_hash;

/// Separator between the group and service segments.
pub const GROUP_SEPARATOR: char = '!';

/// Separator between the service and version segments.
pub const VERSION_SEPARATOR: char = ':';

/// Errors from building or parsing a [`ServiceLocator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("service name must not be empty")]
    EmptyService,
    #[error("{segment} segment must not contain '{separator}': {value:?}")]
    ReservedCharacter {
        segment: &'static str,
        separator: char,
        value: String,
    },
    #[error("separator '{separator}' appears more than once in {input:?}")]
    DuplicateSeparator { separator: char, input: String },
    #[error("separator '{separator}' is followed or preceded by an empty segment in {input:?}")]
    EmptySegment { separator: char, input: String },
}

/// Immutable logical address of a service.
///
/// The routing hash is computed once at construction from the lowercased
/// GSV string, so lookups never rehash.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceLocator {
    group: String,
    service: String,
    version: String,
    gsv: String,
    hash: u32,
}

impl ServiceLocator {
    /// Builds a locator from its three segments.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::EmptyService`] when `service` is empty, and
    /// [`LocatorError::ReservedCharacter`] when any segment contains a
    /// separator that would make the GSV form ambiguous.
    pub fn of(
        group: impl Into<String>,
        service: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, LocatorError> {
        let group = group.into();
        let service = service.into();
        let version = version.into();

        if service.is_empty() {
            return Err(LocatorError::EmptyService);
        }
        check_reserved("group", &group)?;
        check_reserved("service", &service)?;
        check_reserved("version", &version)?;

        let gsv = format_gsv(&group, &service, &version);
        let hash = routing_hash(&gsv);
        Ok(Self {
            group,
            service,
            version,
            gsv,
            hash,
        })
    }

    /// Shorthand for a locator with empty group and version.
    ///
    /// # Errors
    ///
    /// Same as [`ServiceLocator::of`].
    pub fn service_only(service: impl Into<String>) -> Result<Self, LocatorError> {
        Self::of("", service, "")
    }

    /// Parses the canonical `group!service:version` form.
    ///
    /// # Errors
    ///
    /// Rejects duplicated separators, separators adjacent to an empty
    /// segment, and an empty service.
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        let (group, rest) = split_once_strict(input, GROUP_SEPARATOR)?;
        let (version, service) = split_once_strict(rest, VERSION_SEPARATOR)?;

        // `group` was split off first, so it cannot contain '!'; it may still
        // hide a ':' ("a:b!svc").
        check_reserved("group", group.unwrap_or(""))?;

        match (group, version) {
            (Some(""), _) => Err(LocatorError::EmptySegment {
                separator: GROUP_SEPARATOR,
                input: input.to_string(),
            }),
            (_, Some("")) => Err(LocatorError::EmptySegment {
                separator: VERSION_SEPARATOR,
                input: input.to_string(),
            }),
            _ => Self::of(group.unwrap_or(""), service, version.unwrap_or("")),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the canonical GSV string.
    #[must_use]
    pub fn gsv(&self) -> &str {
        &self.gsv
    }

    /// Returns the stable 32-bit routing hash (case-insensitive).
    #[must_use]
    pub fn routing_hash(&self) -> u32 {
        self.hash
    }

    /// Textual routing key for a method on this service:
    /// `group!service.method:version`.
    #[must_use]
    pub fn method_key(&self, method: &str) -> String {
        format_gsv(&self.group, &format!("{}.{method}", self.service), &self.version)
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gsv)
    }
}

impl fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("gsv", &self.gsv)
            .field("hash", &self.hash)
            .finish()
    }
}

impl FromStr for ServiceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceLocator {
    type Error = LocatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceLocator> for String {
    fn from(locator: ServiceLocator) -> Self {
        locator.gsv
    }
}

/// Formats the GSV string, omitting empty group/version segments.
#[must_use]
pub fn format_gsv(group: &str, service: &str, version: &str) -> String {
    let mut out = String::with_capacity(group.len() + service.len() + version.len() + 2);
    if !group.is_empty() {
        out.push_str(group);
        out.push(GROUP_SEPARATOR);
    }
    out.push_str(service);
    if !version.is_empty() {
        out.push(VERSION_SEPARATOR);
        out.push_str(version);
    }
    out
}

fn check_reserved(segment: &'static str, value: &str) -> Result<(), LocatorError> {
    for separator in [GROUP_SEPARATOR, VERSION_SEPARATOR] {
        if value.contains(separator) {
            return Err(LocatorError::ReservedCharacter {
                segment,
                separator,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Splits on a separator that may appear at most once.
///
/// For `'!'` the optional part is the prefix (group); for `':'` it is the
/// suffix (version).
fn split_once_strict(input: &str, separator: char) -> Result<(Option<&str>, &str), LocatorError> {
    if input.matches(separator).count() > 1 {
        return Err(LocatorError::DuplicateSeparator {
            separator,
            input: input.to_string(),
        });
    }
    let split = input.split_once(separator);
    Ok(match (separator, split) {
        (GROUP_SEPARATOR, Some((group, rest))) => (Some(group), rest),
        (_, Some((head, tail))) => (Some(tail), head),
        (_, None) => (None, input),
    })
}
