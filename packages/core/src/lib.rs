//! `meshrpc` core: service locators, routing hash, call metadata and
//! control-event wire formats.

pub mod event;
pub mod hash;
pub mod locator;
pub mod routing;
pub mod types;

pub use event::{
    AppStatusChanged, CacheInvalidate, ConfigChanged, ControlEvent, EventEnvelope, EventError,
    PortsUpdated, ServicesExposed, ServicesHidden, UpstreamClusterChanged, BROKER_DESTINATION,
};
pub use hash::{murmur3_32, routing_hash};
pub use locator::{LocatorError, ServiceLocator};
pub use routing::{CompositeMetadata, MetadataEntry, MetadataError, RoutingMetadata};
pub use types::{AppMetadata, AppStatus, BrokerInfo, Payload, SetupPayload};
