//! `meshrpc` broker: route table, load balancing, upstream pools, gossip
//! membership and the control-event bus.

pub mod balancer;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod upstream;
pub mod worker;

pub use broker::{Broker, HealthState};
pub use config::{BrokerConfig, LoadBalanceStrategyKind};
pub use error::{MeshError, MeshResult};
pub use telemetry::init_tracing;
