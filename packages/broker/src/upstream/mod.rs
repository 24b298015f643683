//! Outbound connection pools, one per logical destination.

mod cluster;
mod manager;

pub use cluster::{RefreshSummary, UpstreamCluster, UpstreamConfig};
pub use manager::{RefreshCommand, UpstreamManager, UpstreamRefresher};
