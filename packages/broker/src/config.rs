//! Broker configuration surface.
//!
//! Every option can be given on the command line or through a `MESHRPC_*`
//! environment variable. `Default` mirrors the command-line defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use meshrpc_core::BrokerInfo;

use crate::cluster::MembershipConfig;
use crate::upstream::UpstreamConfig;

const DEFAULT_APP_NAME: &str = "meshrpc-broker";
const DEFAULT_IP: &str = "127.0.0.1";
const DEFAULT_SCHEMA: &str = "tcp";
const DEFAULT_PORT: u16 = 9999;
const DEFAULT_WEB_PORT: u16 = 9998;
const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 1000;
const DEFAULT_FAILURE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_EXPLORATION: f64 = 0.1;

// ---------------------------------------------------------------------------
// LoadBalanceStrategyKind
// ---------------------------------------------------------------------------

/// Name of a load-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadBalanceStrategyKind {
    #[default]
    RoundRobin,
    Random,
    ConsistentHash,
    WeightedStats,
}

impl LoadBalanceStrategyKind {
    /// Canonical configuration name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "roundRobin",
            Self::Random => "random",
            Self::ConsistentHash => "consistentHash",
            Self::WeightedStats => "weightedStats",
        }
    }
}

impl fmt::Display for LoadBalanceStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized strategy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown load-balance strategy {0:?} (expected roundRobin, random, consistentHash or weightedStats)")]
pub struct UnknownStrategy(pub String);

impl FromStr for LoadBalanceStrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "consistenthash" => Ok(Self::ConsistentHash),
            "weightedstats" => Ok(Self::WeightedStats),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for one broker process.
#[derive(Debug, Clone, Parser)]
#[command(name = "meshrpc-broker", about = "meshrpc broker")]
pub struct BrokerConfig {
    /// Broker id; a random UUID is used when omitted.
    #[arg(long, env = "MESHRPC_BROKER_ID")]
    pub broker_id: Option<String>,

    /// Application name this process answers to for targeted control events.
    #[arg(long, env = "MESHRPC_APP_NAME", default_value = DEFAULT_APP_NAME)]
    pub app_name: String,

    #[arg(long, env = "MESHRPC_IP", default_value = DEFAULT_IP)]
    pub ip: String,

    /// Public alias advertised instead of the IP.
    #[arg(long, env = "MESHRPC_EXTERNAL_DOMAIN")]
    pub external_domain: Option<String>,

    /// Transport schema for the broker listener.
    #[arg(long, env = "MESHRPC_SCHEMA", default_value = DEFAULT_SCHEMA)]
    pub schema: String,

    #[arg(long, env = "MESHRPC_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "MESHRPC_WEB_PORT", default_value_t = DEFAULT_WEB_PORT)]
    pub web_port: u16,

    /// Gossip seed URIs of other brokers.
    #[arg(long = "seed", env = "MESHRPC_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    #[arg(long, env = "MESHRPC_GOSSIP_INTERVAL_MS", default_value_t = DEFAULT_GOSSIP_INTERVAL_MS)]
    pub gossip_interval_ms: u64,

    /// Silence after which a peer is declared failed.
    #[arg(long, env = "MESHRPC_FAILURE_TIMEOUT_MS", default_value_t = DEFAULT_FAILURE_TIMEOUT_MS)]
    pub failure_timeout_ms: u64,

    /// Period of the upstream refresh (unhealthy retry + re-resolve).
    #[arg(long, env = "MESHRPC_REFRESH_INTERVAL_MS", default_value_t = DEFAULT_REFRESH_INTERVAL_MS)]
    pub refresh_interval_ms: u64,

    #[arg(
        long,
        env = "MESHRPC_LOAD_BALANCE",
        default_value = "roundRobin",
        value_parser = LoadBalanceStrategyKind::from_str
    )]
    pub load_balance: LoadBalanceStrategyKind,

    /// Route sticky calls to the same instance.
    #[arg(long, env = "MESHRPC_STICKY")]
    pub sticky: bool,

    #[arg(long, env = "MESHRPC_CALL_TIMEOUT_MS", default_value_t = DEFAULT_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: u64,

    /// Connect to new upstream URIs immediately instead of on first use.
    #[arg(long, env = "MESHRPC_EAGER_CONNECT")]
    pub eager_connect: bool,

    /// Minimum share of traffic spread uniformly by the weighted-stats balancer.
    #[arg(long, env = "MESHRPC_EXPLORATION", default_value_t = DEFAULT_EXPLORATION)]
    pub exploration: f64,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, env = "MESHRPC_LOG_JSON")]
    pub log_json: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: None,
            app_name: DEFAULT_APP_NAME.to_string(),
            ip: DEFAULT_IP.to_string(),
            external_domain: None,
            schema: DEFAULT_SCHEMA.to_string(),
            port: DEFAULT_PORT,
            web_port: DEFAULT_WEB_PORT,
            seeds: Vec::new(),
            gossip_interval_ms: DEFAULT_GOSSIP_INTERVAL_MS,
            failure_timeout_ms: DEFAULT_FAILURE_TIMEOUT_MS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            load_balance: LoadBalanceStrategyKind::RoundRobin,
            sticky: false,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            eager_connect: false,
            exploration: DEFAULT_EXPLORATION,
            log_json: false,
        }
    }
}

impl BrokerConfig {
    /// Builds the `BrokerInfo` this broker announces to its peers.
    #[must_use]
    pub fn broker_info(&self, broker_id: &str, start_time_ms: u64) -> BrokerInfo {
        BrokerInfo {
            id: broker_id.to_string(),
            schema: self.schema.clone(),
            ip: self.ip.clone(),
            external_domain: self.external_domain.clone(),
            port: self.port,
            web_port: self.web_port,
            start_time_ms,
            status: 1,
        }
    }

    /// Returns the configured id or a fresh random one.
    #[must_use]
    pub fn resolve_broker_id(&self) -> String {
        self.broker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            strategy: self.load_balance,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
            eager_connect: self.eager_connect,
            exploration: self.exploration,
        }
    }

    #[must_use]
    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            seeds: self.seeds.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            failure_timeout: Duration::from_millis(self.failure_timeout_ms),
            request_timeout: Duration::from_millis(self.gossip_interval_ms.max(100)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse_case_insensitively() {
        assert_eq!(
            "roundRobin".parse::<LoadBalanceStrategyKind>().unwrap(),
            LoadBalanceStrategyKind::RoundRobin
        );
        assert_eq!(
            "CONSISTENTHASH".parse::<LoadBalanceStrategyKind>().unwrap(),
            LoadBalanceStrategyKind::ConsistentHash
        );
        assert_eq!(
            "weightedStats".parse::<LoadBalanceStrategyKind>().unwrap(),
            LoadBalanceStrategyKind::WeightedStats
        );
        assert!("leastConn".parse::<LoadBalanceStrategyKind>().is_err());
    }

    #[test]
    fn strategy_display_round_trips() {
        for kind in [
            LoadBalanceStrategyKind::RoundRobin,
            LoadBalanceStrategyKind::Random,
            LoadBalanceStrategyKind::ConsistentHash,
            LoadBalanceStrategyKind::WeightedStats,
        ] {
            assert_eq!(kind.to_string().parse::<LoadBalanceStrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn cli_parsing_matches_defaults() {
        let parsed = BrokerConfig::try_parse_from(["meshrpc-broker"]).unwrap();
        let defaults = BrokerConfig::default();
        assert_eq!(parsed.port, defaults.port);
        assert_eq!(parsed.schema, defaults.schema);
        assert_eq!(parsed.load_balance, defaults.load_balance);
        assert_eq!(parsed.call_timeout_ms, defaults.call_timeout_ms);
    }

    #[test]
    fn cli_parses_seeds_and_strategy() {
        let parsed = BrokerConfig::try_parse_from([
            "meshrpc-broker",
            "--seed",
            "tcp://10.0.0.1:9999,tcp://10.0.0.2:9999",
            "--load-balance",
            "consistentHash",
            "--sticky",
        ])
        .unwrap();
        assert_eq!(parsed.seeds.len(), 2);
        assert_eq!(parsed.load_balance, LoadBalanceStrategyKind::ConsistentHash);
        assert!(parsed.sticky);
    }

    #[test]
    fn cli_rejects_unknown_strategy() {
        assert!(BrokerConfig::try_parse_from(["meshrpc-broker", "--load-balance", "fastest"]).is_err());
    }

    #[test]
    fn derived_configs_carry_values() {
        let config = BrokerConfig {
            call_timeout_ms: 1500,
            gossip_interval_ms: 250,
            seeds: vec!["local://b2:1".to_string()],
            ..BrokerConfig::default()
        };
        assert_eq!(config.upstream_config().call_timeout, Duration::from_millis(1500));
        let membership = config.membership_config();
        assert_eq!(membership.gossip_interval, Duration::from_millis(250));
        assert_eq!(membership.seeds, vec!["local://b2:1"]);

        let info = config.broker_info("b1", 42);
        assert_eq!(info.url(), "tcp://127.0.0.1:9999");
        assert!(info.is_active());
    }
}
