use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::cluster::{UpstreamCluster, UpstreamConfig};
use crate::discovery::DiscoveryClient;
use crate::transport::TransportRegistry;
use crate::worker::Periodic;

/// One [`UpstreamCluster`] per destination, created on demand.
pub struct UpstreamManager {
    transports: Arc<TransportRegistry>,
    config: UpstreamConfig,
    clusters: DashMap<String, Arc<UpstreamCluster>>,
}

impl UpstreamManager {
    #[must_use]
    pub fn new(transports: Arc<TransportRegistry>, config: UpstreamConfig) -> Self {
        Self {
            transports,
            config,
            clusters: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    #[must_use]
    pub fn get(&self, destination: &str) -> Option<Arc<UpstreamCluster>> {
        self.clusters.get(destination).map(|c| Arc::clone(c.value()))
    }

    /// Returns the cluster for `destination`, creating an empty one if needed.
    pub fn get_or_create(&self, destination: &str) -> Arc<UpstreamCluster> {
        if let Some(cluster) = self.get(destination) {
            return cluster;
        }
        Arc::clone(
            self.clusters
                .entry(destination.to_string())
                .or_insert_with(|| {
                    tracing::debug!(%destination, "upstream cluster created");
                    Arc::new(UpstreamCluster::new(
                        destination,
                        Arc::clone(&self.transports),
                        self.config.clone(),
                    ))
                })
                .value(),
        )
    }

    /// Drops a destination and closes its connections.
    pub fn remove(&self, destination: &str) -> Option<Arc<UpstreamCluster>> {
        let (_, cluster) = self.clusters.remove(destination)?;
        cluster.close();
        Some(cluster)
    }

    #[must_use]
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    fn clusters(&self) -> Vec<Arc<UpstreamCluster>> {
        self.clusters.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// One maintenance pass: retry unhealthy endpoints everywhere, then
    /// re-resolve destinations backed by discovery.
    pub async fn refresh_all(&self, discovery: Option<&dyn DiscoveryClient>) {
        for cluster in self.clusters() {
            cluster.refresh_unhealthy_uris().await;
            let Some(discovery) = discovery else {
                continue;
            };
            match discovery.resolve(cluster.destination()).await {
                Ok(Some(uris)) => {
                    cluster.refresh_uris(uris).await;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(destination = %cluster.destination(), %err, "discovery lookup failed; keeping current uris");
                }
            }
        }
    }

    pub fn close_all(&self) {
        for cluster in self.clusters() {
            cluster.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic refresher
// ---------------------------------------------------------------------------

/// On-demand commands for [`UpstreamRefresher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshCommand {
    /// Run a full pass now.
    All,
    /// Retry unhealthy endpoints of one destination now.
    Unhealthy(String),
}

/// Drives [`UpstreamManager::refresh_all`] from a `BackgroundWorker`.
pub struct UpstreamRefresher {
    manager: Arc<UpstreamManager>,
    discovery: Option<Arc<dyn DiscoveryClient>>,
}

impl UpstreamRefresher {
    #[must_use]
    pub fn new(manager: Arc<UpstreamManager>, discovery: Option<Arc<dyn DiscoveryClient>>) -> Self {
        Self { manager, discovery }
    }
}

#[async_trait]
impl Periodic for UpstreamRefresher {
    type Command = RefreshCommand;

    async fn handle(&mut self, command: RefreshCommand) {
        match command {
            RefreshCommand::All => self.manager.refresh_all(self.discovery.as_deref()).await,
            RefreshCommand::Unhealthy(destination) => {
                if let Some(cluster) = self.manager.get(&destination) {
                    cluster.refresh_unhealthy_uris().await;
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.manager.refresh_all(self.discovery.as_deref()).await;
    }

    async fn on_stop(&mut self) {
        self.manager.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meshrpc_core::Payload;

    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::transport::local::handler_fn;
    use crate::transport::LocalTransport;
    use crate::worker::BackgroundWorker;

    fn setup() -> (Arc<LocalTransport>, Arc<UpstreamManager>) {
        let local = Arc::new(LocalTransport::new());
        let transports = Arc::new(TransportRegistry::new());
        transports.register(local.clone());
        (local, Arc::new(UpstreamManager::new(transports, UpstreamConfig::default())))
    }

    fn ok_handler() -> Arc<dyn crate::transport::PayloadHandler> {
        handler_fn(|_p: Payload| async move { Ok(Payload::default()) })
    }

    #[test]
    fn get_or_create_is_stable() {
        let (_, manager) = setup();
        let a = manager.get_or_create("g!Calc:1");
        let b = manager.get_or_create("g!Calc:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.destinations(), vec!["g!Calc:1"]);
        assert!(manager.remove("g!Calc:1").is_some());
        assert!(manager.get("g!Calc:1").is_none());
    }

    #[tokio::test]
    async fn refresh_all_reresolves_from_discovery() {
        let (local, manager) = setup();
        local.bind("a", ok_handler());
        local.bind("b", ok_handler());
        let cluster = manager.get_or_create("g!Calc:1");
        cluster.refresh_uris(vec!["local://a".into()]).await;
        let untouched = manager.get_or_create("g!Other:1");
        untouched.refresh_uris(vec!["local://a".into()]).await;

        let discovery = StaticDiscovery::new().with("g!Calc:1", vec!["local://b".into()]);
        let discovery: &dyn DiscoveryClient = &discovery;
        manager.refresh_all(Some(discovery)).await;

        assert_eq!(*cluster.uris(), vec!["local://b".to_string()]);
        assert_eq!(*untouched.uris(), vec!["local://a".to_string()]);
    }

    #[tokio::test]
    async fn refresher_worker_recovers_unhealthy_endpoints() {
        let (local, manager) = setup();
        let cluster = manager.get_or_create("g!Calc:1");
        cluster.refresh_uris(vec!["local://a".into()]).await;
        assert!(cluster.get_connection(None).await.is_err());

        local.bind("a", ok_handler());
        let mut worker = BackgroundWorker::start(
            "upstream-refresh",
            UpstreamRefresher::new(Arc::clone(&manager), None),
            Duration::from_secs(3600),
        );
        worker.submit(RefreshCommand::Unhealthy("g!Calc:1".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cluster.unhealthy_uris().is_empty());

        worker.stop().await;
        assert!(cluster.active_uris().is_empty(), "stop closes pooled connections");
    }
}
