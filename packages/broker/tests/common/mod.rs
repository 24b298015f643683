#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshrpc_broker::transport::local::handler_fn;
use meshrpc_broker::transport::{Connection, LocalTransport, Transport, TransportRegistry, TransportUri};
use meshrpc_broker::{Broker, BrokerConfig, LoadBalanceStrategyKind};
use meshrpc_core::{AppMetadata, Payload, RoutingMetadata, ServiceLocator, SetupPayload};

pub fn calc() -> ServiceLocator {
    ServiceLocator::of("math", "Calc", "1").unwrap()
}

pub fn call(data: &'static str) -> Payload {
    Payload::new(RoutingMetadata::new(calc(), "add", false).to_composite().unwrap(), data)
}

pub fn sticky_call(data: &'static str) -> Payload {
    Payload::new(RoutingMetadata::new(calc(), "add", true).to_composite().unwrap(), data)
}

/// One in-process network shared by every broker and provider of a test.
pub struct Net {
    pub local: Arc<LocalTransport>,
    pub transports: Arc<TransportRegistry>,
}

impl Net {
    pub fn new() -> Self {
        let local = Arc::new(LocalTransport::new());
        let transports = Arc::new(TransportRegistry::new());
        transports.register(local.clone());
        Self { local, transports }
    }

    /// A broker reachable at `local://{id}:9999`.
    pub fn broker(&self, id: &str, strategy: LoadBalanceStrategyKind, seeds: &[&str]) -> Arc<Broker> {
        let config = BrokerConfig {
            broker_id: Some(id.to_string()),
            schema: "local".to_string(),
            ip: id.to_string(),
            load_balance: strategy,
            seeds: seeds.iter().map(ToString::to_string).collect(),
            call_timeout_ms: 2000,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config, Arc::clone(&self.transports), None);
        self.local.bind(format!("{id}:9999"), broker.endpoint());
        broker
    }

    /// Binds a provider answering every call with its own name after `delay`.
    pub async fn provider(&self, name: &str, delay: Duration) -> Arc<dyn Connection> {
        let reply = name.to_string();
        self.local.bind(
            name,
            handler_fn(move |_p: Payload| {
                let reply = reply.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(Payload::data(reply))
                }
            }),
        );
        self.local
            .open(&TransportUri::parse(&format!("local://{name}")).unwrap())
            .await
            .unwrap()
    }

    /// Provider connected to `broker` and serving `calc()`.
    pub async fn serve(&self, broker: &Arc<Broker>, name: &str, delay: Duration) -> Arc<dyn Connection> {
        let conn = self.provider(name, delay).await;
        broker
            .on_connect(
                SetupPayload {
                    app: AppMetadata::new(name, "10.0.0.1"),
                    services: vec![calc()],
                },
                Arc::clone(&conn),
            )
            .await
            .unwrap();
        conn
    }
}

pub fn reply_of(payload: &Payload) -> String {
    String::from_utf8(payload.data.to_vec()).unwrap()
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 1s");
}
