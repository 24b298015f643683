use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use meshrpc_core::{ControlEvent, EventEnvelope, EventError};
use parking_lot::RwLock;

use super::{Broadcaster, ControlEventSink};
use crate::error::MeshResult;

type Handler = Arc<dyn Fn(&EventEnvelope) -> Result<BoxFuture<'static, ()>, EventError> + Send + Sync>;

/// Typed publish/subscribe for control events.
///
/// Handlers are keyed by event type name. Dispatch decodes the envelope once
/// per handler and awaits the handlers in subscription order. Events nobody
/// subscribed to are dropped.
pub struct EventBus {
    source: String,
    handlers: DashMap<String, Vec<Handler>>,
    broadcaster: RwLock<Option<Arc<dyn Broadcaster>>>,
}

impl EventBus {
    /// `source` stamps every envelope this bus publishes.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            handlers: DashMap::new(),
            broadcaster: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fans published events out to peers from now on.
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    pub fn clear_broadcaster(&self) {
        *self.broadcaster.write() = None;
    }

    /// Registers a handler for events of type `E`.
    pub fn subscribe<E, F, Fut>(&self, on_event: F)
    where
        E: ControlEvent,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |envelope: &EventEnvelope| {
            let event = envelope.unwrap_as::<E>()?;
            Ok(on_event(event).boxed())
        });
        self.handlers.entry(E::EVENT_TYPE.to_string()).or_default().push(handler);
    }

    #[must_use]
    pub fn has_subscribers(&self, event_type: &str) -> bool {
        self.handlers.get(event_type).is_some_and(|h| !h.is_empty())
    }

    /// Delivers locally, then hands the envelope to the broadcaster if one
    /// is installed. Returns the published envelope.
    ///
    /// # Errors
    ///
    /// `Codec` if the event cannot be serialized.
    pub async fn publish<E: ControlEvent>(&self, event: &E) -> MeshResult<EventEnvelope> {
        let envelope = EventEnvelope::wrap(self.source.clone(), event)?;
        tracing::debug!(event_type = E::EVENT_TYPE, id = %envelope.id, "publishing control event");
        self.dispatch_envelope(&envelope).await;
        let broadcaster = self.broadcaster.read().clone();
        if let Some(broadcaster) = broadcaster {
            broadcaster.broadcast(&envelope).await;
        }
        Ok(envelope)
    }

    /// Runs every handler subscribed to the envelope's type. Returns how
    /// many handlers ran.
    pub async fn dispatch_envelope(&self, envelope: &EventEnvelope) -> usize {
        let handlers: Vec<Handler> = match self.handlers.get(&envelope.event_type) {
            Some(h) => h.value().clone(),
            None => {
                tracing::trace!(event_type = %envelope.event_type, "no subscriber; event dropped");
                return 0;
            }
        };
        let mut ran = 0;
        for handler in handlers {
            match handler(envelope) {
                Ok(fut) => {
                    fut.await;
                    ran += 1;
                }
                Err(err) => {
                    tracing::warn!(event_type = %envelope.event_type, source = %envelope.source, %err, "undecodable control event");
                }
            }
        }
        ran
    }
}

#[async_trait]
impl ControlEventSink for EventBus {
    async fn deliver(&self, envelope: EventEnvelope) {
        self.dispatch_envelope(&envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meshrpc_core::{CacheInvalidate, ConfigChanged};
    use parking_lot::Mutex;

    use super::*;

    fn config(key: &str) -> ConfigChanged {
        ConfigChanged {
            app_name: "calc".into(),
            key: key.into(),
            value: "1".into(),
        }
    }

    #[tokio::test]
    async fn typed_dispatch_reaches_matching_handlers_only() {
        let bus = EventBus::new("b1");
        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        bus.subscribe(move |e: ConfigChanged| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().push(e.key) }
        });

        bus.publish(&config("timeout")).await.unwrap();
        bus.publish(&CacheInvalidate { app_name: None, keys: vec![] }).await.unwrap();

        assert_eq!(*keys.lock(), vec!["timeout".to_string()]);
        assert!(bus.has_subscribers("meshrpc.events.ConfigChanged"));
        assert!(!bus.has_subscribers("meshrpc.events.CacheInvalidate"));
    }

    #[tokio::test]
    async fn unmatched_event_is_dropped() {
        let bus = EventBus::new("b1");
        let envelope = EventEnvelope::wrap("b2", &config("k")).unwrap();
        assert_eq!(bus.dispatch_envelope(&envelope).await, 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_skipped() {
        let bus = EventBus::new("b1");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(move |_e: ConfigChanged| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut envelope = EventEnvelope::wrap("b2", &config("k")).unwrap();
        envelope.data = vec![0xc1];
        assert_eq!(bus.dispatch_envelope(&envelope).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    struct Recorder(Mutex<Vec<EventEnvelope>>);

    #[async_trait]
    impl Broadcaster for Recorder {
        async fn broadcast(&self, envelope: &EventEnvelope) {
            self.0.lock().push(envelope.clone());
        }
    }

    #[tokio::test]
    async fn publish_fans_out_through_broadcaster() {
        let bus = EventBus::new("b1");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.set_broadcaster(recorder.clone());
        let envelope = bus.publish(&config("k")).await.unwrap();
        assert_eq!(envelope.source, "b1");
        assert_eq!(recorder.0.lock().as_slice(), &[envelope]);

        bus.clear_broadcaster();
        bus.publish(&config("k2")).await.unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
