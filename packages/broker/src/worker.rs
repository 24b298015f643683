//! Periodic maintenance loop shared by the upstream refresher and gossip.
//!
//! A `BackgroundWorker<R>` owns one tokio task. The task reacts to explicit
//! commands sent through [`BackgroundWorker::submit`] and calls
//! [`Periodic::on_tick`] on a fixed interval until stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Periodic trait
// ---------------------------------------------------------------------------

/// Work driven by a [`BackgroundWorker`].
#[async_trait]
pub trait Periodic: Send + 'static {
    /// On-demand command type (e.g. "refresh now").
    type Command: Send + 'static;

    async fn handle(&mut self, command: Self::Command);

    /// Called once per interval.
    async fn on_tick(&mut self);

    /// Called once after the loop exits.
    async fn on_stop(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: Periodic> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Command>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: Periodic> BackgroundWorker<R> {
    /// Spawns the loop. The first tick fires one full `interval` after start.
    #[must_use]
    pub fn start(name: &'static str, mut runnable: R, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Command>(COMMAND_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(c) => runnable.handle(c).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut stop_rx => break,
                }
            }

            runnable.on_stop().await;
            tracing::debug!(worker = name, "background worker stopped");
        });

        tracing::debug!(worker = name, interval_ms = period.as_millis(), "background worker started");
        Self {
            name,
            tx: Some(tx),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queues a command for the loop.
    ///
    /// # Errors
    ///
    /// Fails once the worker has been stopped.
    pub async fn submit(&self, command: R::Command) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker {} is not running", self.name);
        };
        tx.send(command)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} channel closed", self.name))
    }

    /// Stops the loop and waits for `on_stop` to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<R: Periodic> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
