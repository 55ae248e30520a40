//! Periodic background worker.
//!
//! A `BackgroundWorker<R>` owns one tokio task that feeds on-demand jobs to a
//! `BackgroundRunnable` and calls its tick hook at a fixed period. The timeout
//! watchdog is built on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Job: Send + 'static;

    async fn run(&mut self, job: Self::Job);

    /// Called once per tick period. The first tick fires one full period
    /// after start.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Job>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. Must be called inside a tokio runtime.
    pub fn start(mut runnable: R, period: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Job>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => runnable.run(job).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues an on-demand job.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, job: R::Job) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .await
                .map_err(|_| anyhow::anyhow!("background worker channel closed")),
            None => Err(anyhow::anyhow!("background worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for the runnable's shutdown hook. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
