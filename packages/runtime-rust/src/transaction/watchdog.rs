//! Timeout watchdog.
//!
//! Each tick collects the interactions that have been silent for longer than
//! the transaction timeout and schedules an expiry task for each on the
//! transaction's own execution lane. The task re-checks staleness before
//! failing the interaction, so it cannot race a legitimate message that was
//! queued on the same lane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::TransactionId;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::registry::TransactionRegistry;
use crate::execution::{BackgroundRunnable, BackgroundWorker, DeliveryTask, ExecutionModel, Lane, TaskOwner};

#[derive(Debug)]
pub enum WatchdogJob {
    /// Sweep immediately instead of waiting for the next tick.
    SweepNow,
}

struct SweepOwner {
    registry: Arc<TransactionRegistry>,
}

impl TaskOwner for SweepOwner {
    fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    fn abort(&self, lane: Lane) {
        // Registry close already failed every interaction.
        trace!(?lane, "expiry task dropped");
    }
}

/// Builds the task that times out `id` if it is still stale when it runs.
pub(crate) fn expire_task(
    registry: &Arc<TransactionRegistry>,
    id: TransactionId,
    timeout: Duration,
) -> DeliveryTask {
    let owner = Arc::new(SweepOwner {
        registry: registry.clone(),
    });
    let registry = registry.clone();
    DeliveryTask::new(Lane::Transaction(id), "expire", owner, async move {
        registry.expire_if_stale(id, Instant::now(), timeout)
    })
}

struct TimeoutSweep {
    registry: Arc<TransactionRegistry>,
    executor: Arc<ExecutionModel>,
    timeout: Duration,
}

impl TimeoutSweep {
    fn sweep(&self) {
        if self.registry.is_closed() {
            return;
        }
        let stale = self.registry.stale(Instant::now(), self.timeout);
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "scheduling expiry of stale transactions");
        for id in stale {
            self.executor.submit(expire_task(&self.registry, id, self.timeout));
        }
    }
}

#[async_trait]
impl BackgroundRunnable for TimeoutSweep {
    type Job = WatchdogJob;

    async fn run(&mut self, job: WatchdogJob) {
        match job {
            WatchdogJob::SweepNow => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

/// Periodic timeout sweep over one registry.
pub struct Watchdog {
    worker: BackgroundWorker<TimeoutSweep>,
}

impl Watchdog {
    /// Starts sweeping every `period`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(
        registry: Arc<TransactionRegistry>,
        executor: Arc<ExecutionModel>,
        timeout: Duration,
        period: Duration,
    ) -> Self {
        let sweep = TimeoutSweep {
            registry,
            executor,
            timeout,
        };
        Self {
            worker: BackgroundWorker::start(sweep, period),
        }
    }

    /// Requests an immediate sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog was stopped.
    pub async fn sweep_now(&self) -> anyhow::Result<()> {
        self.worker.submit(WatchdogJob::SweepNow).await
    }

    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("running", &self.worker.is_running())
            .finish()
    }
}
