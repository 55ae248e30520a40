//! Execution models for inbound deliveries.
//!
//! Both models run tasks of one transaction one at a time in submission
//! order and let different transactions run in parallel:
//!
//! - [`sticky`]: round-robin, single-lane executors keyed by transaction
//! - [`pool`]: shared worker pool with an in-flight admission check

pub mod pool;
pub mod sticky;
pub mod task;
pub mod worker;

pub use pool::WorkerPool;
pub use sticky::StickyExecutors;
pub use task::{DeliveryTask, Lane, TaskFuture, TaskOwner};
pub use worker::{BackgroundRunnable, BackgroundWorker};

use courier_core::TransactionId;

use crate::config::{ExecutionConfig, ExecutionMode};
use crate::transaction::CompletionSink;

/// The execution model of one binding manager.
#[derive(Debug)]
pub enum ExecutionModel {
    Sticky(StickyExecutors),
    Pool(WorkerPool),
}

impl ExecutionModel {
    /// Starts the model described by `config`. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn start(config: &ExecutionConfig) -> Self {
        match config.mode {
            ExecutionMode::Sticky { executors } => Self::Sticky(StickyExecutors::start(executors)),
            ExecutionMode::Pool { workers } => Self::Pool(WorkerPool::start(workers)),
        }
    }

    pub fn submit(&self, task: DeliveryTask) {
        match self {
            Self::Sticky(executors) => executors.submit(task),
            Self::Pool(pool) => pool.submit(task),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Sticky(executors) => ExecutionMode::Sticky {
                executors: executors.lanes(),
            },
            Self::Pool(pool) => ExecutionMode::Pool {
                workers: pool.workers(),
            },
        }
    }

    /// Stops accepting tasks and waits for the queued ones.
    pub async fn shutdown(&self) {
        match self {
            Self::Sticky(executors) => executors.shutdown().await,
            Self::Pool(pool) => pool.shutdown().await,
        }
    }
}

impl CompletionSink for ExecutionModel {
    fn transaction_completed(&self, id: TransactionId) {
        match self {
            Self::Sticky(executors) => executors.complete(id),
            // Workers keep no per-transaction state past a task.
            Self::Pool(_) => {}
        }
    }
}
