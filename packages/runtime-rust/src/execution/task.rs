//! Delivery tasks: one unit of inbound work plus the binding it belongs to.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::{stage, InteractionType, MessageHeader, TransactionId};
use tracing::{debug, error, warn};

use crate::transaction::Signal;

/// Work of a task. Built lazily: nothing runs until an executor polls it.
pub type TaskFuture = Pin<Box<dyn Future<Output = Signal> + Send + 'static>>;

/// Ordering domain of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Runs after every earlier task of the same transaction, never
    /// concurrently with one.
    Transaction(TransactionId),
    /// No ordering requirement.
    General,
}

impl Lane {
    /// Lane of an inbound message: its transaction, except for publish
    /// acknowledgements, which carry no ordering requirement.
    #[must_use]
    pub fn of(header: &MessageHeader) -> Self {
        let publish_ack = header.interaction_type == InteractionType::PubSub
            && matches!(
                header.stage,
                stage::PUBLISH_REGISTER_ACK | stage::PUBLISH_DEREGISTER_ACK
            );
        if publish_ack {
            Self::General
        } else {
            Self::Transaction(header.transaction_id)
        }
    }
}

/// The binding side of a task.
pub trait TaskOwner: Send + Sync + 'static {
    /// Tasks of a closed owner are aborted instead of run.
    fn is_closed(&self) -> bool;

    /// Drives the delivery-error path for a task that will never run.
    fn abort(&self, lane: Lane);

    /// Called once per task when it is created.
    fn delivery_accepted(&self) {}

    /// Called once per task after it ran, was aborted, or was dropped.
    fn delivery_done(&self) {}
}

/// One queued delivery. Dropping a task that never ran aborts it.
pub struct DeliveryTask {
    lane: Lane,
    label: &'static str,
    owner: Arc<dyn TaskOwner>,
    work: Option<TaskFuture>,
}

impl std::fmt::Debug for DeliveryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTask")
            .field("lane", &self.lane)
            .field("label", &self.label)
            .field("pending", &self.work.is_some())
            .finish()
    }
}

impl DeliveryTask {
    pub fn new(
        lane: Lane,
        label: &'static str,
        owner: Arc<dyn TaskOwner>,
        work: impl Future<Output = Signal> + Send + 'static,
    ) -> Self {
        owner.delivery_accepted();
        Self {
            lane,
            label,
            owner,
            work: Some(Box::pin(work)),
        }
    }

    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Runs the task to completion on its own tokio task so a panic is
    /// contained. A task whose owner closed meanwhile is aborted.
    pub async fn run(mut self) -> Signal {
        if self.owner.is_closed() {
            warn!(lane = ?self.lane, task = self.label, "binding closed, delivery aborted");
            // Drop aborts.
            return Signal::Completed;
        }
        let Some(work) = self.work.take() else {
            return Signal::Completed;
        };
        match tokio::spawn(work).await {
            Ok(signal) => signal,
            Err(e) if e.is_panic() => {
                error!(lane = ?self.lane, task = self.label, "delivery task panicked");
                Signal::Continuing
            }
            Err(e) => {
                debug!(lane = ?self.lane, task = self.label, error = %e, "delivery task cancelled");
                Signal::Continuing
            }
        }
    }
}

impl Drop for DeliveryTask {
    fn drop(&mut self) {
        if self.work.take().is_some() {
            self.owner.abort(self.lane);
        }
        self.owner.delivery_done();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Owner that counts lifecycle calls.
    #[derive(Default)]
    pub struct CountingOwner {
        pub closed: AtomicBool,
        pub accepted: AtomicUsize,
        pub done: AtomicUsize,
        pub aborted: AtomicUsize,
    }

    impl CountingOwner {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn pending(&self) -> usize {
            self.accepted.load(Ordering::SeqCst) - self.done.load(Ordering::SeqCst)
        }
    }

    impl TaskOwner for CountingOwner {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn abort(&self, _lane: Lane) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        fn delivery_accepted(&self) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
        fn delivery_done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }
}
