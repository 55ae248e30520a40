//! Round-robin sticky executors.
//!
//! A fixed array of single-lane executors, each a tokio task draining its own
//! queue in order. A transaction is assigned a lane on first use and keeps it
//! until its last queued task finished after the transaction completed,
//! either through a task's own signal or through the registry's completion
//! report. General-lane tasks never take an assignment and run directly on
//! the runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use courier_core::TransactionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::task::{DeliveryTask, Lane};
use crate::transaction::Signal;

#[derive(Debug, Clone, Copy)]
struct Assignment {
    lane: usize,
    queued: usize,
    finished: bool,
}

#[derive(Debug)]
struct Assignments {
    map: DashMap<TransactionId, Assignment>,
    next: AtomicUsize,
    /// Running total of assignments made per lane.
    issued: Vec<AtomicUsize>,
}

impl Assignments {
    fn new(lanes: usize) -> Self {
        Self {
            map: DashMap::new(),
            next: AtomicUsize::new(0),
            issued: (0..lanes).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn acquire(&self, id: TransactionId) -> usize {
        let mut entry = self.map.entry(id).or_insert_with(|| {
            let lane = self.next.fetch_add(1, Ordering::Relaxed) % self.issued.len();
            self.issued[lane].fetch_add(1, Ordering::Relaxed);
            Assignment {
                lane,
                queued: 0,
                finished: false,
            }
        });
        entry.queued += 1;
        entry.lane
    }

    fn release(&self, id: TransactionId, signal: Signal) {
        let done = signal != Signal::Continuing;
        self.map.remove_if_mut(&id, |_, a| {
            a.queued = a.queued.saturating_sub(1);
            a.finished |= done;
            a.finished && a.queued == 0
        });
    }

    /// The transaction ended outside its lane. Dropped now if nothing is
    /// queued, otherwise once the queue empties.
    fn complete(&self, id: TransactionId) {
        self.map.remove_if_mut(&id, |_, a| {
            a.finished = true;
            a.queued == 0
        });
    }
}

#[derive(Debug)]
pub struct StickyExecutors {
    senders: Mutex<Vec<mpsc::UnboundedSender<DeliveryTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    assignments: Arc<Assignments>,
    lanes: usize,
}

impl StickyExecutors {
    /// Spawns `lanes` executors. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(lanes: usize) -> Self {
        let lanes = lanes.max(1);
        let assignments = Arc::new(Assignments::new(lanes));
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);
        for index in 0..lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(lane_loop(index, rx, assignments.clone())));
        }
        Self {
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
            assignments,
            lanes,
        }
    }

    #[must_use]
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn submit(&self, task: DeliveryTask) {
        match task.lane() {
            Lane::General => {
                tokio::spawn(task.run());
            }
            Lane::Transaction(id) => {
                let senders = self.senders.lock();
                if senders.is_empty() {
                    debug!(transaction_id = %id, "executors stopped, task dropped");
                    return;
                }
                let lane = self.assignments.acquire(id);
                if let Err(mpsc::error::SendError(task)) = senders[lane].send(task) {
                    self.assignments.release(id, Signal::Completed);
                    drop(task);
                }
            }
        }
    }

    /// Releases the assignment of a transaction that completed.
    pub fn complete(&self, id: TransactionId) {
        self.assignments.complete(id);
    }

    /// Lane currently assigned to `id`.
    #[must_use]
    pub fn assigned_lane(&self, id: TransactionId) -> Option<usize> {
        self.assignments.map.get(&id).map(|a| a.lane)
    }

    /// Number of transactions holding an assignment.
    #[must_use]
    pub fn assigned(&self) -> usize {
        self.assignments.map.len()
    }

    /// Assignments made per lane since start.
    #[must_use]
    pub fn distribution(&self) -> Vec<usize> {
        self.assignments
            .issued
            .iter()
            .map(|n| n.load(Ordering::Relaxed))
            .collect()
    }

    /// Closes every lane queue and waits for already queued tasks.
    pub async fn shutdown(&self) {
        self.senders.lock().clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn lane_loop(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<DeliveryTask>,
    assignments: Arc<Assignments>,
) {
    while let Some(task) = rx.recv().await {
        let lane = task.lane();
        let signal = task.run().await;
        if let Lane::Transaction(id) = lane {
            assignments.release(id, signal);
        }
    }
    debug!(lane = index, "sticky executor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::execution::task::testing::CountingOwner;

    fn task(id: u64, signal: Signal) -> DeliveryTask {
        DeliveryTask::new(
            Lane::Transaction(TransactionId(id)),
            "test",
            CountingOwner::new(),
            async move { signal },
        )
    }

    #[tokio::test]
    async fn same_transaction_sticks_to_one_lane() {
        let executors = StickyExecutors::start(4);
        executors.submit(task(1, Signal::Continuing));
        let lane = executors.assigned_lane(TransactionId(1));
        executors.submit(task(1, Signal::Continuing));
        assert_eq!(executors.assigned_lane(TransactionId(1)), lane);
        executors.shutdown().await;
    }

    #[tokio::test]
    async fn round_robin_distribution_is_even() {
        let lanes = 4usize;
        let k = 103u64;
        let executors = StickyExecutors::start(lanes);
        for id in 0..k {
            executors.submit(task(id, Signal::Completed));
        }
        executors.shutdown().await;

        let distribution = executors.distribution();
        assert_eq!(distribution.iter().sum::<usize>(), 103);
        let bound = 103usize.div_ceil(lanes);
        for n in distribution {
            assert!(n <= bound, "lane got {n}, bound {bound}");
            assert!(n + 1 >= bound);
        }
    }

    #[tokio::test]
    async fn general_lane_never_takes_an_assignment() {
        let executors = StickyExecutors::start(2);
        let owner = CountingOwner::new();
        for _ in 0..10 {
            executors.submit(DeliveryTask::new(Lane::General, "ack", owner.clone(), async {
                Signal::Completed
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(owner.pending(), 0);
        assert_eq!(executors.assigned(), 0);
        assert_eq!(executors.distribution(), vec![0, 0]);
        executors.shutdown().await;
    }

    #[tokio::test]
    async fn assignment_released_after_completion() {
        let executors = StickyExecutors::start(2);
        executors.submit(task(5, Signal::Continuing));
        executors.submit(task(5, Signal::Completed));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executors.assigned_lane(TransactionId(5)), None);

        executors.submit(task(6, Signal::Continuing));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executors.assigned_lane(TransactionId(6)).is_some());
        executors.shutdown().await;
    }

    #[tokio::test]
    async fn completion_report_releases_idle_assignment() {
        let executors = StickyExecutors::start(2);
        executors.submit(task(8, Signal::Continuing));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executors.assigned(), 1);

        executors.complete(TransactionId(8));
        assert_eq!(executors.assigned(), 0);
        executors.shutdown().await;
    }

    #[tokio::test]
    async fn completion_report_keeps_lane_until_queue_empties() {
        let executors = StickyExecutors::start(2);
        let gate = Arc::new(tokio::sync::Notify::new());
        let held = gate.clone();
        executors.submit(DeliveryTask::new(
            Lane::Transaction(TransactionId(9)),
            "test",
            CountingOwner::new(),
            async move {
                held.notified().await;
                Signal::Continuing
            },
        ));
        executors.complete(TransactionId(9));
        let lane = executors.assigned_lane(TransactionId(9));
        assert!(lane.is_some());

        // A late message for the same transaction still queues behind it.
        executors.submit(task(9, Signal::Unknown));
        assert_eq!(executors.assigned_lane(TransactionId(9)), lane);

        gate.notify_one();
        executors.shutdown().await;
        assert_eq!(executors.assigned(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_transaction_runs_in_submission_order() {
        let executors = StickyExecutors::start(3);
        let log = Arc::new(Mutex::new(Vec::new()));
        for seq in 0..20 {
            for id in 0..5 {
                let log = log.clone();
                executors.submit(DeliveryTask::new(
                    Lane::Transaction(TransactionId(id)),
                    "test",
                    CountingOwner::new(),
                    async move {
                        if seq % 3 == 0 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                        log.lock().push((id, seq));
                        Signal::Continuing
                    },
                ));
            }
        }
        executors.shutdown().await;

        let log = log.lock();
        assert_eq!(log.len(), 100);
        for id in 0..5 {
            let order: Vec<usize> = log.iter().filter(|(t, _)| *t == id).map(|(_, s)| *s).collect();
            assert_eq!(order, (0..20).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn submit_after_shutdown_aborts_task() {
        let executors = StickyExecutors::start(1);
        executors.shutdown().await;
        let owner = CountingOwner::new();
        executors.submit(DeliveryTask::new(
            Lane::Transaction(TransactionId(1)),
            "late",
            owner.clone(),
            async { Signal::Completed },
        ));
        assert_eq!(owner.aborted.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(owner.pending(), 0);
    }
}
