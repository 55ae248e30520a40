//! Shared worker pool with per-transaction admission control.
//!
//! N workers pull from one queue. A worker that pulls a task for a
//! transaction another worker is already running parks the task behind it;
//! the running worker drains that backlog before going back to the queue.
//! Pulling and admission happen under the same lock, so tasks of one
//! transaction keep their submission order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use courier_core::TransactionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::task::{DeliveryTask, Lane};

type InFlight = Arc<Mutex<HashMap<TransactionId, VecDeque<DeliveryTask>>>>;

#[derive(Debug)]
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::UnboundedSender<DeliveryTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    in_flight: InFlight,
    workers: usize,
}

impl WorkerPool {
    /// Spawns `workers` workers. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, rx.clone(), in_flight.clone())))
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            in_flight,
            workers,
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn submit(&self, task: DeliveryTask) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                    drop(task);
                }
            }
            None => debug!(lane = ?task.lane(), "worker pool stopped, task dropped"),
        }
    }

    /// Transactions currently being run by some worker.
    #[must_use]
    pub fn running(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Closes the queue and waits for queued and parked tasks.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        // Parked tasks left behind by a worker that died are aborted outside
        // the lock.
        let leftover: Vec<DeliveryTask> = self
            .in_flight
            .lock()
            .drain()
            .flat_map(|(_, backlog)| backlog)
            .collect();
        drop(leftover);
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DeliveryTask>>>,
    in_flight: InFlight,
) {
    loop {
        let admitted = {
            let mut rx = rx.lock().await;
            let Some(task) = rx.recv().await else { break };
            match task.lane() {
                Lane::General => Some(task),
                Lane::Transaction(id) => {
                    let mut running = in_flight.lock();
                    if let Some(backlog) = running.get_mut(&id) {
                        backlog.push_back(task);
                        None
                    } else {
                        running.insert(id, VecDeque::new());
                        Some(task)
                    }
                }
            }
        };

        let Some(task) = admitted else { continue };
        let lane = task.lane();
        task.run().await;

        if let Lane::Transaction(id) = lane {
            loop {
                let next = {
                    let mut running = in_flight.lock();
                    let next = running.get_mut(&id).and_then(VecDeque::pop_front);
                    if next.is_none() {
                        running.remove(&id);
                    }
                    next
                };
                match next {
                    Some(task) => {
                        task.run().await;
                    }
                    None => break,
                }
            }
        }
    }
    debug!(worker = index, "pool worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::execution::task::testing::CountingOwner;
    use crate::transaction::Signal;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_transaction_never_runs_concurrently() {
        let pool = WorkerPool::start(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let active: Arc<Vec<AtomicUsize>> = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
        let overlaps = Arc::new(AtomicUsize::new(0));

        for seq in 0..15usize {
            for id in 0..3usize {
                let log = log.clone();
                let active = active.clone();
                let overlaps = overlaps.clone();
                pool.submit(DeliveryTask::new(
                    Lane::Transaction(TransactionId(id as u64)),
                    "test",
                    CountingOwner::new(),
                    async move {
                        if active[id].fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        log.lock().push((id, seq));
                        active[id].fetch_sub(1, Ordering::SeqCst);
                        Signal::Continuing
                    },
                ));
            }
        }
        pool.shutdown().await;

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let log = log.lock();
        assert_eq!(log.len(), 45);
        for id in 0..3 {
            let order: Vec<usize> = log.iter().filter(|(t, _)| *t == id).map(|(_, s)| *s).collect();
            assert_eq!(order, (0..15).collect::<Vec<_>>());
        }
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_transactions_run_in_parallel() {
        let pool = WorkerPool::start(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        for id in 0..2u64 {
            let peak = peak.clone();
            let active = active.clone();
            pool.submit(DeliveryTask::new(
                Lane::Transaction(TransactionId(id)),
                "test",
                CountingOwner::new(),
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Signal::Completed
                },
            ));
        }
        pool.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn submit_after_shutdown_aborts() {
        let pool = WorkerPool::start(1);
        pool.shutdown().await;
        let owner = CountingOwner::new();
        pool.submit(DeliveryTask::new(Lane::General, "late", owner.clone(), async {
            Signal::Completed
        }));
        assert_eq!(owner.aborted.load(Ordering::SeqCst), 1);
    }
}
