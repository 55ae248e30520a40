//! Transaction registry: id allocation and the table of live interactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{CourierError, Message, TransactionId};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::interaction::{Failure, Interaction, OwnerId, Step};

/// Result of feeding a message or failure into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// No interaction is registered under the transaction id.
    Unknown,
    /// The interaction accepted the input and keeps running.
    Continuing,
    /// The interaction finished and was removed; per-transaction bookkeeping
    /// can be released.
    Completed,
}

/// Told about every transaction the registry stops tracking.
pub trait CompletionSink: Send + Sync + std::fmt::Debug {
    fn transaction_completed(&self, id: TransactionId);
}

/// Allocates transaction ids and owns every live interaction.
///
/// The table is guarded by a single lock which is never held while an
/// interaction emits events. An interaction that finishes is removed from
/// the table before its listener sees the final event.
#[derive(Debug)]
pub struct TransactionRegistry {
    next_id: AtomicU64,
    closed: AtomicBool,
    table: Mutex<HashMap<TransactionId, Arc<Interaction>>>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl TransactionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            table: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Creates an empty registry that reports every removed transaction to
    /// `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Returns a fresh, never-issued transaction id.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Closed` once the registry is closing.
    pub fn new_transaction_id(&self) -> Result<TransactionId, CourierError> {
        if self.is_closed() {
            return Err(CourierError::Closed("transaction registry"));
        }
        Ok(TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Makes sure ids handed out later never collide with `id`, which was
    /// issued elsewhere (e.g. by a previous run of the process).
    pub fn reserve(&self, id: TransactionId) {
        self.next_id.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }

    /// Stores an interaction under its transaction id.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::AlreadyRunning` if the id is taken, and
    /// `CourierError::Closed` if the registry is closing.
    pub fn register(&self, interaction: Arc<Interaction>) -> Result<(), CourierError> {
        let id = interaction.transaction_id();
        let mut table = self.table.lock();
        // Checked under the table lock so close() cannot miss the entry.
        if self.is_closed() {
            return Err(CourierError::Closed("transaction registry"));
        }
        if table.contains_key(&id) {
            return Err(CourierError::AlreadyRunning(id));
        }
        table.insert(id, interaction);
        Ok(())
    }

    /// Drops an interaction without notifying it.
    pub fn remove(&self, id: TransactionId) -> Option<Arc<Interaction>> {
        let removed = self.table.lock().remove(&id);
        if removed.is_some() {
            self.completed(id);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: TransactionId) -> Option<Arc<Interaction>> {
        self.table.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: TransactionId) -> bool {
        self.table.lock().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Feeds an inbound message to the interaction of its transaction.
    ///
    /// Messages for unknown transactions are logged and dropped: the exchange
    /// may already have completed or been abandoned.
    pub fn signal(&self, message: Message) -> Signal {
        let id = message.header.transaction_id;
        let Some(interaction) = self.get(id) else {
            debug!(
                transaction_id = %id,
                stage = message.header.stage,
                "no interaction for inbound message, dropped"
            );
            return Signal::Unknown;
        };
        let outcome = interaction.apply_message(message);
        let signal = self.settle(id, &interaction, outcome.step());
        outcome.deliver();
        signal
    }

    /// Ends the interaction of `id` with a synthetic failure.
    pub fn fail(&self, id: TransactionId, failure: &Failure) -> Signal {
        let Some(interaction) = self.get(id) else {
            return Signal::Unknown;
        };
        let outcome = interaction.apply_failure(failure);
        let signal = self.settle(id, &interaction, outcome.step());
        outcome.deliver();
        signal
    }

    /// Fails `id` with a timeout if it is still silent for longer than
    /// `timeout` at `now`. Re-checked here because a legitimate message may
    /// have arrived after the interaction was found stale.
    pub fn expire_if_stale(&self, id: TransactionId, now: Instant, timeout: Duration) -> Signal {
        let Some(interaction) = self.get(id) else {
            return Signal::Unknown;
        };
        if !interaction.is_stale(now, timeout) {
            return Signal::Continuing;
        }
        info!(transaction_id = %id, kind = interaction.kind().as_str(), "transaction timed out");
        let outcome = interaction.apply_failure(&Failure::Timeout);
        let signal = self.settle(id, &interaction, outcome.step());
        outcome.deliver();
        signal
    }

    /// Transaction ids of the interactions silent for longer than `timeout`.
    #[must_use]
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<TransactionId> {
        let table = self.table.lock();
        table
            .iter()
            .filter(|(_, interaction)| interaction.is_stale(now, timeout))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Removes and times out every stale interaction. Returns the ids that
    /// were expired.
    pub fn timeout_sweep(&self, now: Instant, timeout: Duration) -> Vec<TransactionId> {
        let mut expired = Vec::new();
        for id in self.stale(now, timeout) {
            if self.expire_if_stale(id, now, timeout) == Signal::Completed {
                expired.push(id);
            }
        }
        expired
    }

    /// Fails and removes every interaction owned by `owner` with a closed
    /// error. Returns how many were ended.
    pub fn close_owned(&self, owner: OwnerId) -> usize {
        let owned: Vec<Arc<Interaction>> = {
            let mut table = self.table.lock();
            let ids: Vec<TransactionId> = table
                .iter()
                .filter(|(_, i)| i.owner() == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for interaction in &owned {
            self.completed(interaction.transaction_id());
            interaction.fail(&Failure::Closed);
        }
        owned.len()
    }

    /// Marks the registry closed, then completes every outstanding
    /// interaction with a closed error and clears the table.
    pub fn close(&self) {
        let drained: Vec<Arc<Interaction>> = {
            let mut table = self.table.lock();
            self.closed.store(true, Ordering::Release);
            table.drain().map(|(_, interaction)| interaction).collect()
        };
        if !drained.is_empty() {
            info!(outstanding = drained.len(), "closing registry with outstanding interactions");
        }
        for interaction in drained {
            self.completed(interaction.transaction_id());
            interaction.fail(&Failure::Closed);
        }
    }

    fn settle(&self, id: TransactionId, interaction: &Arc<Interaction>, step: Step) -> Signal {
        match step {
            Step::Continuing => Signal::Continuing,
            Step::Completed | Step::Ignored => {
                let removed = {
                    let mut table = self.table.lock();
                    // Only remove the entry we fed; a newer interaction may
                    // have been registered under the same id meanwhile.
                    let ours = table
                        .get(&id)
                        .is_some_and(|current| Arc::ptr_eq(current, interaction));
                    ours && table.remove(&id).is_some()
                };
                if removed {
                    self.completed(id);
                }
                if step == Step::Completed {
                    Signal::Completed
                } else {
                    Signal::Unknown
                }
            }
        }
    }

    fn completed(&self, id: TransactionId) {
        if let Some(sink) = &self.sink {
            sink.transaction_completed(id);
        }
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
