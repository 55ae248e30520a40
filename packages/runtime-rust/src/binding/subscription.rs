//! Consumer-side table of live subscriptions.
//!
//! A NOTIFY body starts with the subscription id, which selects the
//! listener. A NOTIFY error carries no id and goes to every subscription
//! registered by the same register exchange.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{InteractionListener, Message, SubscriptionId, TransactionId};
use parking_lot::RwLock;
use tracing::debug;

struct Entry {
    listener: Arc<dyn InteractionListener>,
    transaction_id: TransactionId,
}

#[derive(Default)]
pub(crate) struct SubscriptionManager {
    entries: RwLock<HashMap<SubscriptionId, Entry>>,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry of `id`.
    pub(crate) fn insert(
        &self,
        id: SubscriptionId,
        listener: Arc<dyn InteractionListener>,
        transaction_id: TransactionId,
    ) {
        self.entries.write().insert(
            id,
            Entry {
                listener,
                transaction_id,
            },
        );
    }

    /// Removes the entry of `id` only if it still belongs to the register
    /// exchange `transaction_id`.
    pub(crate) fn remove_if(&self, id: &str, transaction_id: TransactionId) {
        let mut entries = self.entries.write();
        if entries.get(id).is_some_and(|e| e.transaction_id == transaction_id) {
            entries.remove(id);
        }
    }

    pub(crate) fn remove_all(&self, ids: &[SubscriptionId]) {
        let mut entries = self.entries.write();
        for id in ids {
            entries.remove(id);
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Hands a NOTIFY message to its listener. Returns whether one was found.
    pub(crate) fn deliver(&self, message: &Message) -> bool {
        if message.header.is_error {
            return self.deliver_error(message);
        }
        let Some(id) = message.body.leading_str() else {
            debug!(
                transaction_id = %message.header.transaction_id,
                "notify without subscription id dropped"
            );
            return false;
        };
        // Clone out so the listener runs without the table lock.
        let listener = self.entries.read().get(id).map(|e| e.listener.clone());
        match listener {
            Some(listener) => {
                listener.notify_received(id, message);
                true
            }
            None => {
                debug!(subscription = id, "notify for unknown subscription dropped");
                false
            }
        }
    }

    fn deliver_error(&self, message: &Message) -> bool {
        let transaction_id = message.header.transaction_id;
        let listeners: Vec<Arc<dyn InteractionListener>> = self
            .entries
            .read()
            .values()
            .filter(|e| e.transaction_id == transaction_id)
            .map(|e| e.listener.clone())
            .collect();
        let error = message.error_body();
        for listener in &listeners {
            listener.notify_error_received(&message.header, &error);
        }
        !listeners.is_empty()
    }
}
