//! Delivers messages arriving on a shared endpoint to the attached bindings.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{
    CourierError, Message, MessageHeader, MessageReceiver, Role, RoutingKey, StandardError,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::routes;

type Slot = (Role, RoutingKey);

/// Routes inbound messages by `(role, routing key)`.
///
/// The role comes from the shared decision table. A broker-bound message with
/// no broker attached falls back to a provider for the same key, which then
/// acts as a private broker.
pub struct Dispatcher {
    endpoint: String,
    bindings: Mutex<HashMap<Slot, Arc<dyn MessageReceiver>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots: Vec<Slot> = self.bindings.lock().keys().copied().collect();
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.endpoint)
            .field("bindings", &slots)
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a binding's receiver under `(role, key)`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::DuplicateBinding` if another binding of the same
    /// role already serves `key` on this endpoint.
    pub fn attach(
        &self,
        role: Role,
        key: RoutingKey,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), CourierError> {
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&(role, key)) {
            return Err(CourierError::DuplicateBinding {
                role,
                key,
                endpoint: self.endpoint.clone(),
            });
        }
        bindings.insert((role, key), receiver);
        debug!(endpoint = %self.endpoint, %role, %key, "binding attached");
        Ok(())
    }

    /// Detaches `(role, key)`. Returns whether it was attached.
    pub fn detach(&self, role: Role, key: RoutingKey) -> bool {
        let removed = self.bindings.lock().remove(&(role, key)).is_some();
        if removed {
            debug!(endpoint = %self.endpoint, %role, %key, "binding detached");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, role: Role, key: RoutingKey) -> bool {
        self.bindings.lock().contains_key(&(role, key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    fn lookup(&self, role: Role, key: RoutingKey) -> Option<Arc<dyn MessageReceiver>> {
        let bindings = self.bindings.lock();
        bindings.get(&(role, key)).cloned().or_else(|| {
            if role == Role::Broker {
                bindings.get(&(Role::Provider, key)).cloned()
            } else {
                None
            }
        })
    }
}

impl MessageReceiver for Dispatcher {
    fn on_message(&self, message: Message) {
        let header = &message.header;
        let Some(role) = routes::shared().inbound(header) else {
            warn!(
                endpoint = %self.endpoint,
                interaction = %header.interaction_type,
                stage = header.stage,
                "message with unknown stage dropped"
            );
            return;
        };
        match self.lookup(role, header.service) {
            Some(receiver) => receiver.on_message(message),
            None => warn!(
                endpoint = %self.endpoint,
                %role,
                key = %header.service,
                transaction_id = %header.transaction_id,
                "no binding for routing key, message dropped"
            ),
        }
    }

    fn on_transmit_error(&self, header: MessageHeader, error: StandardError) {
        let target = routes::shared()
            .transmit_error(&header)
            .and_then(|role| self.lookup(role, header.service));
        match target {
            Some(receiver) => receiver.on_transmit_error(header, error),
            None => warn!(
                endpoint = %self.endpoint,
                key = %header.service,
                transaction_id = %header.transaction_id,
                %error,
                "no binding for transmit error, dropped"
            ),
        }
    }
}
