//! State shared by every binding role: endpoint, counters, lifecycle.
//!
//! Closing runs in phases:
//!
//! 1. stop inbound delivery (detach from the dispatcher for a shared
//!    endpoint, stop the endpoint's delivery for an exclusive one)
//! 2. wait, polling, until no admitted delivery is pending
//! 3. release the endpoint
//! 4. drop the binding from its manager
//!
//! The role types run the phases and add their own work between 2 and 3.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use courier_core::{
    AccessControl, CourierError, Message, Role, RoutingKey, TransportEndpoint, Uri,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::ManagerCore;
use crate::dispatch::SharedEndpoints;
use crate::execution::DeliveryTask;
use crate::interaction::OwnerId;

/// Identifier of a binding, unique within its manager's registry.
pub type BindingId = OwnerId;

/// Lifecycle state a binding moves through once.
///
/// State machine: Open -> Draining -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Open,
    /// Inbound delivery stopped, pending deliveries still running.
    Draining,
    Closed,
}

/// Snapshot of a binding's message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingStats {
    pub sent: u64,
    pub received: u64,
    /// Deliveries accepted but not yet finished.
    pub pending: u64,
}

/// How a binding holds its endpoint.
pub(crate) enum Attachment {
    Exclusive,
    Shared {
        name: String,
        endpoints: Arc<SharedEndpoints>,
    },
}

pub(crate) struct BindingCore {
    id: BindingId,
    role: Role,
    key: RoutingKey,
    endpoint: Arc<dyn TransportEndpoint>,
    attachment: Attachment,
    access: Arc<dyn AccessControl>,
    manager: Weak<ManagerCore>,
    sent: AtomicU64,
    received: AtomicU64,
    pending: AtomicU64,
    state: ArcSwap<BindingState>,
    /// Held while admitting a delivery and while leaving Open, so a drain
    /// never starts between the state check and the pending count.
    gate: Mutex<()>,
    close_poll_interval: Duration,
    drain_warn_after: Duration,
}

impl BindingCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: BindingId,
        role: Role,
        key: RoutingKey,
        endpoint: Arc<dyn TransportEndpoint>,
        attachment: Attachment,
        access: Arc<dyn AccessControl>,
        manager: Weak<ManagerCore>,
        close_poll_interval: Duration,
        drain_warn_after: Duration,
    ) -> Self {
        Self {
            id,
            role,
            key,
            endpoint,
            attachment,
            access,
            manager,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            state: ArcSwap::from_pointee(BindingState::Open),
            gate: Mutex::new(()),
            close_poll_interval,
            drain_warn_after,
        }
    }

    pub(crate) fn id(&self) -> BindingId {
        self.id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn key(&self) -> RoutingKey {
        self.key
    }

    pub(crate) fn uri(&self) -> &Uri {
        self.endpoint.uri()
    }

    pub(crate) fn state(&self) -> BindingState {
        **self.state.load()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == BindingState::Open
    }

    pub(crate) fn stats(&self) -> BindingStats {
        BindingStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), CourierError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CourierError::Closed("binding"))
        }
    }

    /// Runs `message` through access control and hands it to the endpoint.
    ///
    /// Replies of a draining binding are still sent so pending deliveries
    /// can finish their exchanges.
    pub(crate) async fn send(&self, message: Message) -> Result<(), CourierError> {
        if self.state() == BindingState::Closed {
            return Err(CourierError::Closed("binding"));
        }
        let message = self.access.check(message)?;
        self.endpoint.send(message).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_messages_sent_total", "role" => self.role.as_str()).increment(1);
        Ok(())
    }

    /// Counts an inbound message and builds its delivery task, which is
    /// pending from then on. Returns `None` once the binding stopped
    /// accepting deliveries; the message must then be dropped.
    pub(crate) fn admit(&self, build: impl FnOnce() -> DeliveryTask) -> Option<DeliveryTask> {
        let _gate = self.gate.lock();
        if !self.is_open() {
            return None;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_messages_received_total", "role" => self.role.as_str())
            .increment(1);
        Some(build())
    }

    /// Access check of an inbound message before it reaches an interaction.
    pub(crate) fn check_inbound(&self, message: Message) -> Result<Message, CourierError> {
        self.access.check(message)
    }

    pub(crate) fn delivery_accepted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn delivery_done(&self) {
        // Saturate: a task built before a counter reset must not wrap.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    // ------------------------------------------------------------------
    // Close phases
    // ------------------------------------------------------------------

    /// Moves Open -> Draining. Returns `false` if a close already started.
    pub(crate) fn begin_close(&self) -> bool {
        let _gate = self.gate.lock();
        let previous = self.state.rcu(|current| {
            if **current == BindingState::Open {
                Arc::new(BindingState::Draining)
            } else {
                Arc::clone(current)
            }
        });
        if *previous != BindingState::Open {
            return false;
        }
        debug!(binding = self.id, role = %self.role, key = %self.key, "binding draining");
        true
    }

    /// Phase 1.
    pub(crate) async fn stop_inbound(&self) {
        match &self.attachment {
            Attachment::Exclusive => self.endpoint.stop_delivery(),
            Attachment::Shared { name, endpoints } => {
                endpoints.detach(name, self.role, self.key).await;
            }
        }
    }

    /// Phase 2. Polls the pending counter until it reaches zero.
    pub(crate) async fn drain(&self) {
        let started = Instant::now();
        let mut warned = false;
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if pending == 0 {
                return;
            }
            if !warned && started.elapsed() >= self.drain_warn_after {
                warn!(
                    binding = self.id,
                    role = %self.role,
                    pending,
                    "binding close still waiting for pending deliveries"
                );
                warned = true;
            }
            tokio::time::sleep(self.close_poll_interval).await;
        }
    }

    /// Phase 3. Errors are logged and suppressed.
    pub(crate) async fn release_endpoint(&self) {
        match &self.attachment {
            Attachment::Exclusive => {
                if let Err(e) = self.endpoint.close().await {
                    warn!(binding = self.id, uri = %self.uri(), error = %e, "error closing endpoint");
                }
            }
            Attachment::Shared { name, endpoints } => endpoints.release(name).await,
        }
    }

    /// Phase 4, after which the binding is Closed.
    pub(crate) fn finish_close(&self) {
        self.state.store(Arc::new(BindingState::Closed));
        if let Some(manager) = self.manager.upgrade() {
            manager.forget(self.id);
        }
        info!(binding = self.id, role = %self.role, key = %self.key, "binding closed");
    }
}

impl std::fmt::Debug for BindingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingCore")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("key", &self.key)
            .field("uri", self.uri())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
