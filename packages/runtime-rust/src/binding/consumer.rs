//! Consumer bindings: initiate interactions and feed their replies back.
//!
//! Every pattern comes in a blocking flavor (the future resolves at the
//! pattern's releasing stage) and a callback flavor (events go to a
//! listener). Replies are scheduled on the transaction's execution lane and
//! handed to the registry, except NOTIFY messages, which go to the
//! subscription manager.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    stage, Body, CourierError, InteractionListener, InteractionType, Message, MessageHeader,
    MessageReceiver, Operation, StandardError, Subscription, SubscriptionId, TransactionId, Uri,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::core::{BindingCore, BindingId, BindingState, BindingStats};
use super::manager::{ManagedBinding, ManagerCore};
use super::subscription::SubscriptionManager;
use crate::config::ConsumerConfig;
use crate::execution::{DeliveryTask, ExecutionModel, Lane, TaskOwner};
use crate::interaction::{Failure, Interaction, PatternKind, Waiter};
use crate::transaction::{Signal, TransactionRegistry};

pub(crate) struct ConsumerInner {
    this: Weak<ConsumerInner>,
    core: BindingCore,
    config: ConsumerConfig,
    registry: Arc<TransactionRegistry>,
    executor: Arc<ExecutionModel>,
    subscriptions: SubscriptionManager,
}

impl ConsumerInner {
    fn initiation_header(&self, op: &Operation, id: TransactionId, initial: u8) -> MessageHeader {
        MessageHeader::initiation(
            self.core.uri().clone(),
            self.config.target.clone(),
            op.interaction,
            id,
            self.config.service.key,
            op.number,
        )
        .with_stage(initial, false)
        .with_qos(self.config.qos, self.config.priority)
        .with_domain(self.config.domain.clone())
    }

    fn check_operation(&self, op: &Operation, expected: InteractionType) -> Result<(), CourierError> {
        if op.interaction != expected {
            return Err(CourierError::InvalidArgument(
                "operation does not use this interaction pattern",
            ));
        }
        if op.service != self.config.service.key {
            return Err(CourierError::InvalidArgument(
                "operation belongs to another service",
            ));
        }
        Ok(())
    }

    /// Validates `op` and allocates the transaction of a new interaction.
    fn prepare(
        &self,
        op: &Operation,
        kind: PatternKind,
    ) -> Result<(TransactionId, MessageHeader), CourierError> {
        self.check_operation(op, kind.interaction_type())?;
        self.core.ensure_open()?;
        let id = self.registry.new_transaction_id()?;
        Ok((id, self.initiation_header(op, id, kind.table().initial)))
    }

    /// Registers `interaction`, then sends its initiating message. A send
    /// that fails synchronously unregisters the interaction again.
    async fn launch(&self, interaction: Interaction, message: Message) -> Result<(), CourierError> {
        let id = interaction.transaction_id();
        self.registry.register(Arc::new(interaction))?;
        if let Err(e) = self.core.send(message).await {
            self.registry.remove(id);
            debug!(transaction_id = %id, error = %e, "initiation send failed");
            return Err(e);
        }
        Ok(())
    }

    async fn start_blocking(
        &self,
        op: &Operation,
        kind: PatternKind,
        body: Body,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<(TransactionId, Waiter), CourierError> {
        let (id, header) = self.prepare(op, kind)?;
        let (interaction, waiter) =
            Interaction::blocking(kind, header.clone(), self.core.id(), listener);
        self.launch(interaction, Message::new(header, body)).await?;
        Ok((id, waiter))
    }

    async fn start_callback(
        &self,
        op: &Operation,
        kind: PatternKind,
        body: Body,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<TransactionId, CourierError> {
        let (id, header) = self.prepare(op, kind)?;
        let interaction = Interaction::callback(kind, header.clone(), self.core.id(), listener);
        self.launch(interaction, Message::new(header, body)).await?;
        Ok(id)
    }

    /// Runs on the transaction's lane.
    fn deliver(&self, message: Message) -> Signal {
        let id = message.header.transaction_id;
        let stage = message.header.stage;
        let message = match self.core.check_inbound(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(transaction_id = %id, stage, error = %e, "inbound message rejected");
                return self.registry.fail(id, &Failure::Security(e.to_standard()));
            }
        };
        if message.header.interaction_type == InteractionType::PubSub && stage == stage::NOTIFY {
            self.subscriptions.deliver(&message);
            return Signal::Completed;
        }
        self.registry.signal(message)
    }
}

impl MessageReceiver for ConsumerInner {
    fn on_message(&self, message: Message) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let transaction_id = message.header.transaction_id;
        let lane = Lane::of(&message.header);
        let owner = this.clone();
        let task = self.core.admit(|| {
            DeliveryTask::new(lane, "consumer-deliver", owner, async move {
                this.deliver(message)
            })
        });
        match task {
            Some(task) => self.executor.submit(task),
            None => debug!(
                binding = self.core.id(),
                %transaction_id,
                "consumer not open, inbound message dropped"
            ),
        }
    }

    fn on_transmit_error(&self, header: MessageHeader, error: StandardError) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let id = header.transaction_id;
        let owner = this.clone();
        self.executor.submit(DeliveryTask::new(
            Lane::Transaction(id),
            "consumer-transmit-error",
            owner,
            async move {
                warn!(transaction_id = %id, stage = header.stage, %error, "transmit error");
                this.registry.fail(id, &Failure::Transmit(error))
            },
        ));
    }
}

impl TaskOwner for ConsumerInner {
    fn is_closed(&self) -> bool {
        self.core.state() == BindingState::Closed
    }

    /// Close ends this binding's interactions through `close_owned`, so this
    /// only finds one for a task dropped unrun while its interaction was
    /// still registered.
    fn abort(&self, lane: Lane) {
        if let Lane::Transaction(id) = lane {
            self.registry.fail(id, &Failure::Aborted);
        }
    }

    fn delivery_accepted(&self) {
        self.core.delivery_accepted();
    }

    fn delivery_done(&self) {
        self.core.delivery_done();
    }
}

#[async_trait]
impl ManagedBinding for ConsumerInner {
    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.stop_inbound().await;
        self.core.drain().await;
        let ended = self.registry.close_owned(self.core.id());
        if ended > 0 {
            info!(binding = self.core.id(), outstanding = ended, "consumer closed with outstanding interactions");
        }
        self.core.release_endpoint().await;
        self.core.finish_close();
    }
}

fn required(
    listener: Option<Arc<dyn InteractionListener>>,
) -> Result<Arc<dyn InteractionListener>, CourierError> {
    listener.ok_or(CourierError::InvalidArgument("listener is required"))
}

fn register_body(subscription: &Subscription) -> Body {
    Body::from(vec![
        rmpv::Value::from(subscription.id.as_str()),
        rmpv::Value::Array(subscription.filters.clone()),
    ])
}

fn deregister_body(ids: &[SubscriptionId]) -> Result<Body, CourierError> {
    if ids.is_empty() {
        return Err(CourierError::InvalidArgument("subscription id list is empty"));
    }
    Ok(Body::from(
        ids.iter()
            .map(|id| rmpv::Value::from(id.as_str()))
            .collect::<Vec<_>>(),
    ))
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A consumer of one service at one target.
#[derive(Clone)]
pub struct ConsumerBinding {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("core", &self.inner.core)
            .field("target", &self.inner.config.target)
            .finish_non_exhaustive()
    }
}

impl ConsumerBinding {
    pub(crate) async fn open(
        manager: &Arc<ManagerCore>,
        config: ConsumerConfig,
    ) -> Result<Self, CourierError> {
        let registry = manager.registry().clone();
        let executor = manager.executor().clone();
        let endpoint = config.endpoint.clone();
        let key = config.service.key;
        let inner = manager
            .open(&endpoint, key, move |core, this| ConsumerInner {
                this: this.clone(),
                core,
                config,
                registry,
                executor,
                subscriptions: SubscriptionManager::new(),
            })
            .await?;
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> BindingId {
        self.inner.core.id()
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        self.inner.core.uri()
    }

    #[must_use]
    pub fn target(&self) -> &Uri {
        &self.inner.config.target
    }

    #[must_use]
    pub fn state(&self) -> BindingState {
        self.inner.core.state()
    }

    #[must_use]
    pub fn stats(&self) -> BindingStats {
        self.inner.core.stats()
    }

    /// Fire-and-forget. Returns the transaction id the message carried.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` for a non-send operation, or
    /// the send error.
    pub async fn send(
        &self,
        op: &Operation,
        body: impl Into<Body> + Send,
    ) -> Result<TransactionId, CourierError> {
        let inner = &self.inner;
        inner.check_operation(op, InteractionType::Send)?;
        inner.core.ensure_open()?;
        let id = inner.registry.new_transaction_id()?;
        let header = inner.initiation_header(op, id, stage::SEND);
        inner.core.send(Message::new(header, body)).await?;
        Ok(id)
    }

    /// Submits and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the argument, send, or interaction error.
    pub async fn submit(
        &self,
        op: &Operation,
        body: impl Into<Body> + Send,
    ) -> Result<(), CourierError> {
        let (_, waiter) = self
            .inner
            .start_blocking(op, PatternKind::Submit, body.into(), None)
            .await?;
        waiter.wait().await.map(drop)
    }

    /// Submits; the acknowledgement goes to `listener` if one is given.
    ///
    /// # Errors
    ///
    /// Returns the argument or send error.
    pub async fn async_submit(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<TransactionId, CourierError> {
        self.inner
            .start_callback(op, PatternKind::Submit, body.into(), listener)
            .await
    }

    /// Sends a request and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns the argument, send, or interaction error.
    pub async fn request(
        &self,
        op: &Operation,
        body: impl Into<Body> + Send,
    ) -> Result<Message, CourierError> {
        let (_, waiter) = self
            .inner
            .start_blocking(op, PatternKind::Request, body.into(), None)
            .await?;
        waiter.wait().await
    }

    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send error.
    pub async fn async_request(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<TransactionId, CourierError> {
        let listener = required(listener)?;
        self.inner
            .start_callback(op, PatternKind::Request, body.into(), Some(listener))
            .await
    }

    /// Invokes and waits for the acknowledgement. The response goes to
    /// `listener`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send or interaction error.
    pub async fn invoke(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<Message, CourierError> {
        let listener = required(listener)?;
        let (_, waiter) = self
            .inner
            .start_blocking(op, PatternKind::Invoke, body.into(), Some(listener))
            .await?;
        waiter.wait().await
    }

    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send error.
    pub async fn async_invoke(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<TransactionId, CourierError> {
        let listener = required(listener)?;
        self.inner
            .start_callback(op, PatternKind::Invoke, body.into(), Some(listener))
            .await
    }

    /// Starts a progress exchange and waits for the acknowledgement. Updates
    /// and the response go to `listener`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send or interaction error.
    pub async fn progress(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<Message, CourierError> {
        let listener = required(listener)?;
        let (_, waiter) = self
            .inner
            .start_blocking(op, PatternKind::Progress, body.into(), Some(listener))
            .await?;
        waiter.wait().await
    }

    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send error.
    pub async fn async_progress(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
        body: impl Into<Body> + Send,
    ) -> Result<TransactionId, CourierError> {
        let listener = required(listener)?;
        self.inner
            .start_callback(op, PatternKind::Progress, body.into(), Some(listener))
            .await
    }

    /// Registers `subscription` and waits for the broker's acknowledgement.
    /// Notifications go to `listener`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send or interaction error. The subscription is dropped on error.
    pub async fn register(
        &self,
        op: &Operation,
        subscription: Subscription,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<(), CourierError> {
        let inner = &self.inner;
        let listener = required(listener)?;
        let (id, header) = inner.prepare(op, PatternKind::Register)?;
        inner
            .subscriptions
            .insert(subscription.id.clone(), listener, id);
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Register, header.clone(), inner.core.id(), None);
        let body = register_body(&subscription);
        let result = match inner.launch(interaction, Message::new(header, body)).await {
            Ok(()) => waiter.wait().await.map(drop),
            Err(e) => Err(e),
        };
        if result.is_err() {
            inner.subscriptions.remove_if(&subscription.id, id);
        }
        result
    }

    /// Registers `subscription`; the acknowledgement and the notifications go
    /// to `listener`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener, or the
    /// send error.
    pub async fn async_register(
        &self,
        op: &Operation,
        subscription: Subscription,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<TransactionId, CourierError> {
        let inner = &self.inner;
        let listener = required(listener)?;
        let (id, header) = inner.prepare(op, PatternKind::Register)?;
        inner
            .subscriptions
            .insert(subscription.id.clone(), listener.clone(), id);
        let interaction =
            Interaction::callback(PatternKind::Register, header.clone(), inner.core.id(), Some(listener));
        let body = register_body(&subscription);
        if let Err(e) = inner.launch(interaction, Message::new(header, body)).await {
            inner.subscriptions.remove_if(&subscription.id, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Drops the subscriptions `ids` and waits for the broker's
    /// acknowledgement. Notifications stop at once.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` for an empty id list, or the
    /// send or interaction error.
    pub async fn deregister(
        &self,
        op: &Operation,
        ids: Vec<SubscriptionId>,
    ) -> Result<(), CourierError> {
        let body = deregister_body(&ids)?;
        let (id, header) = self.inner.prepare(op, PatternKind::Deregister)?;
        self.inner.subscriptions.remove_all(&ids);
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Deregister, header.clone(), self.inner.core.id(), None);
        debug!(transaction_id = %id, count = ids.len(), "deregistering subscriptions");
        self.inner
            .launch(interaction, Message::new(header, body))
            .await?;
        waiter.wait().await.map(drop)
    }

    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` for an empty id list, or the
    /// send error.
    pub async fn async_deregister(
        &self,
        op: &Operation,
        ids: Vec<SubscriptionId>,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<TransactionId, CourierError> {
        let body = deregister_body(&ids)?;
        let (id, header) = self.inner.prepare(op, PatternKind::Deregister)?;
        self.inner.subscriptions.remove_all(&ids);
        let interaction =
            Interaction::callback(PatternKind::Deregister, header.clone(), self.inner.core.id(), listener);
        self.inner
            .launch(interaction, Message::new(header, body))
            .await?;
        Ok(id)
    }

    /// Re-attaches a callback interaction whose initiating message was sent
    /// earlier, for example before a restart. Nothing is sent; replies for
    /// `transaction_id` reach `listener` from `last_stage` on, and the
    /// timeout counts from `initiation_time`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener or for a
    /// stage that cannot be continued, and `CourierError::AlreadyRunning` if
    /// an interaction is still registered under `transaction_id`.
    pub async fn continue_interaction(
        &self,
        op: &Operation,
        last_stage: u8,
        initiation_time: Instant,
        transaction_id: TransactionId,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<(), CourierError> {
        let inner = &self.inner;
        let listener = required(listener)?;
        let initial = if op.interaction == InteractionType::PubSub {
            last_stage
        } else {
            1
        };
        let kind = PatternKind::from_initiation(op.interaction, initial)
            .ok_or(CourierError::InvalidArgument("interaction cannot be continued"))?;
        inner.check_operation(op, kind.interaction_type())?;
        if !kind.table().is_resumable(last_stage) {
            return Err(CourierError::InvalidArgument("stage cannot be continued"));
        }
        inner.core.ensure_open()?;

        inner.registry.reserve(transaction_id);
        let header = inner.initiation_header(op, transaction_id, kind.table().initial);
        let interaction = Interaction::resumed(
            kind,
            header,
            inner.core.id(),
            last_stage,
            initiation_time,
            listener,
        );
        inner.registry.register(Arc::new(interaction))?;
        debug!(%transaction_id, kind = kind.as_str(), last_stage, "interaction continued");
        Ok(())
    }

    /// Stops delivery, drains, fails outstanding interactions with a closed
    /// error, and releases the endpoint. A second call is a no-op.
    pub async fn close(&self) {
        ManagedBinding::close(&*self.inner).await;
    }
}
