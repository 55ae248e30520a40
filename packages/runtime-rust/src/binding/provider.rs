//! Provider bindings: serve initiating messages and publish updates.
//!
//! Each initiating message is handed to the [`ProviderHandler`] on the
//! transaction's execution lane, together with a [`ProviderInteraction`]
//! that sends the replies. The reply handle walks the same transition table
//! the consumer side checks, so an out-of-order reply fails locally instead
//! of reaching the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    stage, Body, CourierError, InteractionListener, InteractionType, Message, MessageHeader,
    MessageReceiver, Operation, Role, StandardError, TransactionId, Uri,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::broker::BrokerEngine;
use super::core::{BindingCore, BindingId, BindingState, BindingStats};
use super::manager::{ManagedBinding, ManagerCore};
use crate::config::ProviderConfig;
use crate::dispatch::routes;
use crate::execution::{DeliveryTask, ExecutionModel, Lane, TaskOwner};
use crate::interaction::{Failure, Interaction, PatternKind};
use crate::transaction::{Signal, TransactionRegistry};

#[derive(Debug)]
struct ReplyProgress {
    stage: u8,
    sequence: u64,
    finished: bool,
}

struct ReplyInner {
    binding: Arc<ProviderInner>,
    /// Header of the initiating message.
    header: MessageHeader,
    kind: Option<PatternKind>,
    progress: Mutex<ReplyProgress>,
}

/// Reply handle of one provider-side interaction.
#[derive(Clone)]
pub struct ProviderInteraction {
    inner: Arc<ReplyInner>,
}

impl std::fmt::Debug for ProviderInteraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInteraction")
            .field("transaction_id", &self.inner.header.transaction_id)
            .field("kind", &self.inner.kind)
            .field("progress", &*self.inner.progress.lock())
            .finish()
    }
}

impl ProviderInteraction {
    fn new(binding: Arc<ProviderInner>, header: MessageHeader) -> Self {
        let kind = PatternKind::from_initiation(header.interaction_type, header.stage);
        let stage = header.stage;
        Self {
            inner: Arc::new(ReplyInner {
                binding,
                header,
                kind,
                progress: Mutex::new(ReplyProgress {
                    stage,
                    sequence: 0,
                    // Send has nothing to reply.
                    finished: kind.is_none(),
                }),
            }),
        }
    }

    /// Header of the initiating message.
    #[must_use]
    pub fn header(&self) -> &MessageHeader {
        &self.inner.header
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.inner.header.transaction_id
    }

    /// Stage of the last reply sent, or the initiating stage.
    #[must_use]
    pub fn stage(&self) -> u8 {
        self.inner.progress.lock().stage
    }

    /// Whether a terminal reply was sent.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.progress.lock().finished
    }

    /// # Errors
    ///
    /// Returns `CourierError::IllegalStage` if the pattern has no
    /// acknowledgement or it is not due, or the send error.
    pub async fn send_ack(&self, body: impl Into<Body> + Send) -> Result<(), CourierError> {
        let at = self.kind_stage(PatternKind::ack_stage)?;
        self.reply(at, body.into()).await
    }

    /// Sends the next numbered progress update.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::IllegalStage` outside a progress exchange or
    /// before its acknowledgement, or the send error.
    pub async fn send_update(&self, body: impl Into<Body> + Send) -> Result<(), CourierError> {
        self.reply(stage::PROGRESS_UPDATE, body.into()).await
    }

    /// # Errors
    ///
    /// Returns `CourierError::IllegalStage` if the pattern has no response
    /// or it is not due, or the send error.
    pub async fn send_response(&self, body: impl Into<Body> + Send) -> Result<(), CourierError> {
        let at = self.kind_stage(PatternKind::response_stage)?;
        self.reply(at, body.into()).await
    }

    /// Ends the interaction with `error`, reported at the next expected
    /// stage.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::IllegalStage` if the interaction already
    /// finished, or the send error.
    pub async fn send_error(&self, error: StandardError) -> Result<(), CourierError> {
        let header = {
            let mut progress = self.inner.progress.lock();
            let next = self
                .inner
                .kind
                .and_then(|k| k.table().next_expected(progress.stage));
            match next {
                Some(to) if !progress.finished => {
                    progress.stage = to;
                    progress.finished = true;
                    self.inner.header.reply(to, true)
                }
                _ => {
                    return Err(CourierError::IllegalStage {
                        from: progress.stage,
                        to: progress.stage,
                    });
                }
            }
        };
        self.inner
            .binding
            .core
            .send(Message::error(header, error))
            .await
    }

    fn kind_stage(&self, pick: fn(PatternKind) -> Option<u8>) -> Result<u8, CourierError> {
        self.inner.kind.and_then(pick).ok_or_else(|| {
            let from = self.stage();
            CourierError::IllegalStage { from, to: from }
        })
    }

    async fn reply(&self, to: u8, body: Body) -> Result<(), CourierError> {
        let header = self.advance(to)?;
        self.inner.binding.core.send(Message::new(header, body)).await
    }

    /// Validates and records the edge to `to`, returning the reply header.
    fn advance(&self, to: u8) -> Result<MessageHeader, CourierError> {
        let mut progress = self.inner.progress.lock();
        let illegal = CourierError::IllegalStage {
            from: progress.stage,
            to,
        };
        if progress.finished {
            return Err(illegal);
        }
        let Some(edge) = self
            .inner
            .kind
            .and_then(|k| k.table().edge(progress.stage, to))
            .copied()
        else {
            return Err(illegal);
        };
        progress.stage = to;
        progress.finished = edge.terminal;
        let mut header = self.inner.header.reply(to, false);
        if to == stage::PROGRESS_UPDATE {
            progress.sequence += 1;
            header = header.with_sequence(progress.sequence);
        }
        Ok(header)
    }

    /// Reports a handler failure unless a terminal reply already went out.
    async fn fail(&self, error: StandardError) {
        if self.is_finished() {
            debug!(
                transaction_id = %self.transaction_id(),
                %error,
                "handler error after terminal reply ignored"
            );
            return;
        }
        if let Err(e) = self.send_error(error).await {
            warn!(transaction_id = %self.transaction_id(), error = %e, "error reply not delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Provider binding
// ---------------------------------------------------------------------------

struct Publication {
    transaction_id: TransactionId,
    listener: Option<Arc<dyn InteractionListener>>,
}

pub(crate) struct ProviderInner {
    this: Weak<ProviderInner>,
    core: BindingCore,
    config: ProviderConfig,
    broker: Option<BrokerEngine>,
    registry: Arc<TransactionRegistry>,
    executor: Arc<ExecutionModel>,
    /// Publish registrations, keyed by operation number.
    publications: Mutex<HashMap<u16, Publication>>,
}

impl ProviderInner {
    async fn deliver(self: Arc<Self>, message: Message) -> Signal {
        let header = &message.header;
        match routes::shared().inbound(header) {
            Some(Role::Provider) if header.interaction_type == InteractionType::PubSub => {
                self.publisher_reply(message)
            }
            Some(Role::Provider) => self.serve(message).await,
            Some(Role::Broker) => match &self.broker {
                Some(engine) => engine.handle(&self.core, message).await,
                None => {
                    debug!(
                        transaction_id = %header.transaction_id,
                        stage = header.stage,
                        "broker stage on a provider without private broker, dropped"
                    );
                    Signal::Completed
                }
            },
            _ => {
                debug!(
                    transaction_id = %header.transaction_id,
                    stage = header.stage,
                    "message not addressed to a provider, dropped"
                );
                Signal::Completed
            }
        }
    }

    async fn serve(self: &Arc<Self>, message: Message) -> Signal {
        let interaction = ProviderInteraction::new(self.clone(), message.header.clone());
        let message = match self.core.check_inbound(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(transaction_id = %interaction.transaction_id(), error = %e, "inbound request rejected");
                interaction.fail(e.to_standard()).await;
                return Signal::Completed;
            }
        };
        if let Err(error) = self.config.handler.handle(message, interaction.clone()).await {
            interaction.fail(error).await;
        }
        Signal::Completed
    }

    /// Acknowledgements and errors for this provider's publisher exchanges.
    fn publisher_reply(&self, message: Message) -> Signal {
        let id = message.header.transaction_id;
        let message = match self.core.check_inbound(message) {
            Ok(message) => message,
            Err(e) => return self.registry.fail(id, &Failure::Security(e.to_standard())),
        };
        if message.header.stage == stage::PUBLISH {
            self.publish_error(&message.header, &message.error_body());
            return Signal::Completed;
        }
        self.registry.signal(message)
    }

    fn publish_error(&self, header: &MessageHeader, error: &StandardError) {
        let listener = self
            .publications
            .lock()
            .values()
            .find(|p| p.transaction_id == header.transaction_id)
            .and_then(|p| p.listener.clone());
        match listener {
            Some(listener) => listener.publish_error_received(header, error),
            None => warn!(transaction_id = %header.transaction_id, %error, "publish error without listener"),
        }
    }

    fn broker_target(&self) -> Result<Uri, CourierError> {
        match (&self.config.broker_uri, &self.broker) {
            (Some(uri), _) => Ok(uri.clone()),
            (None, Some(_)) => Ok(self.core.uri().clone()),
            (None, None) => Err(CourierError::InvalidArgument("provider has no broker")),
        }
    }

    fn publish_header(
        &self,
        op: &Operation,
        id: TransactionId,
        at: u8,
    ) -> Result<MessageHeader, CourierError> {
        if op.interaction != InteractionType::PubSub || op.service != self.config.service.key {
            return Err(CourierError::InvalidArgument("not a pub/sub operation of this service"));
        }
        Ok(MessageHeader::initiation(
            self.core.uri().clone(),
            self.broker_target()?,
            InteractionType::PubSub,
            id,
            self.config.service.key,
            op.number,
        )
        .with_stage(at, false)
        .with_qos(self.config.qos, self.config.priority))
    }

    async fn launch(&self, interaction: Interaction, message: Message) -> Result<(), CourierError> {
        let id = interaction.transaction_id();
        self.registry.register(Arc::new(interaction))?;
        if let Err(e) = self.core.send(message).await {
            self.registry.remove(id);
            return Err(e);
        }
        Ok(())
    }

    /// Records the publication, then builds its register exchange.
    fn begin_publish_register(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<(TransactionId, MessageHeader), CourierError> {
        self.core.ensure_open()?;
        let id = self.registry.new_transaction_id()?;
        let header = self.publish_header(op, id, stage::PUBLISH_REGISTER)?;
        self.publications.lock().insert(
            op.number,
            Publication {
                transaction_id: id,
                listener,
            },
        );
        Ok((id, header))
    }

    fn drop_publication(&self, op: &Operation, id: TransactionId) {
        let mut publications = self.publications.lock();
        if publications.get(&op.number).is_some_and(|p| p.transaction_id == id) {
            publications.remove(&op.number);
        }
    }

    fn begin_publish_deregister(
        &self,
        op: &Operation,
    ) -> Result<(TransactionId, MessageHeader), CourierError> {
        self.core.ensure_open()?;
        let id = self.registry.new_transaction_id()?;
        let header = self.publish_header(op, id, stage::PUBLISH_DEREGISTER)?;
        self.publications.lock().remove(&op.number);
        Ok((id, header))
    }
}

impl MessageReceiver for ProviderInner {
    fn on_message(&self, message: Message) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let transaction_id = message.header.transaction_id;
        let lane = Lane::of(&message.header);
        let owner = this.clone();
        let task = self
            .core
            .admit(|| DeliveryTask::new(lane, "provider-deliver", owner, this.deliver(message)));
        match task {
            Some(task) => self.executor.submit(task),
            None => debug!(
                binding = self.core.id(),
                %transaction_id,
                "provider not open, inbound message dropped"
            ),
        }
    }

    fn on_transmit_error(&self, header: MessageHeader, error: StandardError) {
        let id = header.transaction_id;
        let publisher_request = header.interaction_type == InteractionType::PubSub
            && matches!(header.stage, stage::PUBLISH_REGISTER | stage::PUBLISH_DEREGISTER);
        if header.interaction_type == InteractionType::PubSub && header.stage == stage::PUBLISH {
            self.publish_error(&header, &error);
        } else if publisher_request {
            let Some(this) = self.this.upgrade() else {
                return;
            };
            let owner = this.clone();
            self.executor.submit(DeliveryTask::new(
                Lane::Transaction(id),
                "provider-transmit-error",
                owner,
                async move { this.registry.fail(id, &Failure::Transmit(error)) },
            ));
        } else {
            warn!(transaction_id = %id, stage = header.stage, to = %header.to, %error, "provider reply not delivered");
        }
    }
}

impl TaskOwner for ProviderInner {
    fn is_closed(&self) -> bool {
        self.core.state() == BindingState::Closed
    }

    /// See the consumer: close itself goes through `close_owned`.
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
impl ManagedBinding for ProviderInner {
    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.stop_inbound().await;
        self.core.drain().await;
        let ended = self.registry.close_owned(self.core.id());
        if ended > 0 {
            info!(binding = self.core.id(), outstanding = ended, "provider closed with outstanding publisher exchanges");
        }
        self.publications.lock().clear();
        self.core.release_endpoint().await;
        self.core.finish_close();
    }
}

/// A provider of one service, optionally publishing and optionally acting
/// as its own broker.
#[derive(Clone)]
pub struct ProviderBinding {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("core", &self.inner.core)
            .field("private_broker", &self.inner.broker.is_some())
            .finish_non_exhaustive()
    }
}

impl ProviderBinding {
    pub(crate) async fn open(
        manager: &Arc<ManagerCore>,
        config: ProviderConfig,
    ) -> Result<Self, CourierError> {
        let registry = manager.registry().clone();
        let executor = manager.executor().clone();
        let endpoint = config.endpoint.clone();
        let key = config.service.key;
        let broker = config.private_broker.clone().map(BrokerEngine::new);
        let inner = manager
            .open(&endpoint, key, move |core, this| ProviderInner {
                this: this.clone(),
                core,
                config,
                broker,
                registry,
                executor,
                publications: Mutex::new(HashMap::new()),
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
    pub fn state(&self) -> BindingState {
        self.inner.core.state()
    }

    #[must_use]
    pub fn stats(&self) -> BindingStats {
        self.inner.core.stats()
    }

    /// Registers as publisher of `op` and waits for the broker's
    /// acknowledgement. Later publish errors go to `listener`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a broker, or the
    /// send or interaction error.
    pub async fn publish_register(
        &self,
        op: &Operation,
        keys: Vec<rmpv::Value>,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<(), CourierError> {
        let inner = &self.inner;
        let (id, header) = inner.begin_publish_register(op, listener)?;
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::PublishRegister, header.clone(), inner.core.id(), None);
        let result = match inner.launch(interaction, Message::new(header, keys)).await {
            Ok(()) => waiter.wait().await.map(drop),
            Err(e) => Err(e),
        };
        if result.is_err() {
            inner.drop_publication(op, id);
        }
        result
    }

    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` without a listener or a
    /// broker, or the send error.
    pub async fn async_publish_register(
        &self,
        op: &Operation,
        keys: Vec<rmpv::Value>,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<TransactionId, CourierError> {
        let inner = &self.inner;
        let listener = listener.ok_or(CourierError::InvalidArgument("listener is required"))?;
        let (id, header) = inner.begin_publish_register(op, Some(listener.clone()))?;
        let interaction = Interaction::callback(
            PatternKind::PublishRegister,
            header.clone(),
            inner.core.id(),
            Some(listener),
        );
        if let Err(e) = inner.launch(interaction, Message::new(header, keys)).await {
            inner.drop_publication(op, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Publishes `updates` under the registration of `op`.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidArgument` if `op` was not
    /// publish-registered, or the send error.
    pub async fn publish(
        &self,
        op: &Operation,
        updates: Vec<rmpv::Value>,
    ) -> Result<(), CourierError> {
        let inner = &self.inner;
        inner.core.ensure_open()?;
        let id = inner
            .publications
            .lock()
            .get(&op.number)
            .map(|p| p.transaction_id)
            .ok_or(CourierError::InvalidArgument("operation is not publish-registered"))?;
        let header = inner.publish_header(op, id, stage::PUBLISH)?;
        inner.core.send(Message::new(header, updates)).await
    }

    /// Withdraws the registration of `op` and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the send or interaction error.
    pub async fn publish_deregister(&self, op: &Operation) -> Result<(), CourierError> {
        let inner = &self.inner;
        let (_, header) = inner.begin_publish_deregister(op)?;
        let (interaction, waiter) = Interaction::blocking(
            PatternKind::PublishDeregister,
            header.clone(),
            inner.core.id(),
            None,
        );
        inner.launch(interaction, Message::new(header, ())).await?;
        waiter.wait().await.map(drop)
    }

    /// # Errors
    ///
    /// Returns the send error.
    pub async fn async_publish_deregister(
        &self,
        op: &Operation,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Result<TransactionId, CourierError> {
        let inner = &self.inner;
        let (id, header) = inner.begin_publish_deregister(op)?;
        let interaction = Interaction::callback(
            PatternKind::PublishDeregister,
            header.clone(),
            inner.core.id(),
            listener,
        );
        inner.launch(interaction, Message::new(header, ())).await?;
        Ok(id)
    }

    pub async fn close(&self) {
        ManagedBinding::close(&*self.inner).await;
    }
}
