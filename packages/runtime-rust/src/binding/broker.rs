//! Broker bindings and the engine they share with private brokers.
//!
//! The engine decodes the pub/sub control stages, hands them to a
//! [`BrokerHandler`], acknowledges them, and fans publications out as
//! NOTIFY messages. Body conventions:
//!
//! - REGISTER: `[subscription id, [filters...]]`
//! - DEREGISTER: `[subscription id...]`
//! - PUBLISH_REGISTER: `[entity keys...]`
//! - PUBLISH: `[updates...]`
//! - NOTIFY: `[subscription id, updates...]`

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    codes, stage, Body, CourierError, InteractionType, Message, MessageHeader, MessageReceiver,
    ServiceKey, StandardError, Subscription, SubscriptionId, TransactionId, Uri,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::core::{BindingCore, BindingId, BindingState, BindingStats};
use super::manager::{ManagedBinding, ManagerCore};
use crate::config::BrokerConfig;
use crate::execution::{DeliveryTask, ExecutionModel, Lane, TaskOwner};
use crate::interaction::PatternKind;
use crate::traits::{BrokerHandler, NotifyBatch};
use crate::transaction::Signal;

fn bad_encoding(text: &str) -> StandardError {
    StandardError::with_text(codes::BAD_ENCODING, text)
}

fn decode_subscription(body: &Body) -> Result<Subscription, StandardError> {
    match body.elements() {
        [rmpv::Value::String(id), rmpv::Value::Array(filters)] => {
            let id = id.as_str().ok_or_else(|| bad_encoding("subscription id is not utf-8"))?;
            Ok(Subscription::new(id, filters.clone()))
        }
        _ => Err(bad_encoding("malformed register body")),
    }
}

fn decode_ids(body: &Body) -> Result<Vec<SubscriptionId>, StandardError> {
    let ids: Option<Vec<SubscriptionId>> = body
        .elements()
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect();
    match ids {
        Some(ids) if !ids.is_empty() => Ok(ids),
        _ => Err(bad_encoding("malformed deregister body")),
    }
}

/// Stage of the reply to a broker-bound request.
fn reply_stage(request: u8) -> Option<u8> {
    if request == stage::PUBLISH {
        return Some(stage::PUBLISH);
    }
    PatternKind::from_initiation(InteractionType::PubSub, request).map(PatternKind::sync_stage)
}

/// Serves the broker stages of pub/sub.
pub(crate) struct BrokerEngine {
    handler: Arc<dyn BrokerHandler>,
}

impl BrokerEngine {
    pub(crate) fn new(handler: Arc<dyn BrokerHandler>) -> Self {
        Self { handler }
    }

    pub(crate) async fn handle(&self, core: &BindingCore, message: Message) -> Signal {
        let header = message.header.clone();
        let Some(reply_at) = reply_stage(header.stage) else {
            debug!(stage = header.stage, "stage not served by a broker, dropped");
            return Signal::Completed;
        };
        let message = match core.check_inbound(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(transaction_id = %header.transaction_id, stage = header.stage, error = %e, "broker request rejected");
                reply(core, &header, reply_at, Err(e.to_standard())).await;
                return Signal::Completed;
            }
        };

        let elements = message.body.elements().to_vec();
        let result = match header.stage {
            stage::REGISTER => match decode_subscription(&message.body) {
                Ok(subscription) => self.handler.register(&header, subscription).await,
                Err(e) => Err(e),
            },
            stage::DEREGISTER => match decode_ids(&message.body) {
                Ok(ids) => self.handler.deregister(&header, ids).await,
                Err(e) => Err(e),
            },
            stage::PUBLISH_REGISTER => self.handler.publish_register(&header, elements).await,
            stage::PUBLISH_DEREGISTER => self.handler.publish_deregister(&header).await,
            _ => match self.handler.publish(&header, elements).await {
                Ok(batches) => {
                    notify(core, &header, batches).await;
                    return Signal::Completed;
                }
                Err(e) => Err(e),
            },
        };
        reply(core, &header, reply_at, result).await;
        Signal::Completed
    }
}

/// Acknowledges `request`. A successful PUBLISH is never acknowledged.
async fn reply(
    core: &BindingCore,
    request: &MessageHeader,
    at: u8,
    result: Result<(), StandardError>,
) {
    let message = match result {
        Ok(()) if at == stage::PUBLISH => return,
        Ok(()) => Message::new(request.reply(at, false), Body::Empty),
        Err(error) => Message::error(request.reply(at, true), error),
    };
    if let Err(e) = core.send(message).await {
        warn!(transaction_id = %request.transaction_id, stage = at, error = %e, "broker reply not delivered");
    }
}

async fn notify(core: &BindingCore, publish: &MessageHeader, batches: Vec<NotifyBatch>) {
    for batch in batches {
        let header = MessageHeader::initiation(
            core.uri().clone(),
            batch.subscriber,
            InteractionType::PubSub,
            batch.transaction_id,
            publish.service,
            publish.operation,
        )
        .with_stage(stage::NOTIFY, false)
        .with_qos(publish.qos, publish.priority)
        .with_domain(publish.domain.clone());
        let to = header.to.clone();
        let mut body = Vec::with_capacity(batch.updates.len() + 1);
        body.push(rmpv::Value::from(batch.subscription_id));
        body.extend(batch.updates);
        if let Err(e) = core.send(Message::new(header, body)).await {
            warn!(subscriber = %to, error = %e, "notify not delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Broker binding
// ---------------------------------------------------------------------------

pub(crate) struct BrokerInner {
    this: Weak<BrokerInner>,
    core: BindingCore,
    engine: BrokerEngine,
    executor: Arc<ExecutionModel>,
}

impl MessageReceiver for BrokerInner {
    fn on_message(&self, message: Message) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let lane = Lane::of(&message.header);
        let owner = this.clone();
        let task = self.core.admit(|| {
            DeliveryTask::new(lane, "broker-deliver", owner, async move {
                this.engine.handle(&this.core, message).await
            })
        });
        match task {
            Some(task) => self.executor.submit(task),
            None => debug!(binding = self.core.id(), "broker not open, inbound message dropped"),
        }
    }

    fn on_transmit_error(&self, header: MessageHeader, error: StandardError) {
        warn!(
            binding = self.core.id(),
            transaction_id = %header.transaction_id,
            stage = header.stage,
            to = %header.to,
            %error,
            "broker output not delivered"
        );
    }
}

impl TaskOwner for BrokerInner {
    fn is_closed(&self) -> bool {
        self.core.state() == BindingState::Closed
    }

    fn abort(&self, lane: Lane) {
        debug!(binding = self.core.id(), ?lane, "broker delivery aborted");
    }

    fn delivery_accepted(&self) {
        self.core.delivery_accepted();
    }

    fn delivery_done(&self) {
        self.core.delivery_done();
    }
}

#[async_trait]
impl ManagedBinding for BrokerInner {
    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.stop_inbound().await;
        self.core.drain().await;
        self.core.release_endpoint().await;
        self.core.finish_close();
    }
}

/// A broker serving one service.
#[derive(Clone)]
pub struct BrokerBinding {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for BrokerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBinding")
            .field("core", &self.inner.core)
            .finish_non_exhaustive()
    }
}

impl BrokerBinding {
    pub(crate) async fn open(
        manager: &Arc<ManagerCore>,
        config: BrokerConfig,
    ) -> Result<Self, CourierError> {
        let executor = manager.executor().clone();
        let engine = BrokerEngine::new(config.handler.clone());
        let inner = manager
            .open(&config.endpoint, config.service.key, move |core, this| BrokerInner {
                this: this.clone(),
                core,
                engine,
                executor,
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

    pub async fn close(&self) {
        ManagedBinding::close(&*self.inner).await;
    }
}

// ---------------------------------------------------------------------------
// In-memory matching engine
// ---------------------------------------------------------------------------

struct Registered {
    transaction_id: TransactionId,
    service: ServiceKey,
    operation: u16,
    filters: Vec<rmpv::Value>,
}

#[derive(Default)]
struct MatchState {
    /// Keyed by (subscriber, subscription id).
    subscriptions: HashMap<(Uri, SubscriptionId), Registered>,
    /// (publisher, service, operation) triples allowed to publish.
    publishers: HashSet<(Uri, ServiceKey, u16)>,
}

/// Minimal matching engine: a subscription with no filters receives every
/// update of its operation, otherwise only updates equal to one of its
/// filters. Publishing requires a prior publish-register.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MatchState>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("subscriptions", &state.subscriptions.len())
            .field("publishers", &state.publishers.len())
            .finish()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

#[async_trait]
impl BrokerHandler for MemoryBroker {
    async fn register(
        &self,
        header: &MessageHeader,
        subscription: Subscription,
    ) -> Result<(), StandardError> {
        self.state.lock().subscriptions.insert(
            (header.from.clone(), subscription.id),
            Registered {
                transaction_id: header.transaction_id,
                service: header.service,
                operation: header.operation,
                filters: subscription.filters,
            },
        );
        Ok(())
    }

    async fn deregister(
        &self,
        header: &MessageHeader,
        ids: Vec<SubscriptionId>,
    ) -> Result<(), StandardError> {
        let mut state = self.state.lock();
        for id in ids {
            state.subscriptions.remove(&(header.from.clone(), id));
        }
        Ok(())
    }

    async fn publish_register(
        &self,
        header: &MessageHeader,
        _keys: Vec<rmpv::Value>,
    ) -> Result<(), StandardError> {
        self.state
            .lock()
            .publishers
            .insert((header.from.clone(), header.service, header.operation));
        Ok(())
    }

    async fn publish_deregister(&self, header: &MessageHeader) -> Result<(), StandardError> {
        self.state
            .lock()
            .publishers
            .remove(&(header.from.clone(), header.service, header.operation));
        Ok(())
    }

    async fn publish(
        &self,
        header: &MessageHeader,
        updates: Vec<rmpv::Value>,
    ) -> Result<Vec<NotifyBatch>, StandardError> {
        let state = self.state.lock();
        let publisher = (header.from.clone(), header.service, header.operation);
        if !state.publishers.contains(&publisher) {
            return Err(StandardError::incorrect_state("publisher not registered"));
        }
        let batches = state
            .subscriptions
            .iter()
            .filter(|(_, r)| r.service == header.service && r.operation == header.operation)
            .filter_map(|((subscriber, id), r)| {
                let matched: Vec<rmpv::Value> = updates
                    .iter()
                    .filter(|u| r.filters.is_empty() || r.filters.contains(u))
                    .cloned()
                    .collect();
                (!matched.is_empty()).then(|| NotifyBatch {
                    subscriber: subscriber.clone(),
                    transaction_id: r.transaction_id,
                    subscription_id: id.clone(),
                    updates: matched,
                })
            })
            .collect();
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: ServiceKey = ServiceKey::new(3, 1, 1);

    fn header(from: &str, s: u8, txn: u64) -> MessageHeader {
        MessageHeader::initiation(
            Uri::from(from),
            Uri::from("memory://broker"),
            InteractionType::PubSub,
            TransactionId(txn),
            KEY,
            1,
        )
        .with_stage(s, false)
    }

    #[test]
    fn register_body_decodes() {
        let body = Body::from(vec![
            rmpv::Value::from("s1"),
            rmpv::Value::Array(vec![rmpv::Value::from(7)]),
        ]);
        let sub = decode_subscription(&body).unwrap();
        assert_eq!(sub.id, "s1");
        assert_eq!(sub.filters, vec![rmpv::Value::from(7)]);
        let err = decode_subscription(&Body::from(vec![rmpv::Value::from(1)])).unwrap_err();
        assert_eq!(err.number, codes::BAD_ENCODING);
        assert!(decode_ids(&Body::Empty).is_err());
    }

    #[test]
    fn reply_stages() {
        assert_eq!(reply_stage(stage::REGISTER), Some(stage::REGISTER_ACK));
        assert_eq!(reply_stage(stage::PUBLISH_DEREGISTER), Some(stage::PUBLISH_DEREGISTER_ACK));
        assert_eq!(reply_stage(stage::PUBLISH), Some(stage::PUBLISH));
        assert_eq!(reply_stage(stage::NOTIFY), None);
    }

    #[tokio::test]
    async fn memory_broker_filters_updates_per_subscription() {
        let broker = MemoryBroker::new();
        broker
            .register(&header("memory://c1", stage::REGISTER, 10), Subscription::new("all", vec![]))
            .await
            .unwrap();
        broker
            .register(
                &header("memory://c2", stage::REGISTER, 11),
                Subscription::new("odd", vec![rmpv::Value::from(1), rmpv::Value::from(3)]),
            )
            .await
            .unwrap();

        let publish = header("memory://p", stage::PUBLISH, 20);
        let err = broker.publish(&publish, vec![rmpv::Value::from(1)]).await.unwrap_err();
        assert_eq!(err.number, codes::INCORRECT_STATE);

        broker
            .publish_register(&header("memory://p", stage::PUBLISH_REGISTER, 20), vec![])
            .await
            .unwrap();
        let mut batches = broker
            .publish(&publish, vec![rmpv::Value::from(1), rmpv::Value::from(2)])
            .await
            .unwrap();
        batches.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].subscription_id, "all");
        assert_eq!(batches[0].transaction_id, TransactionId(10));
        assert_eq!(batches[0].updates.len(), 2);
        assert_eq!(batches[1].subscriber, Uri::from("memory://c2"));
        assert_eq!(batches[1].updates, vec![rmpv::Value::from(1)]);

        broker
            .deregister(&header("memory://c1", stage::DEREGISTER, 12), vec!["all".into()])
            .await
            .unwrap();
        assert_eq!(broker.subscriptions(), 1);
    }
}
