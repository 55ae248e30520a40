//! The context object every binding manager hangs off.
//!
//! Built once with the runtime config, the transport, and the access-control
//! collaborator. Hands out one manager per role, created on first use, and
//! closes them in reverse creation order.

use std::sync::Arc;

use courier_core::{AccessControl, AllowAll, CourierError, Role, Transport};
use parking_lot::Mutex;
use tracing::info;

use crate::binding::manager::{ManagerCore, ManagerParts};
use crate::binding::{BrokerManager, ConsumerManager, ProviderManager};
use crate::config::CourierConfig;
use crate::dispatch::SharedEndpoints;

#[derive(Default)]
struct Managers {
    consumer: Option<ConsumerManager>,
    provider: Option<ProviderManager>,
    broker: Option<BrokerManager>,
    /// Creation order.
    order: Vec<Arc<ManagerCore>>,
    closed: bool,
}

pub struct CourierContext {
    parts: ManagerParts,
    managers: Mutex<Managers>,
}

impl std::fmt::Debug for CourierContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let managers = self.managers.lock();
        f.debug_struct("CourierContext")
            .field("config", &self.parts.config)
            .field("managers", &managers.order)
            .field("closed", &managers.closed)
            .finish_non_exhaustive()
    }
}

impl CourierContext {
    /// Context letting every message through access control.
    #[must_use]
    pub fn new(config: CourierConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_access_control(config, transport, Arc::new(AllowAll))
    }

    #[must_use]
    pub fn with_access_control(
        config: CourierConfig,
        transport: Arc<dyn Transport>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            parts: ManagerParts {
                config,
                transport,
                access,
                endpoints: Arc::new(SharedEndpoints::new()),
            },
            managers: Mutex::new(Managers::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CourierConfig {
        &self.parts.config
    }

    /// Shared endpoints of this context, by name.
    #[must_use]
    pub fn endpoints(&self) -> &Arc<SharedEndpoints> {
        &self.parts.endpoints
    }

    /// The consumer manager, started on first call. Must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Closed` once the context was closed.
    pub fn consumer_manager(&self) -> Result<ConsumerManager, CourierError> {
        let mut managers = self.managers.lock();
        Self::ensure_open(&managers)?;
        if let Some(existing) = &managers.consumer {
            return Ok(existing.clone());
        }
        let core = self.start(&mut managers, Role::Consumer);
        let manager = ConsumerManager::new(core);
        managers.consumer = Some(manager.clone());
        Ok(manager)
    }

    /// # Errors
    ///
    /// Returns `CourierError::Closed` once the context was closed.
    pub fn provider_manager(&self) -> Result<ProviderManager, CourierError> {
        let mut managers = self.managers.lock();
        Self::ensure_open(&managers)?;
        if let Some(existing) = &managers.provider {
            return Ok(existing.clone());
        }
        let core = self.start(&mut managers, Role::Provider);
        let manager = ProviderManager::new(core);
        managers.provider = Some(manager.clone());
        Ok(manager)
    }

    /// # Errors
    ///
    /// Returns `CourierError::Closed` once the context was closed.
    pub fn broker_manager(&self) -> Result<BrokerManager, CourierError> {
        let mut managers = self.managers.lock();
        Self::ensure_open(&managers)?;
        if let Some(existing) = &managers.broker {
            return Ok(existing.clone());
        }
        let core = self.start(&mut managers, Role::Broker);
        let manager = BrokerManager::new(core);
        managers.broker = Some(manager.clone());
        Ok(manager)
    }

    fn ensure_open(managers: &Managers) -> Result<(), CourierError> {
        if managers.closed {
            return Err(CourierError::Closed("context"));
        }
        Ok(())
    }

    fn start(&self, managers: &mut Managers, role: Role) -> Arc<ManagerCore> {
        let core = ManagerCore::start(role, self.parts.clone());
        managers.order.push(core.clone());
        core
    }

    /// Closes every manager, last created first. Later calls are no-ops.
    pub async fn close(&self) {
        let order = {
            let mut managers = self.managers.lock();
            if managers.closed {
                return;
            }
            managers.closed = true;
            std::mem::take(&mut managers.order)
        };
        for core in order.iter().rev() {
            core.close().await;
        }
        info!(managers = order.len(), "context closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{
        codes, stage, InteractionType, Message, Operation, QosLevel, ServiceDescriptor,
        ServiceKey, StandardError, Subscription, Uri,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::binding::{BindingState, MemoryBroker, ProviderInteraction};
    use crate::config::{
        BrokerConfig, ConsumerConfig, EndpointConfig, ExecutionConfig, ProviderConfig,
    };
    use crate::interaction::testing::{Event, RecordingListener};
    use crate::traits::ProviderHandler;
    use crate::transport::MemoryTransport;

    const KEY: ServiceKey = ServiceKey::new(5, 1, 1);
    const ECHO: Operation = Operation::new(KEY, 1, "echo", InteractionType::Request);
    const COUNT: Operation = Operation::new(KEY, 2, "count", InteractionType::Progress);
    const STORE: Operation = Operation::new(KEY, 3, "store", InteractionType::Submit);
    const JOB: Operation = Operation::new(KEY, 4, "job", InteractionType::Invoke);
    const FAIL: Operation = Operation::new(KEY, 5, "fail", InteractionType::Request);
    const SLOW: Operation = Operation::new(KEY, 6, "slow", InteractionType::Request);
    const EARLY_ACK: Operation = Operation::new(KEY, 7, "early-ack", InteractionType::Request);
    const GUARDED: Operation = Operation::new(KEY, 8, "guarded", InteractionType::Request);
    const FEED: Operation = Operation::new(KEY, 9, "feed", InteractionType::PubSub);

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new(
            KEY,
            vec![ECHO, COUNT, STORE, JOB, FAIL, SLOW, EARLY_ACK, GUARDED, FEED],
        )
    }

    #[derive(Default)]
    struct TestProvider {
        slow_started: Notify,
        illegal_ack: parking_lot::Mutex<Option<CourierError>>,
    }

    #[async_trait]
    impl ProviderHandler for TestProvider {
        async fn handle(
            &self,
            message: Message,
            interaction: ProviderInteraction,
        ) -> Result<(), StandardError> {
            let io = |e: CourierError| e.to_standard();
            match message.header.operation {
                1 | 8 => interaction.send_response(message.body).await.map_err(io),
                2 => {
                    let n = message.body.elements().first().and_then(rmpv::Value::as_u64).unwrap_or(0);
                    interaction.send_ack(()).await.map_err(io)?;
                    for i in 1..=n {
                        interaction.send_update(vec![rmpv::Value::from(i)]).await.map_err(io)?;
                    }
                    interaction.send_response(()).await.map_err(io)
                }
                3 => interaction.send_ack(()).await.map_err(io),
                4 => {
                    interaction.send_ack(()).await.map_err(io)?;
                    interaction.send_response(()).await.map_err(io)
                }
                6 => {
                    self.slow_started.notify_one();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    interaction.send_response(()).await.map_err(io)
                }
                7 => {
                    let err = interaction.send_ack(()).await.unwrap_err();
                    *self.illegal_ack.lock() = Some(err);
                    interaction.send_response(()).await.map_err(io)
                }
                _ => Err(StandardError::internal("boom")),
            }
        }
    }

    struct Pair {
        ctx: CourierContext,
        consumer: crate::binding::ConsumerBinding,
        provider: crate::binding::ProviderBinding,
        handler: Arc<TestProvider>,
    }

    async fn pair(execution: ExecutionConfig) -> Pair {
        let config = CourierConfig {
            execution,
            ..CourierConfig::default()
        };
        let ctx = CourierContext::new(config, Arc::new(MemoryTransport::new()));
        let handler = Arc::new(TestProvider::default());
        let provider = ctx
            .provider_manager()
            .unwrap()
            .create_provider(
                ProviderConfig::new(service(), handler.clone())
                    .with_endpoint(EndpointConfig::Exclusive(Some("provider".into()))),
            )
            .await
            .unwrap();
        let consumer = ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(ConsumerConfig::new(service(), provider.uri().clone()))
            .await
            .unwrap();
        Pair {
            ctx,
            consumer,
            provider,
            handler,
        }
    }

    fn both_models() -> [ExecutionConfig; 2] {
        [ExecutionConfig::sticky(3), ExecutionConfig::pool(3)]
    }

    #[tokio::test]
    async fn request_round_trip_under_both_models() {
        for execution in both_models() {
            let p = pair(execution).await;
            let response = p
                .consumer
                .request(&ECHO, vec![rmpv::Value::from("ping")])
                .await
                .unwrap();
            assert_eq!(response.header.stage, stage::REQUEST_RESPONSE);
            assert_eq!(response.body.leading_str(), Some("ping"));
            assert_eq!(p.consumer.stats().sent, 1);
            assert_eq!(p.consumer.stats().received, 1);
            assert_eq!(p.provider.stats().received, 1);
            p.ctx.close().await;
        }
    }

    #[tokio::test]
    async fn progress_streams_numbered_updates_then_response() {
        for execution in both_models() {
            let p = pair(execution).await;
            let listener = RecordingListener::new();
            let ack = p
                .consumer
                .progress(&COUNT, Some(listener.clone()), vec![rmpv::Value::from(3)])
                .await
                .unwrap();
            assert_eq!(ack.header.stage, stage::PROGRESS_ACK);
            let events = listener.wait_for(4).await;
            assert_eq!(
                events,
                vec![
                    Event::ProgressUpdate(1),
                    Event::ProgressUpdate(2),
                    Event::ProgressUpdate(3),
                    Event::ProgressResponse,
                ]
            );
            p.ctx.close().await;
        }
    }

    #[tokio::test]
    async fn submit_invoke_and_callback_request() {
        let p = pair(ExecutionConfig::default()).await;
        p.consumer.submit(&STORE, ()).await.unwrap();

        let listener = RecordingListener::new();
        let ack = p.consumer.invoke(&JOB, Some(listener.clone()), ()).await.unwrap();
        assert_eq!(ack.header.stage, stage::INVOKE_ACK);
        assert_eq!(listener.wait_for(1).await, vec![Event::InvokeResponse]);

        let callback = RecordingListener::new();
        p.consumer
            .async_request(&ECHO, Some(callback.clone()), ())
            .await
            .unwrap();
        p.consumer
            .async_submit(&STORE, Some(callback.clone()), ())
            .await
            .unwrap();
        let mut events = callback.wait_for(2).await;
        events.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(events, vec![Event::RequestResponse, Event::SubmitAck]);
        p.ctx.close().await;
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let p = pair(ExecutionConfig::default()).await;
        let err = p.consumer.request(&FAIL, ()).await.unwrap_err();
        match err {
            CourierError::Interaction { stage: s, error } => {
                assert_eq!(s, stage::REQUEST_RESPONSE);
                assert_eq!(error, StandardError::internal("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        p.ctx.close().await;
    }

    #[tokio::test]
    async fn reply_handle_rejects_out_of_pattern_stage() {
        let p = pair(ExecutionConfig::default()).await;
        p.consumer.request(&EARLY_ACK, ()).await.unwrap();
        let err = p.handler.illegal_ack.lock().take();
        assert!(matches!(err, Some(CourierError::IllegalStage { from: 1, .. })), "{err:?}");
        p.ctx.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn provider_close_drains_running_delivery() {
        let p = pair(ExecutionConfig::default()).await;
        let listener = RecordingListener::new();
        p.consumer
            .async_request(&SLOW, Some(listener.clone()), ())
            .await
            .unwrap();
        p.handler.slow_started.notified().await;
        assert_eq!(p.provider.stats().pending, 1);

        p.provider.close().await;
        assert_eq!(p.provider.state(), BindingState::Closed);
        assert_eq!(p.provider.stats().pending, 0);
        // The drained handler still answered.
        assert_eq!(listener.wait_for(1).await, vec![Event::RequestResponse]);
        assert_eq!(p.ctx.provider_manager().unwrap().bindings(), 0);

        // Closed provider endpoint: new requests fail to send.
        assert!(p.consumer.request(&ECHO, ()).await.is_err());
        p.ctx.close().await;
    }

    #[tokio::test]
    async fn consumer_and_provider_share_one_endpoint() {
        let ctx = CourierContext::new(CourierConfig::default(), Arc::new(MemoryTransport::new()));
        let bus = EndpointConfig::Shared("bus".into());
        let provider = ctx
            .provider_manager()
            .unwrap()
            .create_provider(
                ProviderConfig::new(service(), Arc::new(TestProvider::default()))
                    .with_endpoint(bus.clone()),
            )
            .await
            .unwrap();
        let consumer = ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(
                ConsumerConfig::new(service(), provider.uri().clone()).with_endpoint(bus.clone()),
            )
            .await
            .unwrap();
        assert_eq!(consumer.uri(), provider.uri());
        assert_eq!(ctx.endpoints().users("bus").await, 2);

        let response = consumer.request(&ECHO, vec![rmpv::Value::from("x")]).await.unwrap();
        assert_eq!(response.body.leading_str(), Some("x"));

        // A second provider for the same service on the same endpoint.
        let err = ctx
            .provider_manager()
            .unwrap()
            .create_provider(
                ProviderConfig::new(service(), Arc::new(TestProvider::default())).with_endpoint(bus),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::DuplicateBinding { role: Role::Provider, .. }));

        consumer.close().await;
        assert!(ctx.endpoints().contains("bus").await);
        provider.close().await;
        assert!(!ctx.endpoints().contains("bus").await);
        ctx.close().await;
    }

    #[tokio::test]
    async fn unsupported_qos_fails_creation_but_interaction_types_degrade() {
        let transport = MemoryTransport::new()
            .without_qos(QosLevel::Queued)
            .without_interaction(InteractionType::Progress);
        let ctx = CourierContext::new(CourierConfig::default(), Arc::new(transport));
        let consumers = ctx.consumer_manager().unwrap();
        let err = consumers
            .create_consumer(
                ConsumerConfig::new(service(), Uri::from("memory://x")).with_qos(QosLevel::Queued),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::UnsupportedQos(QosLevel::Queued)));
        assert_eq!(consumers.bindings(), 0);

        let handler = Arc::new(TestProvider::default());
        let provider = ctx
            .provider_manager()
            .unwrap()
            .create_provider(ProviderConfig::new(service(), handler))
            .await
            .unwrap();
        let consumer = consumers
            .create_consumer(ConsumerConfig::new(service(), provider.uri().clone()))
            .await
            .unwrap();
        let listener = RecordingListener::new();
        consumer
            .progress(&COUNT, Some(listener.clone()), vec![rmpv::Value::from(1)])
            .await
            .unwrap();
        assert_eq!(listener.wait_for(2).await.len(), 2);
        ctx.close().await;
    }

    /// Rejects initiating messages of one operation.
    struct DenyOperation(u16);

    impl AccessControl for DenyOperation {
        fn check(&self, message: Message) -> Result<Message, CourierError> {
            if message.header.operation == self.0 && message.header.is_initiation() {
                return Err(CourierError::Security(StandardError::with_text(
                    codes::AUTHORISATION_FAIL,
                    "operation denied",
                )));
            }
            Ok(message)
        }
    }

    #[tokio::test]
    async fn security_rejections_take_the_error_path() {
        let transport = MemoryTransport::new();
        let provider_ctx = CourierContext::with_access_control(
            CourierConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(DenyOperation(GUARDED.number)),
        );
        let provider = provider_ctx
            .provider_manager()
            .unwrap()
            .create_provider(ProviderConfig::new(service(), Arc::new(TestProvider::default())))
            .await
            .unwrap();

        // Inbound rejection at the provider comes back as an error reply.
        let consumer_ctx = CourierContext::new(CourierConfig::default(), Arc::new(transport.clone()));
        let consumer = consumer_ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(ConsumerConfig::new(service(), provider.uri().clone()))
            .await
            .unwrap();
        let err = consumer.request(&GUARDED, ()).await.unwrap_err();
        match err {
            CourierError::Interaction { error, .. } => assert_eq!(error.number, codes::AUTHORISATION_FAIL),
            other => panic!("unexpected {other:?}"),
        }

        // Outbound rejection at the sender fails synchronously.
        let strict_ctx = CourierContext::with_access_control(
            CourierConfig::default(),
            Arc::new(transport),
            Arc::new(DenyOperation(GUARDED.number)),
        );
        let strict = strict_ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(ConsumerConfig::new(service(), provider.uri().clone()))
            .await
            .unwrap();
        let err = strict.request(&GUARDED, ()).await.unwrap_err();
        assert!(matches!(err, CourierError::Security(_)));
        assert_eq!(strict.stats().sent, 0);

        strict_ctx.close().await;
        consumer_ctx.close().await;
        provider_ctx.close().await;
    }

    #[tokio::test]
    async fn pubsub_through_a_broker() {
        let ctx = CourierContext::new(CourierConfig::default(), Arc::new(MemoryTransport::new()));
        let engine = Arc::new(MemoryBroker::new());
        let broker = ctx
            .broker_manager()
            .unwrap()
            .create_broker(
                BrokerConfig::new(service(), engine.clone())
                    .with_endpoint(EndpointConfig::Exclusive(Some("broker".into()))),
            )
            .await
            .unwrap();
        let provider = ctx
            .provider_manager()
            .unwrap()
            .create_provider(
                ProviderConfig::new(service(), Arc::new(TestProvider::default()))
                    .with_broker_uri(broker.uri().clone()),
            )
            .await
            .unwrap();
        let consumer = ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(ConsumerConfig::new(service(), broker.uri().clone()))
            .await
            .unwrap();

        let subscriber = RecordingListener::new();
        consumer
            .register(&FEED, Subscription::new("sub-1", vec![]), Some(subscriber.clone()))
            .await
            .unwrap();
        assert_eq!(engine.subscriptions(), 1);

        let publisher = RecordingListener::new();
        provider
            .publish_register(&FEED, vec![], Some(publisher.clone()))
            .await
            .unwrap();
        provider
            .publish(&FEED, vec![rmpv::Value::from(1), rmpv::Value::from(2)])
            .await
            .unwrap();
        assert_eq!(subscriber.wait_for(1).await, vec![Event::Notify("sub-1".into())]);

        consumer.deregister(&FEED, vec!["sub-1".into()]).await.unwrap();
        assert_eq!(engine.subscriptions(), 0);

        provider.publish_deregister(&FEED).await.unwrap();
        // Publishing without a registration is refused locally.
        assert!(matches!(
            provider.publish(&FEED, vec![rmpv::Value::from(3)]).await,
            Err(CourierError::InvalidArgument(_))
        ));
        assert!(publisher.events().is_empty());
        assert_eq!(subscriber.events().len(), 1);
        ctx.close().await;
    }

    #[tokio::test]
    async fn provider_serves_as_private_broker_on_shared_endpoint() {
        let ctx = CourierContext::new(CourierConfig::default(), Arc::new(MemoryTransport::new()));
        let hub = EndpointConfig::Shared("hub".into());
        let provider = ctx
            .provider_manager()
            .unwrap()
            .create_provider(
                ProviderConfig::new(service(), Arc::new(TestProvider::default()))
                    .with_endpoint(hub.clone())
                    .with_private_broker(Arc::new(MemoryBroker::new())),
            )
            .await
            .unwrap();
        let consumer = ctx
            .consumer_manager()
            .unwrap()
            .create_consumer(ConsumerConfig::new(service(), provider.uri().clone()))
            .await
            .unwrap();

        let subscriber = RecordingListener::new();
        consumer
            .async_register(&FEED, Subscription::new("s", vec![rmpv::Value::from(7)]), Some(subscriber.clone()))
            .await
            .unwrap();
        assert_eq!(subscriber.wait_for(1).await, vec![Event::RegisterAck]);

        let publisher = RecordingListener::new();
        provider
            .async_publish_register(&FEED, vec![], Some(publisher.clone()))
            .await
            .unwrap();
        assert_eq!(publisher.wait_for(1).await, vec![Event::PublishRegisterAck]);

        provider
            .publish(&FEED, vec![rmpv::Value::from(6), rmpv::Value::from(7)])
            .await
            .unwrap();
        assert_eq!(
            subscriber.wait_for(2).await,
            vec![Event::RegisterAck, Event::Notify("s".into())]
        );
        ctx.close().await;
    }

    #[tokio::test]
    async fn close_is_reverse_order_and_final() {
        let p = pair(ExecutionConfig::default()).await;
        let listener = RecordingListener::new();
        p.consumer
            .continue_interaction(&JOB, stage::INVOKE_ACK, tokio::time::Instant::now(), courier_core::TransactionId(77), Some(listener.clone()))
            .await
            .unwrap();

        p.ctx.close().await;
        p.ctx.close().await;
        assert_eq!(p.consumer.state(), BindingState::Closed);
        assert_eq!(p.provider.state(), BindingState::Closed);
        assert_eq!(
            listener.events(),
            vec![Event::InvokeResponseError(StandardError::shutdown())]
        );
        assert!(matches!(p.ctx.consumer_manager(), Err(CourierError::Closed(_))));
        assert!(matches!(p.ctx.broker_manager(), Err(CourierError::Closed(_))));
    }
}
