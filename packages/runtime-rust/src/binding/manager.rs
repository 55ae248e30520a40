//! Binding managers: one per role, each owning a transaction registry, an
//! execution model, and a timeout watchdog shared by its bindings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    AccessControl, CourierError, MessageReceiver, QosLevel, Role, RoutingKey, ServiceDescriptor,
    Transport,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::broker::BrokerBinding;
use super::consumer::ConsumerBinding;
use super::core::{Attachment, BindingCore, BindingId};
use super::provider::ProviderBinding;
use crate::config::{BrokerConfig, ConsumerConfig, CourierConfig, EndpointConfig, ProviderConfig};
use crate::dispatch::SharedEndpoints;
use crate::execution::ExecutionModel;
use crate::transaction::{TransactionRegistry, Watchdog};

/// What a manager needs from its bindings at close time.
#[async_trait]
pub(crate) trait ManagedBinding: Send + Sync {
    async fn close(&self);
}

/// Collaborators a manager is built from.
#[derive(Clone)]
pub(crate) struct ManagerParts {
    pub config: CourierConfig,
    pub transport: Arc<dyn Transport>,
    pub access: Arc<dyn AccessControl>,
    pub endpoints: Arc<SharedEndpoints>,
}

pub(crate) struct ManagerCore {
    role: Role,
    parts: ManagerParts,
    registry: Arc<TransactionRegistry>,
    executor: Arc<ExecutionModel>,
    watchdog: tokio::sync::Mutex<Option<Watchdog>>,
    bindings: Mutex<HashMap<BindingId, Arc<dyn ManagedBinding>>>,
    next_binding: AtomicU64,
    closed: AtomicBool,
}

impl ManagerCore {
    /// Starts the execution model and the watchdog. Must be called inside a
    /// tokio runtime.
    pub(crate) fn start(role: Role, parts: ManagerParts) -> Arc<Self> {
        let executor = Arc::new(ExecutionModel::start(&parts.config.execution));
        let registry = Arc::new(TransactionRegistry::with_sink(executor.clone()));
        let watchdog = Watchdog::start(
            registry.clone(),
            executor.clone(),
            parts.config.transaction_timeout,
            parts.config.sweep_interval,
        );
        debug!(%role, mode = ?executor.mode(), "binding manager started");
        Arc::new(Self {
            role,
            parts,
            registry,
            executor,
            watchdog: tokio::sync::Mutex::new(Some(watchdog)),
            bindings: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub(crate) fn executor(&self) -> &Arc<ExecutionModel> {
        &self.executor
    }

    pub(crate) fn config(&self) -> &CourierConfig {
        &self.parts.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Checks the transport against what the service needs. Unsupported QoS
    /// fails; an unsupported interaction type is carried by the core state
    /// machines and only logged.
    pub(crate) fn validate(
        &self,
        service: &ServiceDescriptor,
        qos: QosLevel,
    ) -> Result<(), CourierError> {
        if !self.parts.transport.is_supported_qos(qos) {
            return Err(CourierError::UnsupportedQos(qos));
        }
        for interaction in service.interaction_types() {
            if !self.parts.transport.is_supported_interaction_type(interaction) {
                info!(
                    role = %self.role,
                    service = %service.key,
                    %interaction,
                    "transport lacks native support, interaction emulated by the core"
                );
            }
        }
        Ok(())
    }

    /// Opens an endpoint per `endpoint` and builds a binding on it.
    ///
    /// `build` receives the binding's core and a weak handle to the binding
    /// being constructed.
    pub(crate) async fn open<B, F>(
        self: &Arc<Self>,
        endpoint: &EndpointConfig,
        key: RoutingKey,
        build: F,
    ) -> Result<Arc<B>, CourierError>
    where
        B: MessageReceiver + ManagedBinding + 'static,
        F: FnOnce(BindingCore, &Weak<B>) -> B + Send,
    {
        if self.is_closed() {
            return Err(CourierError::Closed("binding manager"));
        }
        let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let binding: Arc<B> = match endpoint {
            EndpointConfig::Exclusive(name) => {
                let endpoint = self.parts.transport.create_endpoint(name.as_deref()).await?;
                let core = self.core_for(id, key, endpoint.clone(), Attachment::Exclusive);
                let binding = Arc::new_cyclic(|weak| build(core, weak));
                endpoint.set_listener(binding.clone());
                endpoint.start_delivery();
                binding
            }
            EndpointConfig::Shared(name) => {
                let attachment = Attachment::Shared {
                    name: name.clone(),
                    endpoints: self.parts.endpoints.clone(),
                };
                self.parts
                    .endpoints
                    .attach(&*self.parts.transport, name, self.role, key, |endpoint| {
                        let core = self.core_for(id, key, endpoint, attachment);
                        let binding = Arc::new_cyclic(|weak| build(core, weak));
                        let receiver: Arc<dyn MessageReceiver> = binding.clone();
                        (binding, receiver)
                    })
                    .await?
            }
        };

        self.bindings.lock().insert(id, binding.clone());
        if self.is_closed() {
            // Lost a race with close(): do not leave the binding behind.
            binding.close().await;
            return Err(CourierError::Closed("binding manager"));
        }
        debug!(role = %self.role, binding = id, %key, "binding created");
        Ok(binding)
    }

    fn core_for(
        self: &Arc<Self>,
        id: BindingId,
        key: RoutingKey,
        endpoint: Arc<dyn courier_core::TransportEndpoint>,
        attachment: Attachment,
    ) -> BindingCore {
        BindingCore::new(
            id,
            self.role,
            key,
            endpoint,
            attachment,
            self.parts.access.clone(),
            Arc::downgrade(self),
            self.parts.config.close_poll_interval,
            self.parts.config.drain_warn_after,
        )
    }

    /// Drops a closed binding from the table.
    pub(crate) fn forget(&self, id: BindingId) {
        self.bindings.lock().remove(&id);
    }

    /// Closes every binding, then the registry and the execution model.
    /// A second call is a no-op.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut watchdog) = self.watchdog.lock().await.take() {
            watchdog.stop().await;
        }
        let bindings: Vec<Arc<dyn ManagedBinding>> = self.bindings.lock().values().cloned().collect();
        for binding in bindings {
            binding.close().await;
        }
        self.registry.close();
        self.executor.shutdown().await;
        info!(role = %self.role, "binding manager closed");
    }
}

impl std::fmt::Debug for ManagerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerCore")
            .field("role", &self.role)
            .field("bindings", &self.binding_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Role managers
// ---------------------------------------------------------------------------

/// Creates consumer bindings.
#[derive(Debug, Clone)]
pub struct ConsumerManager {
    core: Arc<ManagerCore>,
}

impl ConsumerManager {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// # Errors
    ///
    /// Returns `CourierError::UnsupportedQos` if the transport cannot carry
    /// the requested QoS, `CourierError::DuplicateBinding` if the shared
    /// endpoint already has a consumer for the service, or a transport
    /// error.
    pub async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<ConsumerBinding, CourierError> {
        self.core.validate(&config.service, config.qos)?;
        ConsumerBinding::open(&self.core, config).await
    }

    #[must_use]
    pub fn bindings(&self) -> usize {
        self.core.binding_count()
    }

    /// Outstanding consumer interactions.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.core.registry().len()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

/// Creates provider bindings.
#[derive(Debug, Clone)]
pub struct ProviderManager {
    core: Arc<ManagerCore>,
}

impl ProviderManager {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// # Errors
    ///
    /// Same as [`ConsumerManager::create_consumer`].
    pub async fn create_provider(
        &self,
        config: ProviderConfig,
    ) -> Result<ProviderBinding, CourierError> {
        self.core.validate(&config.service, config.qos)?;
        ProviderBinding::open(&self.core, config).await
    }

    #[must_use]
    pub fn bindings(&self) -> usize {
        self.core.binding_count()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

/// Creates broker bindings.
#[derive(Debug, Clone)]
pub struct BrokerManager {
    core: Arc<ManagerCore>,
}

impl BrokerManager {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// # Errors
    ///
    /// Same as [`ConsumerManager::create_consumer`].
    pub async fn create_broker(&self, config: BrokerConfig) -> Result<BrokerBinding, CourierError> {
        self.core.validate(&config.service, config.qos)?;
        BrokerBinding::open(&self.core, config).await
    }

    #[must_use]
    pub fn bindings(&self) -> usize {
        self.core.binding_count()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
