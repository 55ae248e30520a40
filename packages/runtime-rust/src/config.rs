//! Configuration types for the courier runtime.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{QosLevel, ServiceDescriptor, Uri};

use crate::traits::{BrokerHandler, ProviderHandler};

/// Runtime-level configuration shared by every binding manager of a context.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Concurrency substrate for inbound deliveries.
    pub execution: ExecutionConfig,
    /// Inactivity after which an interaction is failed with a timeout.
    pub transaction_timeout: Duration,
    /// Period of the timeout watchdog.
    pub sweep_interval: Duration,
    /// Poll interval used while a closing binding drains its deliveries.
    pub close_poll_interval: Duration,
    /// A drain taking longer than this is reported once at warn level.
    pub drain_warn_after: Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            transaction_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            close_poll_interval: Duration::from_millis(10),
            drain_warn_after: Duration::from_secs(5),
        }
    }
}

/// Which execution model a binding manager runs inbound deliveries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Fixed set of single-lane executors; a transaction sticks to one lane.
    Sticky { executors: usize },
    /// Shared worker pool; a task waits while its transaction is running.
    Pool { workers: usize },
}

/// Execution-model configuration.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sticky { executors: 4 },
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub fn sticky(executors: usize) -> Self {
        Self {
            mode: ExecutionMode::Sticky {
                executors: executors.max(1),
            },
        }
    }

    #[must_use]
    pub fn pool(workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Pool {
                workers: workers.max(1),
            },
        }
    }
}

/// Where a binding's transport endpoint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointConfig {
    /// A private endpoint, optionally at a well-known name.
    Exclusive(Option<String>),
    /// A named endpoint shared with other bindings through a dispatcher.
    Shared(String),
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::Exclusive(None)
    }
}

/// Consumer binding configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub service: ServiceDescriptor,
    /// Provider (or broker, for pub/sub) the consumer talks to.
    pub target: Uri,
    pub endpoint: EndpointConfig,
    pub qos: QosLevel,
    pub priority: u32,
    pub domain: Vec<String>,
}

impl ConsumerConfig {
    #[must_use]
    pub fn new(service: ServiceDescriptor, target: Uri) -> Self {
        Self {
            service,
            target,
            endpoint: EndpointConfig::default(),
            qos: QosLevel::BestEffort,
            priority: 0,
            domain: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Vec<String>) -> Self {
        self.domain = domain;
        self
    }
}

/// Provider binding configuration.
#[derive(Clone)]
pub struct ProviderConfig {
    pub service: ServiceDescriptor,
    pub endpoint: EndpointConfig,
    pub qos: QosLevel,
    pub priority: u32,
    pub handler: Arc<dyn ProviderHandler>,
    /// Matching engine served by this provider when no broker is attached.
    pub private_broker: Option<Arc<dyn BrokerHandler>>,
    /// Broker that publications are sent to. Defaults to the provider's own
    /// endpoint when it carries a private broker.
    pub broker_uri: Option<Uri>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("service", &self.service.key)
            .field("endpoint", &self.endpoint)
            .field("qos", &self.qos)
            .field("private_broker", &self.private_broker.is_some())
            .field("broker_uri", &self.broker_uri)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    #[must_use]
    pub fn new(service: ServiceDescriptor, handler: Arc<dyn ProviderHandler>) -> Self {
        Self {
            service,
            endpoint: EndpointConfig::default(),
            qos: QosLevel::BestEffort,
            priority: 0,
            handler,
            private_broker: None,
            broker_uri: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_private_broker(mut self, broker: Arc<dyn BrokerHandler>) -> Self {
        self.private_broker = Some(broker);
        self
    }

    #[must_use]
    pub fn with_broker_uri(mut self, uri: Uri) -> Self {
        self.broker_uri = Some(uri);
        self
    }
}

/// Broker binding configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    pub service: ServiceDescriptor,
    pub endpoint: EndpointConfig,
    pub qos: QosLevel,
    pub handler: Arc<dyn BrokerHandler>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("service", &self.service.key)
            .field("endpoint", &self.endpoint)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn new(service: ServiceDescriptor, handler: Arc<dyn BrokerHandler>) -> Self {
        Self {
            service,
            endpoint: EndpointConfig::default(),
            qos: QosLevel::BestEffort,
            handler,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }
}
