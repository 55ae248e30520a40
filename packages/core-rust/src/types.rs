use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interaction::InteractionType;

/// Transport-level address of an endpoint (e.g. `memory://provider-a`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier correlating every message of one exchange.
///
/// Allocated by the transaction registry; never reused while outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(area, service, version)` triple identifying a service.
///
/// Doubles as the routing key a dispatcher uses to find the binding that
/// serves a message on a shared endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub area: u16,
    pub service: u16,
    pub version: u8,
}

impl ServiceKey {
    #[must_use]
    pub const fn new(area: u16, service: u16, version: u8) -> Self {
        Self {
            area,
            service,
            version,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}v{}", self.area, self.service, self.version)
    }
}

/// Routing key alias used by the dispatcher tables.
pub type RoutingKey = ServiceKey;

/// Quality-of-service level requested for the messages of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QosLevel {
    /// No delivery guarantee.
    BestEffort,
    /// Delivery is acknowledged by the transport.
    Assured,
    /// Messages are queued while the destination is unavailable.
    Queued,
    /// Delivery must happen within a time window.
    Timely,
}

/// Role a binding plays on its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Consumer,
    Provider,
    Broker,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Provider => "provider",
            Self::Broker => "broker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one operation of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub service: ServiceKey,
    pub number: u16,
    pub name: &'static str,
    pub interaction: InteractionType,
}

impl Operation {
    #[must_use]
    pub const fn new(
        service: ServiceKey,
        number: u16,
        name: &'static str,
        interaction: InteractionType,
    ) -> Self {
        Self {
            service,
            number,
            name,
            interaction,
        }
    }
}

/// A service together with the operations it exposes.
///
/// Binding managers inspect the operation list to check which interaction
/// types the transport has to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub key: ServiceKey,
    pub operations: Vec<Operation>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(key: ServiceKey, operations: Vec<Operation>) -> Self {
        Self { key, operations }
    }

    /// Returns the distinct interaction types used by the operations.
    #[must_use]
    pub fn interaction_types(&self) -> Vec<InteractionType> {
        let mut types: Vec<InteractionType> = Vec::new();
        for op in &self.operations {
            if !types.contains(&op.interaction) {
                types.push(op.interaction);
            }
        }
        types
    }
}

/// Identifier of a subscription inside a register exchange.
pub type SubscriptionId = String;

/// A subscription request: an id plus opaque entity filters for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filters: Vec<rmpv::Value>,
}

impl Subscription {
    #[must_use]
    pub fn new(id: impl Into<SubscriptionId>, filters: Vec<rmpv::Value>) -> Self {
        Self {
            id: id.into(),
            filters,
        }
    }
}
