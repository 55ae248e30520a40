//! Application-side contracts implemented by service code.

use async_trait::async_trait;
use courier_core::{
    Message, MessageHeader, StandardError, Subscription, SubscriptionId, TransactionId, Uri,
};

use crate::binding::ProviderInteraction;

/// Serves the operations of one provided service.
///
/// Called on the execution lane of the transaction, once per initiating
/// message. Replies go through `interaction`; returning `Err` before a
/// terminal reply was sent makes the runtime answer with that error at the
/// next expected stage.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns the error to report to the consumer.
    async fn handle(
        &self,
        message: Message,
        interaction: ProviderInteraction,
    ) -> Result<(), StandardError>;
}

/// Publications to deliver to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyBatch {
    pub subscriber: Uri,
    /// Transaction of the subscriber's register exchange.
    pub transaction_id: TransactionId,
    pub subscription_id: SubscriptionId,
    pub updates: Vec<rmpv::Value>,
}

/// Matching engine behind a broker binding or a provider's private broker.
///
/// `header` is the header of the inbound request; `from` identifies the
/// subscriber or publisher.
#[async_trait]
pub trait BrokerHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns the error reported in the REGISTER_ACK.
    async fn register(
        &self,
        header: &MessageHeader,
        subscription: Subscription,
    ) -> Result<(), StandardError>;

    /// # Errors
    ///
    /// Returns the error reported in the DEREGISTER_ACK.
    async fn deregister(
        &self,
        header: &MessageHeader,
        ids: Vec<SubscriptionId>,
    ) -> Result<(), StandardError>;

    /// # Errors
    ///
    /// Returns the error reported in the PUBLISH_REGISTER_ACK.
    async fn publish_register(
        &self,
        header: &MessageHeader,
        keys: Vec<rmpv::Value>,
    ) -> Result<(), StandardError>;

    /// # Errors
    ///
    /// Returns the error reported in the PUBLISH_DEREGISTER_ACK.
    async fn publish_deregister(&self, header: &MessageHeader) -> Result<(), StandardError>;

    /// Matches a publication against the subscriptions and returns what to
    /// notify.
    ///
    /// # Errors
    ///
    /// Returns the error reported back to the publisher as a PUBLISH error.
    async fn publish(
        &self,
        header: &MessageHeader,
        updates: Vec<rmpv::Value>,
    ) -> Result<Vec<NotifyBatch>, StandardError>;
}
