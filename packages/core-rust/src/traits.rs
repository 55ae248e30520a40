use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CourierError, StandardError};
use crate::interaction::InteractionType;
use crate::messages::{Message, MessageHeader};
use crate::types::{QosLevel, Uri};

/// Receives what a transport endpoint delivers.
///
/// Implemented by bindings (exclusive endpoints) and by the message
/// dispatcher (shared endpoints). Both methods must return quickly: they
/// only enqueue work.
pub trait MessageReceiver: Send + Sync {
    /// An inbound message.
    fn on_message(&self, message: Message);

    /// A message previously handed to the endpoint could not be delivered.
    /// `header` is the header of the failed message.
    fn on_transmit_error(&self, header: MessageHeader, error: StandardError);
}

/// One transport endpoint. The core passes typed headers and bodies; any
/// encoding happens behind this trait.
#[async_trait]
pub trait TransportEndpoint: Send + Sync {
    fn uri(&self) -> &Uri;

    /// Installs the receiver of inbound deliveries, replacing any previous one.
    fn set_listener(&self, listener: Arc<dyn MessageReceiver>);

    /// Transmits one message.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Transmit` when the message cannot be handed to
    /// the destination.
    async fn send(&self, message: Message) -> Result<(), CourierError>;

    /// Transmits several messages. Stops at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first transmit error.
    async fn send_batch(&self, messages: Vec<Message>) -> Result<(), CourierError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Starts (or resumes) delivery to the installed receiver.
    fn start_delivery(&self);

    /// Suspends delivery. Messages arriving meanwhile are the transport's
    /// concern.
    fn stop_delivery(&self);

    /// Releases the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to release its resources.
    async fn close(&self) -> Result<(), CourierError>;
}

/// Factory for endpoints plus the capability questions binding managers ask.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_supported_qos(&self, qos: QosLevel) -> bool;

    fn is_supported_interaction_type(&self, interaction: InteractionType) -> bool;

    /// Creates an endpoint. `name` selects a well-known address; `None` asks
    /// the transport for a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be created.
    async fn create_endpoint(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn TransportEndpoint>, CourierError>;
}

/// Access-control collaborator, consulted before every send and before every
/// inbound message reaches an interaction.
pub trait AccessControl: Send + Sync {
    /// Returns the (possibly rewritten) message, or a security error.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Security` to reject the message.
    fn check(&self, message: Message) -> Result<Message, CourierError>;
}

/// Access control that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(&self, message: Message) -> Result<Message, CourierError> {
        Ok(message)
    }
}
