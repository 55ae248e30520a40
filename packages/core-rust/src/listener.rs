//! Callback surface of callback-driven interactions.
//!
//! One method per (pattern, stage, success|error) combination. Every method
//! has an empty default so listeners only implement what they consume.

use crate::error::StandardError;
use crate::messages::{Message, MessageHeader};

#[allow(unused_variables)]
pub trait InteractionListener: Send + Sync {
    fn submit_ack_received(&self, message: &Message) {}
    fn submit_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    fn request_response_received(&self, message: &Message) {}
    fn request_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    fn invoke_ack_received(&self, message: &Message) {}
    fn invoke_ack_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn invoke_response_received(&self, message: &Message) {}
    fn invoke_response_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    fn progress_ack_received(&self, message: &Message) {}
    fn progress_ack_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn progress_update_received(&self, message: &Message) {}
    fn progress_update_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn progress_response_received(&self, message: &Message) {}
    fn progress_response_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    fn register_ack_received(&self, message: &Message) {}
    fn register_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn deregister_ack_received(&self, message: &Message) {}
    fn deregister_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    /// A publication matching `subscription_id`.
    fn notify_received(&self, subscription_id: &str, message: &Message) {}
    fn notify_error_received(&self, header: &MessageHeader, error: &StandardError) {}

    fn publish_register_ack_received(&self, message: &Message) {}
    fn publish_register_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn publish_error_received(&self, header: &MessageHeader, error: &StandardError) {}
    fn publish_deregister_ack_received(&self, message: &Message) {}
    fn publish_deregister_error_received(&self, header: &MessageHeader, error: &StandardError) {}
}
