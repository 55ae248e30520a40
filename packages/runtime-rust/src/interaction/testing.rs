//! Test fixtures: a listener that records every event it receives.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{InteractionListener, Message, MessageHeader, StandardError};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SubmitAck,
    SubmitError(StandardError),
    RequestResponse,
    RequestError(StandardError),
    InvokeAck,
    InvokeAckError(StandardError),
    InvokeResponse,
    InvokeResponseError(StandardError),
    ProgressAck,
    ProgressAckError(StandardError),
    /// Carries the update's first body element, or its sequence number.
    ProgressUpdate(u64),
    ProgressUpdateError(StandardError),
    ProgressResponse,
    ProgressResponseError(StandardError),
    RegisterAck,
    RegisterError(StandardError),
    DeregisterAck,
    DeregisterError(StandardError),
    Notify(String),
    NotifyError(StandardError),
    PublishRegisterAck,
    PublishRegisterError(StandardError),
    PublishError(StandardError),
    PublishDeregisterAck,
    PublishDeregisterError(StandardError),
}

impl Event {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::SubmitError(_)
                | Self::RequestError(_)
                | Self::InvokeAckError(_)
                | Self::InvokeResponseError(_)
                | Self::ProgressAckError(_)
                | Self::ProgressUpdateError(_)
                | Self::ProgressResponseError(_)
                | Self::RegisterError(_)
                | Self::DeregisterError(_)
                | Self::NotifyError(_)
                | Self::PublishRegisterError(_)
                | Self::PublishError(_)
                | Self::PublishDeregisterError(_)
        )
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
        self.changed.notify_waiters();
    }

    /// Waits until at least `count` events were recorded, or panics after
    /// two seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let notified = self.changed.notified();
            {
                let events = self.events.lock();
                if events.len() >= count {
                    return events.clone();
                }
            }
            assert!(
                tokio::time::timeout_at(deadline, notified).await.is_ok(),
                "timed out waiting for {count} events, got {:?}",
                self.events()
            );
        }
    }
}

fn update_value(message: &Message) -> u64 {
    message
        .body
        .elements()
        .first()
        .and_then(rmpv::Value::as_u64)
        .or(message.header.sequence)
        .unwrap_or(0)
}

impl InteractionListener for RecordingListener {
    fn submit_ack_received(&self, _message: &Message) {
        self.push(Event::SubmitAck);
    }
    fn submit_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::SubmitError(error.clone()));
    }
    fn request_response_received(&self, _message: &Message) {
        self.push(Event::RequestResponse);
    }
    fn request_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::RequestError(error.clone()));
    }
    fn invoke_ack_received(&self, _message: &Message) {
        self.push(Event::InvokeAck);
    }
    fn invoke_ack_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::InvokeAckError(error.clone()));
    }
    fn invoke_response_received(&self, _message: &Message) {
        self.push(Event::InvokeResponse);
    }
    fn invoke_response_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::InvokeResponseError(error.clone()));
    }
    fn progress_ack_received(&self, _message: &Message) {
        self.push(Event::ProgressAck);
    }
    fn progress_ack_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::ProgressAckError(error.clone()));
    }
    fn progress_update_received(&self, message: &Message) {
        self.push(Event::ProgressUpdate(update_value(message)));
    }
    fn progress_update_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::ProgressUpdateError(error.clone()));
    }
    fn progress_response_received(&self, _message: &Message) {
        self.push(Event::ProgressResponse);
    }
    fn progress_response_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::ProgressResponseError(error.clone()));
    }
    fn register_ack_received(&self, _message: &Message) {
        self.push(Event::RegisterAck);
    }
    fn register_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::RegisterError(error.clone()));
    }
    fn deregister_ack_received(&self, _message: &Message) {
        self.push(Event::DeregisterAck);
    }
    fn deregister_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::DeregisterError(error.clone()));
    }
    fn notify_received(&self, subscription_id: &str, _message: &Message) {
        self.push(Event::Notify(subscription_id.to_string()));
    }
    fn notify_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::NotifyError(error.clone()));
    }
    fn publish_register_ack_received(&self, _message: &Message) {
        self.push(Event::PublishRegisterAck);
    }
    fn publish_register_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::PublishRegisterError(error.clone()));
    }
    fn publish_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::PublishError(error.clone()));
    }
    fn publish_deregister_ack_received(&self, _message: &Message) {
        self.push(Event::PublishDeregisterAck);
    }
    fn publish_deregister_error_received(&self, _header: &MessageHeader, error: &StandardError) {
        self.push(Event::PublishDeregisterError(error.clone()));
    }
}
