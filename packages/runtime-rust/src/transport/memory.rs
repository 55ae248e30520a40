//! In-process loopback transport.
//!
//! Endpoints live in a hub keyed by `memory://name` URIs. Every message is
//! encoded with MsgPack on send and decoded again for the receiver, so the
//! two sides never share a message object. Deliveries to a stopped endpoint
//! are buffered until it starts again; closing an endpoint with buffered
//! messages reports `DESTINATION_LOST` to their senders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    codes, CourierError, InteractionType, Message, MessageReceiver, QosLevel, StandardError,
    Transport, TransportEndpoint, Uri,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

const SCHEME: &str = "memory://";

#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<Uri, Arc<EndpointInner>>>,
    fresh: AtomicU64,
}

impl Hub {
    fn lookup(&self, uri: &Uri) -> Option<Arc<EndpointInner>> {
        self.endpoints.lock().get(uri).cloned()
    }
}

#[derive(Default)]
struct Inbox {
    delivering: bool,
    buffer: VecDeque<Message>,
}

struct EndpointInner {
    uri: Uri,
    hub: Weak<Hub>,
    listener: RwLock<Option<Arc<dyn MessageReceiver>>>,
    inbox: Mutex<Inbox>,
    closed: AtomicBool,
}

impl EndpointInner {
    fn listener(&self) -> Option<Arc<dyn MessageReceiver>> {
        self.listener.read().clone()
    }

    fn deliver(&self, message: Message) {
        let listener = {
            let mut inbox = self.inbox.lock();
            match self.listener() {
                Some(listener) if inbox.delivering => listener,
                _ => {
                    trace!(uri = %self.uri, "endpoint not delivering, message buffered");
                    inbox.buffer.push_back(message);
                    return;
                }
            }
        };
        listener.on_message(message);
    }

    fn flush(&self) {
        let Some(listener) = self.listener() else {
            return;
        };
        let pending: Vec<Message> = {
            let mut inbox = self.inbox.lock();
            inbox.delivering = true;
            inbox.buffer.drain(..).collect()
        };
        for message in pending {
            listener.on_message(message);
        }
    }
}

/// Handle to one memory endpoint.
pub struct MemoryEndpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("uri", &self.inner.uri)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn transmit(number: u32, text: impl Into<String>) -> CourierError {
    CourierError::Transmit(StandardError::with_text(number, text))
}

/// Encodes and decodes `message` the way a wire transport would.
fn through_codec(message: &Message) -> Result<Message, CourierError> {
    let bytes = rmp_serde::to_vec_named(message)
        .map_err(|e| transmit(codes::BAD_ENCODING, e.to_string()))?;
    rmp_serde::from_slice(&bytes).map_err(|e| transmit(codes::BAD_ENCODING, e.to_string()))
}

#[async_trait]
impl TransportEndpoint for MemoryEndpoint {
    fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    fn set_listener(&self, listener: Arc<dyn MessageReceiver>) {
        *self.inner.listener.write() = Some(listener);
    }

    async fn send(&self, message: Message) -> Result<(), CourierError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CourierError::Closed("memory endpoint"));
        }
        let hub = self
            .inner
            .hub
            .upgrade()
            .ok_or(CourierError::Closed("memory transport"))?;
        let Some(destination) = hub.lookup(&message.header.to) else {
            return Err(transmit(
                codes::DESTINATION_UNKNOWN,
                format!("no endpoint {}", message.header.to),
            ));
        };
        if destination.closed.load(Ordering::Acquire) {
            return Err(transmit(
                codes::DESTINATION_LOST,
                format!("endpoint {} closed", message.header.to),
            ));
        }
        let copy = through_codec(&message)?;
        destination.deliver(copy);
        Ok(())
    }

    fn start_delivery(&self) {
        self.inner.flush();
    }

    fn stop_delivery(&self) {
        self.inner.inbox.lock().delivering = false;
    }

    async fn close(&self) -> Result<(), CourierError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let undelivered: Vec<Message> = {
            let mut inbox = self.inner.inbox.lock();
            inbox.delivering = false;
            inbox.buffer.drain(..).collect()
        };
        self.inner.listener.write().take();

        if let Some(hub) = self.inner.hub.upgrade() {
            for message in undelivered {
                let sender = hub.lookup(&message.header.from).and_then(|s| s.listener());
                match sender {
                    Some(listener) => listener.on_transmit_error(
                        message.header,
                        StandardError::with_text(
                            codes::DESTINATION_LOST,
                            format!("endpoint {} closed before delivery", self.inner.uri),
                        ),
                    ),
                    None => debug!(uri = %self.inner.uri, "undelivered message dropped on close"),
                }
            }
        }
        debug!(uri = %self.inner.uri, "memory endpoint closed");
        Ok(())
    }
}

/// Process-local transport. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    unsupported_qos: Vec<QosLevel>,
    unsupported_interactions: Vec<InteractionType>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("endpoints", &self.hub.endpoints.lock().len())
            .field("unsupported_qos", &self.unsupported_qos)
            .field("unsupported_interactions", &self.unsupported_interactions)
            .finish()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn without_qos(mut self, qos: QosLevel) -> Self {
        self.unsupported_qos.push(qos);
        self
    }

    #[must_use]
    pub fn without_interaction(mut self, interaction: InteractionType) -> Self {
        self.unsupported_interactions.push(interaction);
        self
    }

    /// Number of open endpoints.
    #[must_use]
    pub fn open_endpoints(&self) -> usize {
        self.hub
            .endpoints
            .lock()
            .values()
            .filter(|e| !e.closed.load(Ordering::Acquire))
            .count()
    }

    #[must_use]
    pub fn uri_for(name: &str) -> Uri {
        Uri::new(format!("{SCHEME}{name}"))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_supported_qos(&self, qos: QosLevel) -> bool {
        !self.unsupported_qos.contains(&qos)
    }

    fn is_supported_interaction_type(&self, interaction: InteractionType) -> bool {
        !self.unsupported_interactions.contains(&interaction)
    }

    async fn create_endpoint(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn TransportEndpoint>, CourierError> {
        let uri = match name {
            Some(name) => Self::uri_for(name),
            None => {
                let n = self.hub.fresh.fetch_add(1, Ordering::Relaxed);
                Self::uri_for(&format!("endpoint-{n}"))
            }
        };

        let mut endpoints = self.hub.endpoints.lock();
        if endpoints
            .get(&uri)
            .is_some_and(|e| !e.closed.load(Ordering::Acquire))
        {
            return Err(CourierError::InvalidArgument("memory endpoint name already in use"));
        }
        let inner = Arc::new(EndpointInner {
            uri: uri.clone(),
            hub: Arc::downgrade(&self.hub),
            listener: RwLock::new(None),
            inbox: Mutex::new(Inbox::default()),
            closed: AtomicBool::new(false),
        });
        endpoints.insert(uri, inner.clone());
        Ok(Arc::new(MemoryEndpoint { inner }))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{MessageHeader, ServiceKey, TransactionId};

    use super::*;

    #[derive(Default)]
    struct Sink {
        messages: Mutex<Vec<Message>>,
        errors: Mutex<Vec<(MessageHeader, StandardError)>>,
    }

    impl MessageReceiver for Sink {
        fn on_message(&self, message: Message) {
            self.messages.lock().push(message);
        }
        fn on_transmit_error(&self, header: MessageHeader, error: StandardError) {
            self.errors.lock().push((header, error));
        }
    }

    fn message(from: &Uri, to: &Uri, txn: u64) -> Message {
        let header = MessageHeader::initiation(
            from.clone(),
            to.clone(),
            InteractionType::Submit,
            TransactionId(txn),
            ServiceKey::new(1, 1, 1),
            3,
        );
        Message::new(header, vec![rmpv::Value::from("payload")])
    }

    #[tokio::test]
    async fn delivers_a_decoded_copy() {
        let transport = MemoryTransport::new();
        let a = transport.create_endpoint(Some("a")).await.unwrap();
        let b = transport.create_endpoint(Some("b")).await.unwrap();
        let sink = Arc::new(Sink::default());
        b.set_listener(sink.clone());
        b.start_delivery();

        let sent = message(a.uri(), b.uri(), 1);
        a.send(sent.clone()).await.unwrap();

        let got = sink.messages.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], sent);
    }

    #[tokio::test]
    async fn buffers_while_stopped() {
        let transport = MemoryTransport::new();
        let a = transport.create_endpoint(None).await.unwrap();
        let b = transport.create_endpoint(None).await.unwrap();
        assert_ne!(a.uri(), b.uri());
        let sink = Arc::new(Sink::default());
        b.set_listener(sink.clone());

        a.send(message(a.uri(), b.uri(), 1)).await.unwrap();
        a.send(message(a.uri(), b.uri(), 2)).await.unwrap();
        assert!(sink.messages.lock().is_empty());

        b.start_delivery();
        let ids: Vec<u64> = sink.messages.lock().iter().map(|m| m.header.transaction_id.0).collect();
        assert_eq!(ids, vec![1, 2]);

        b.stop_delivery();
        a.send(message(a.uri(), b.uri(), 3)).await.unwrap();
        assert_eq!(sink.messages.lock().len(), 2);
    }

    #[tokio::test]
    async fn unknown_and_closed_destinations_fail() {
        let transport = MemoryTransport::new();
        let a = transport.create_endpoint(Some("a")).await.unwrap();
        let b = transport.create_endpoint(Some("b")).await.unwrap();

        let err = a
            .send(message(a.uri(), &MemoryTransport::uri_for("nowhere"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Transmit(e) if e.number == codes::DESTINATION_UNKNOWN));

        b.close().await.unwrap();
        let err = a.send(message(a.uri(), b.uri(), 1)).await.unwrap_err();
        assert!(matches!(err, CourierError::Transmit(e) if e.number == codes::DESTINATION_LOST));
        assert_eq!(transport.open_endpoints(), 1);
    }

    #[tokio::test]
    async fn close_reports_buffered_messages_to_sender() {
        let transport = MemoryTransport::new();
        let a = transport.create_endpoint(Some("a")).await.unwrap();
        let b = transport.create_endpoint(Some("b")).await.unwrap();
        let sender = Arc::new(Sink::default());
        a.set_listener(sender.clone());

        a.send(message(a.uri(), b.uri(), 7)).await.unwrap();
        b.close().await.unwrap();

        let errors = sender.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0.transaction_id, TransactionId(7));
        assert_eq!(errors[0].1.number, codes::DESTINATION_LOST);
    }

    #[tokio::test]
    async fn names_are_reusable_after_close_only() {
        let transport = MemoryTransport::new();
        let a = transport.create_endpoint(Some("a")).await.unwrap();
        assert!(transport.create_endpoint(Some("a")).await.is_err());
        a.close().await.unwrap();
        assert!(transport.create_endpoint(Some("a")).await.is_ok());
    }

    #[test]
    fn capability_switches() {
        let transport = MemoryTransport::new()
            .without_qos(QosLevel::Queued)
            .without_interaction(InteractionType::Progress);
        assert!(transport.is_supported_qos(QosLevel::BestEffort));
        assert!(!transport.is_supported_qos(QosLevel::Queued));
        assert!(transport.is_supported_interaction_type(InteractionType::Invoke));
        assert!(!transport.is_supported_interaction_type(InteractionType::Progress));
    }
}
