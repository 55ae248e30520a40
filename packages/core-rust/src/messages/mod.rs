//! Messages exchanged between consumers, providers and brokers.
//!
//! A message is an immutable header plus an opaque body. The core reads the
//! header to correlate and route; bodies are produced and consumed by the
//! codec collaborator and by user code.

pub mod body;
pub mod header;

pub use body::Body;
pub use header::MessageHeader;

use serde::{Deserialize, Serialize};

use crate::error::{codes, StandardError};

/// A header and its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Body,
}

impl Message {
    #[must_use]
    pub fn new(header: MessageHeader, body: impl Into<Body>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Builds an error message from a header already flagged as error.
    #[must_use]
    pub fn error(header: MessageHeader, error: StandardError) -> Self {
        debug_assert!(header.is_error);
        Self {
            header,
            body: Body::Error(error),
        }
    }

    /// The error carried by an error message. An error message whose body is
    /// not an error body reports `UNKNOWN`.
    #[must_use]
    pub fn error_body(&self) -> StandardError {
        self.body
            .as_error()
            .cloned()
            .unwrap_or_else(|| StandardError::new(codes::UNKNOWN, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InteractionType, ServiceKey, TransactionId, Uri};

    #[test]
    fn error_body_defaults_to_unknown() {
        let header = MessageHeader::initiation(
            Uri::from("a"),
            Uri::from("b"),
            InteractionType::Request,
            TransactionId(1),
            ServiceKey::new(1, 1, 1),
            1,
        )
        .reply(2, true);
        let msg = Message::new(header, Body::Empty);
        assert_eq!(msg.error_body().number, codes::UNKNOWN);
    }
}
