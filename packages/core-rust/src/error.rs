//! Error taxonomy shared by the core and its collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Role, RoutingKey, TransactionId};
use crate::QosLevel;

/// Standard error numbers carried inside error messages.
pub mod codes {
    pub const DELIVERY_FAILED: u32 = 65536;
    pub const DELIVERY_TIMEDOUT: u32 = 65537;
    pub const DELIVERY_DELAYED: u32 = 65538;
    pub const DESTINATION_UNKNOWN: u32 = 65539;
    pub const DESTINATION_TRANSIENT: u32 = 65540;
    pub const DESTINATION_LOST: u32 = 65541;
    pub const AUTHENTICATION_FAIL: u32 = 65542;
    pub const AUTHORISATION_FAIL: u32 = 65543;
    pub const ENCRYPTION_FAIL: u32 = 65544;
    pub const UNSUPPORTED_AREA: u32 = 65545;
    pub const UNSUPPORTED_OPERATION: u32 = 65546;
    pub const UNSUPPORTED_VERSION: u32 = 65547;
    pub const BAD_ENCODING: u32 = 65548;
    pub const INTERNAL: u32 = 65549;
    pub const UNKNOWN: u32 = 65550;
    pub const INCORRECT_STATE: u32 = 65551;
    pub const TOO_MANY: u32 = 65552;
    pub const SHUTDOWN: u32 = 65553;
}

/// Error body travelling inside an error message.
///
/// Either produced by a provider (an application error) or synthesized by the
/// core (timeout, shutdown, protocol violation, lost updates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardError {
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<rmpv::Value>,
}

impl StandardError {
    #[must_use]
    pub fn new(number: u32, extra: Option<rmpv::Value>) -> Self {
        Self { number, extra }
    }

    /// Error with a human-readable string as extra information.
    #[must_use]
    pub fn with_text(number: u32, text: impl Into<String>) -> Self {
        Self::new(number, Some(rmpv::Value::from(text.into())))
    }

    #[must_use]
    pub fn shutdown() -> Self {
        Self::with_text(codes::SHUTDOWN, "closed")
    }

    #[must_use]
    pub fn timed_out() -> Self {
        Self::with_text(codes::DELIVERY_TIMEDOUT, "transaction timed out")
    }

    #[must_use]
    pub fn incorrect_state(text: impl Into<String>) -> Self {
        Self::with_text(codes::INCORRECT_STATE, text)
    }

    #[must_use]
    pub fn delivery_failed(text: impl Into<String>) -> Self {
        Self::with_text(codes::DELIVERY_FAILED, text)
    }

    /// Synthetic update error reporting how many updates never arrived.
    #[must_use]
    pub fn updates_lost(count: u64) -> Self {
        Self::new(codes::DELIVERY_FAILED, Some(rmpv::Value::from(count)))
    }

    #[must_use]
    pub fn internal(text: impl Into<String>) -> Self {
        Self::with_text(codes::INTERNAL, text)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.number == codes::DELIVERY_TIMEDOUT
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.number == codes::SHUTDOWN
    }

    /// Returns the standard name of the error number, if it is one.
    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.number {
            codes::DELIVERY_FAILED => "DELIVERY_FAILED",
            codes::DELIVERY_TIMEDOUT => "DELIVERY_TIMEDOUT",
            codes::DELIVERY_DELAYED => "DELIVERY_DELAYED",
            codes::DESTINATION_UNKNOWN => "DESTINATION_UNKNOWN",
            codes::DESTINATION_TRANSIENT => "DESTINATION_TRANSIENT",
            codes::DESTINATION_LOST => "DESTINATION_LOST",
            codes::AUTHENTICATION_FAIL => "AUTHENTICATION_FAIL",
            codes::AUTHORISATION_FAIL => "AUTHORISATION_FAIL",
            codes::ENCRYPTION_FAIL => "ENCRYPTION_FAIL",
            codes::UNSUPPORTED_AREA => "UNSUPPORTED_AREA",
            codes::UNSUPPORTED_OPERATION => "UNSUPPORTED_OPERATION",
            codes::UNSUPPORTED_VERSION => "UNSUPPORTED_VERSION",
            codes::BAD_ENCODING => "BAD_ENCODING",
            codes::INTERNAL => "INTERNAL",
            codes::UNKNOWN => "UNKNOWN",
            codes::INCORRECT_STATE => "INCORRECT_STATE",
            codes::TOO_MANY => "TOO_MANY",
            codes::SHUTDOWN => "SHUTDOWN",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StandardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "error {}", self.number)?,
        }
        if let Some(extra) = &self.extra {
            write!(f, " ({extra})")?;
        }
        Ok(())
    }
}

/// Errors raised by the core to its callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CourierError {
    /// A required parameter was missing or inconsistent. Raised before any
    /// transaction id is allocated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{0} is closed")]
    Closed(&'static str),
    #[error("interaction already running for transaction {0}")]
    AlreadyRunning(TransactionId),
    #[error("a {role} binding for {key} is already attached to {endpoint}")]
    DuplicateBinding {
        role: Role,
        key: RoutingKey,
        endpoint: String,
    },
    #[error("transport does not support QoS level {0:?}")]
    UnsupportedQos(QosLevel),
    #[error("illegal stage transition {from} -> {to}")]
    IllegalStage { from: u8, to: u8 },
    #[error("security check rejected message: {0}")]
    Security(StandardError),
    /// Delivery failed below the core.
    #[error("transmit failed: {0}")]
    Transmit(StandardError),
    /// The interaction finished with an error at `stage`: a provider error,
    /// or a synthetic timeout/shutdown/protocol error.
    #[error("interaction failed at stage {stage}: {error}")]
    Interaction { stage: u8, error: StandardError },
}

impl CourierError {
    /// The standard error carried by this error, converting local failures to
    /// the closest standard number.
    #[must_use]
    pub fn to_standard(&self) -> StandardError {
        match self {
            Self::Security(e) | Self::Transmit(e) | Self::Interaction { error: e, .. } => e.clone(),
            Self::Closed(_) => StandardError::shutdown(),
            Self::IllegalStage { .. } | Self::AlreadyRunning(_) => {
                StandardError::incorrect_state(self.to_string())
            }
            Self::InvalidArgument(_)
            | Self::DuplicateBinding { .. }
            | Self::UnsupportedQos(_) => StandardError::internal(self.to_string()),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Interaction { error, .. } if error.is_timeout())
    }
}
