//! Message bodies. Opaque to the core apart from the error body and the
//! subscription id that leads a NOTIFY body.

use serde::{Deserialize, Serialize};

use crate::error::StandardError;

/// Body of a message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Body {
    #[default]
    Empty,
    /// Typed argument list.
    Elements(Vec<rmpv::Value>),
    /// Body already encoded by the codec collaborator.
    Encoded(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Error body of an error message.
    Error(StandardError),
}

impl Body {
    #[must_use]
    pub fn elements(&self) -> &[rmpv::Value] {
        match self {
            Self::Elements(values) => values,
            _ => &[],
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&StandardError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Leading string element, used as the subscription id of NOTIFY bodies.
    #[must_use]
    pub fn leading_str(&self) -> Option<&str> {
        self.elements().first().and_then(rmpv::Value::as_str)
    }
}

impl From<Vec<rmpv::Value>> for Body {
    fn from(values: Vec<rmpv::Value>) -> Self {
        Self::Elements(values)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Encoded(bytes)
    }
}

impl From<StandardError> for Body {
    fn from(error: StandardError) -> Self {
        Self::Error(error)
    }
}

impl From<()> for Body {
    fn from((): ()) -> Self {
        Self::Empty
    }
}
