//! Message header: the part of a message the core reads.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::interaction::InteractionType;
use crate::types::{QosLevel, ServiceKey, TransactionId, Uri};

/// Immutable routing and correlation data of a message.
///
/// Reply headers are derived with [`MessageHeader::reply`], which produces a
/// new header object rather than mutating the initiating one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub from: Uri,
    pub to: Uri,
    /// Milliseconds since the Unix epoch at which the message was built.
    pub timestamp_ms: u64,
    pub qos: QosLevel,
    pub priority: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub domain: Vec<String>,
    pub interaction_type: InteractionType,
    pub stage: u8,
    pub transaction_id: TransactionId,
    pub service: ServiceKey,
    pub operation: u16,
    pub is_error: bool,
    /// Per-transaction sequence number of progress updates (1-based).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u64>,
}

impl MessageHeader {
    /// Header of an initiating (stage 1) message.
    #[must_use]
    pub fn initiation(
        from: Uri,
        to: Uri,
        interaction_type: InteractionType,
        transaction_id: TransactionId,
        service: ServiceKey,
        operation: u16,
    ) -> Self {
        Self {
            from,
            to,
            timestamp_ms: now_ms(),
            qos: QosLevel::BestEffort,
            priority: 0,
            domain: Vec::new(),
            interaction_type,
            stage: 1,
            transaction_id,
            service,
            operation,
            is_error: false,
            sequence: None,
        }
    }

    /// Derives the header of a reply at `stage`: endpoints swapped, same
    /// transaction, fresh timestamp, no sequence number.
    #[must_use]
    pub fn reply(&self, stage: u8, is_error: bool) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            timestamp_ms: now_ms(),
            stage,
            is_error,
            sequence: None,
            ..self.clone()
        }
    }

    /// Same direction as `self`, at another stage. Used for synthetic events
    /// that stand in for a message the peer never sent.
    #[must_use]
    pub fn with_stage(&self, stage: u8, is_error: bool) -> Self {
        Self {
            stage,
            is_error,
            sequence: None,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QosLevel, priority: u32) -> Self {
        self.qos = qos;
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Vec<String>) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    #[must_use]
    pub fn is_initiation(&self) -> bool {
        self.stage == 1
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
