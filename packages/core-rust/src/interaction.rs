//! Interaction patterns and their stage numbers.
//!
//! Stage numbers are carried in every message header. Stage 1 is always the
//! initiating stage of a pattern; pub/sub uses a wider numbering because one
//! pattern bundles several independent exchanges (register, publish, notify).

use std::fmt;

use serde::{Deserialize, Serialize};

/// The remote-interaction patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InteractionType {
    /// Fire-and-forget.
    Send,
    /// Acknowledged submit.
    Submit,
    /// Request/response.
    Request,
    /// Acknowledged request with a later response.
    Invoke,
    /// Acknowledged request streaming updates before the response.
    Progress,
    /// Publish/subscribe, including the broker legs.
    PubSub,
}

impl InteractionType {
    pub const ALL: [Self; 6] = [
        Self::Send,
        Self::Submit,
        Self::Request,
        Self::Invoke,
        Self::Progress,
        Self::PubSub,
    ];

    /// Every stage number a message of this pattern may carry.
    #[must_use]
    pub const fn stages(self) -> &'static [u8] {
        match self {
            Self::Send => &[stage::SEND],
            Self::Submit => &[stage::SUBMIT, stage::SUBMIT_ACK],
            Self::Request => &[stage::REQUEST, stage::REQUEST_RESPONSE],
            Self::Invoke => &[stage::INVOKE, stage::INVOKE_ACK, stage::INVOKE_RESPONSE],
            Self::Progress => &[
                stage::PROGRESS,
                stage::PROGRESS_ACK,
                stage::PROGRESS_UPDATE,
                stage::PROGRESS_RESPONSE,
            ],
            Self::PubSub => &[
                stage::REGISTER,
                stage::REGISTER_ACK,
                stage::PUBLISH_REGISTER,
                stage::PUBLISH_REGISTER_ACK,
                stage::PUBLISH,
                stage::NOTIFY,
                stage::DEREGISTER,
                stage::DEREGISTER_ACK,
                stage::PUBLISH_DEREGISTER,
                stage::PUBLISH_DEREGISTER_ACK,
            ],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Submit => "submit",
            Self::Request => "request",
            Self::Invoke => "invoke",
            Self::Progress => "progress",
            Self::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage numbers, grouped per pattern.
pub mod stage {
    pub const SEND: u8 = 1;

    pub const SUBMIT: u8 = 1;
    pub const SUBMIT_ACK: u8 = 2;

    pub const REQUEST: u8 = 1;
    pub const REQUEST_RESPONSE: u8 = 2;

    pub const INVOKE: u8 = 1;
    pub const INVOKE_ACK: u8 = 2;
    pub const INVOKE_RESPONSE: u8 = 3;

    pub const PROGRESS: u8 = 1;
    pub const PROGRESS_ACK: u8 = 2;
    pub const PROGRESS_UPDATE: u8 = 3;
    pub const PROGRESS_RESPONSE: u8 = 4;

    pub const REGISTER: u8 = 1;
    pub const REGISTER_ACK: u8 = 2;
    pub const PUBLISH_REGISTER: u8 = 3;
    pub const PUBLISH_REGISTER_ACK: u8 = 4;
    pub const PUBLISH: u8 = 5;
    pub const NOTIFY: u8 = 6;
    pub const DEREGISTER: u8 = 7;
    pub const DEREGISTER_ACK: u8 = 8;
    pub const PUBLISH_DEREGISTER: u8 = 9;
    pub const PUBLISH_DEREGISTER_ACK: u8 = 10;
}

/// Human-readable name of a stage, for logs and error text.
#[must_use]
pub fn stage_name(interaction: InteractionType, s: u8) -> &'static str {
    match (interaction, s) {
        (InteractionType::Send, stage::SEND) => "SEND",
        (InteractionType::Submit, stage::SUBMIT) => "SUBMIT",
        (InteractionType::Submit, stage::SUBMIT_ACK) => "SUBMIT_ACK",
        (InteractionType::Request, stage::REQUEST) => "REQUEST",
        (InteractionType::Request, stage::REQUEST_RESPONSE) => "REQUEST_RESPONSE",
        (InteractionType::Invoke, stage::INVOKE) => "INVOKE",
        (InteractionType::Invoke, stage::INVOKE_ACK) => "INVOKE_ACK",
        (InteractionType::Invoke, stage::INVOKE_RESPONSE) => "INVOKE_RESPONSE",
        (InteractionType::Progress, stage::PROGRESS) => "PROGRESS",
        (InteractionType::Progress, stage::PROGRESS_ACK) => "PROGRESS_ACK",
        (InteractionType::Progress, stage::PROGRESS_UPDATE) => "PROGRESS_UPDATE",
        (InteractionType::Progress, stage::PROGRESS_RESPONSE) => "PROGRESS_RESPONSE",
        (InteractionType::PubSub, stage::REGISTER) => "REGISTER",
        (InteractionType::PubSub, stage::REGISTER_ACK) => "REGISTER_ACK",
        (InteractionType::PubSub, stage::PUBLISH_REGISTER) => "PUBLISH_REGISTER",
        (InteractionType::PubSub, stage::PUBLISH_REGISTER_ACK) => "PUBLISH_REGISTER_ACK",
        (InteractionType::PubSub, stage::PUBLISH) => "PUBLISH",
        (InteractionType::PubSub, stage::NOTIFY) => "NOTIFY",
        (InteractionType::PubSub, stage::DEREGISTER) => "DEREGISTER",
        (InteractionType::PubSub, stage::DEREGISTER_ACK) => "DEREGISTER_ACK",
        (InteractionType::PubSub, stage::PUBLISH_DEREGISTER) => "PUBLISH_DEREGISTER",
        (InteractionType::PubSub, stage::PUBLISH_DEREGISTER_ACK) => "PUBLISH_DEREGISTER_ACK",
        _ => "UNKNOWN",
    }
}
