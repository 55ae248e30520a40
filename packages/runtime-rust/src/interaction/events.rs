//! Maps `(pattern kind, stage, success|error)` to the listener event.

use courier_core::{stage, InteractionListener, Message, MessageHeader, StandardError};
use tracing::debug;

use super::transitions::PatternKind;

/// Delivers a successful stage message to the matching listener event.
pub(crate) fn deliver_message(listener: &dyn InteractionListener, kind: PatternKind, msg: &Message) {
    match (kind, msg.header.stage) {
        (PatternKind::Submit, stage::SUBMIT_ACK) => listener.submit_ack_received(msg),
        (PatternKind::Request, stage::REQUEST_RESPONSE) => listener.request_response_received(msg),
        (PatternKind::Invoke, stage::INVOKE_ACK) => listener.invoke_ack_received(msg),
        (PatternKind::Invoke, stage::INVOKE_RESPONSE) => listener.invoke_response_received(msg),
        (PatternKind::Progress, stage::PROGRESS_ACK) => listener.progress_ack_received(msg),
        (PatternKind::Progress, stage::PROGRESS_UPDATE) => listener.progress_update_received(msg),
        (PatternKind::Progress, stage::PROGRESS_RESPONSE) => {
            listener.progress_response_received(msg);
        }
        (PatternKind::Register, stage::REGISTER_ACK) => listener.register_ack_received(msg),
        (PatternKind::Deregister, stage::DEREGISTER_ACK) => listener.deregister_ack_received(msg),
        (PatternKind::PublishRegister, stage::PUBLISH_REGISTER_ACK) => {
            listener.publish_register_ack_received(msg);
        }
        (PatternKind::PublishDeregister, stage::PUBLISH_DEREGISTER_ACK) => {
            listener.publish_deregister_ack_received(msg);
        }
        (kind, s) => debug!(kind = kind.as_str(), stage = s, "no listener event for stage"),
    }
}

/// Delivers an error reported at stage `header.stage`.
pub(crate) fn deliver_error(
    listener: &dyn InteractionListener,
    kind: PatternKind,
    header: &MessageHeader,
    error: &StandardError,
) {
    match (kind, header.stage) {
        (PatternKind::Submit, _) => listener.submit_error_received(header, error),
        (PatternKind::Request, _) => listener.request_error_received(header, error),
        (PatternKind::Invoke, stage::INVOKE_RESPONSE) => {
            listener.invoke_response_error_received(header, error);
        }
        (PatternKind::Invoke, _) => listener.invoke_ack_error_received(header, error),
        (PatternKind::Progress, stage::PROGRESS_UPDATE) => {
            listener.progress_update_error_received(header, error);
        }
        (PatternKind::Progress, stage::PROGRESS_RESPONSE) => {
            listener.progress_response_error_received(header, error);
        }
        (PatternKind::Progress, _) => listener.progress_ack_error_received(header, error),
        (PatternKind::Register, _) => listener.register_error_received(header, error),
        (PatternKind::Deregister, _) => listener.deregister_error_received(header, error),
        (PatternKind::PublishRegister, _) => listener.publish_register_error_received(header, error),
        (PatternKind::PublishDeregister, _) => {
            listener.publish_deregister_error_received(header, error);
        }
    }
}
