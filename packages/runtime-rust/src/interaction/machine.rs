//! The per-transaction interaction state machine.
//!
//! An `Interaction` is one pattern kind plus a shared mutable state and a
//! sink. The sink is either a waiter (blocking flavor: the caller awaits a
//! single-slot channel) or a listener (callback flavor), and a blocking
//! interaction may also carry a listener for the stages after the one that
//! releases the caller (invoke/progress). State is only touched under the
//! interaction's own lock; events are emitted after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    stage, stage_name, CourierError, InteractionListener, Message, MessageHeader, StandardError,
    TransactionId,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::events;
use super::transitions::PatternKind;

/// Identifier of the binding that owns an interaction.
pub type OwnerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Done,
    Failed,
}

/// Mutable part of an interaction.
#[derive(Debug)]
pub struct InteractionState {
    pub status: Status,
    pub stage: u8,
    pub last_activity: Instant,
    /// Header of the initiating message.
    pub header: MessageHeader,
    pub error: Option<StandardError>,
    /// Highest progress-update sequence number seen so far.
    pub last_sequence: u64,
}

/// Reasons an interaction is ended from outside its regular stage flow.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Owning registry or binding closed.
    Closed,
    /// Timeout watchdog.
    Timeout,
    /// A delivery for the transaction was aborted because its binding closed.
    Aborted,
    Transmit(StandardError),
    Security(StandardError),
}

impl Failure {
    #[must_use]
    pub fn standard(&self) -> StandardError {
        match self {
            Self::Closed => StandardError::shutdown(),
            Self::Timeout => StandardError::timed_out(),
            Self::Aborted => StandardError::delivery_failed("delivery aborted: binding closed"),
            Self::Transmit(e) | Self::Security(e) => e.clone(),
        }
    }

    fn caller_error(&self, at: u8, error: StandardError) -> CourierError {
        match self {
            Self::Transmit(_) => CourierError::Transmit(error),
            Self::Security(_) => CourierError::Security(error),
            Self::Closed | Self::Timeout | Self::Aborted => {
                CourierError::Interaction { stage: at, error }
            }
        }
    }
}

/// What feeding an interaction produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Interaction was already terminal; nothing happened.
    Ignored,
    Continuing,
    /// Interaction reached DONE or FAILED and must be removed.
    Completed,
}

/// Caller side of a blocking interaction.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<Result<Message, CourierError>>,
}

impl Waiter {
    /// Waits for the stage that releases the caller.
    ///
    /// Dropping the returned future abandons the wait without cancelling the
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns the error the interaction ended with.
    pub async fn wait(self) -> Result<Message, CourierError> {
        self.rx
            .await
            .unwrap_or(Err(CourierError::Closed("interaction")))
    }
}

enum Emit {
    Message(Message),
    /// Terminal error; goes to the waiter if one is pending.
    Error {
        header: MessageHeader,
        error: StandardError,
        caller: CourierError,
    },
    /// Non-terminal error event, listener only.
    Notice {
        header: MessageHeader,
        error: StandardError,
    },
}

/// A state change that already happened, with the events it produced.
///
/// Dropping an outcome without delivering it loses those events.
#[must_use = "events are lost unless the outcome is delivered"]
pub struct Outcome<'a> {
    interaction: &'a Interaction,
    step: Step,
    emits: Vec<Emit>,
}

impl<'a> Outcome<'a> {
    fn ignored(interaction: &'a Interaction) -> Self {
        Self {
            interaction,
            step: Step::Ignored,
            emits: Vec::new(),
        }
    }

    #[must_use]
    pub fn step(&self) -> Step {
        self.step
    }

    /// Hands the events to the waiter or the listener.
    pub fn deliver(self) -> Step {
        self.interaction.emit_all(self.emits);
        self.step
    }
}

impl std::fmt::Debug for Outcome<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outcome")
            .field("transaction_id", &self.interaction.transaction_id)
            .field("step", &self.step)
            .field("events", &self.emits.len())
            .finish()
    }
}

pub struct Interaction {
    kind: PatternKind,
    owner: OwnerId,
    transaction_id: TransactionId,
    state: Mutex<InteractionState>,
    waiter: Mutex<Option<oneshot::Sender<Result<Message, CourierError>>>>,
    listener: Option<Arc<dyn InteractionListener>>,
}

impl std::fmt::Debug for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interaction")
            .field("kind", &self.kind)
            .field("transaction_id", &self.transaction_id)
            .field("owner", &self.owner)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Interaction {
    fn build(
        kind: PatternKind,
        header: MessageHeader,
        owner: OwnerId,
        current: u8,
        last_activity: Instant,
        waiter: Option<oneshot::Sender<Result<Message, CourierError>>>,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Self {
        Self {
            kind,
            owner,
            transaction_id: header.transaction_id,
            state: Mutex::new(InteractionState {
                status: Status::Running,
                stage: current,
                last_activity,
                header,
                error: None,
                last_sequence: 0,
            }),
            waiter: Mutex::new(waiter),
            listener,
        }
    }

    /// Blocking flavor. Stages after the releasing one go to `listener`.
    #[must_use]
    pub fn blocking(
        kind: PatternKind,
        header: MessageHeader,
        owner: OwnerId,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> (Self, Waiter) {
        let (tx, rx) = oneshot::channel();
        let initial = kind.table().initial;
        let interaction = Self::build(kind, header, owner, initial, Instant::now(), Some(tx), listener);
        (interaction, Waiter { rx })
    }

    /// Callback flavor.
    #[must_use]
    pub fn callback(
        kind: PatternKind,
        header: MessageHeader,
        owner: OwnerId,
        listener: Option<Arc<dyn InteractionListener>>,
    ) -> Self {
        let initial = kind.table().initial;
        Self::build(kind, header, owner, initial, Instant::now(), None, listener)
    }

    /// Callback flavor re-attached at `current` stage, with activity dating
    /// back to `last_activity`.
    #[must_use]
    pub fn resumed(
        kind: PatternKind,
        header: MessageHeader,
        owner: OwnerId,
        current: u8,
        last_activity: Instant,
        listener: Arc<dyn InteractionListener>,
    ) -> Self {
        Self::build(kind, header, owner, current, last_activity, None, Some(listener))
    }

    #[must_use]
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    #[must_use]
    pub fn stage(&self) -> u8 {
        self.state.lock().stage
    }

    /// Whether the interaction is still running and silent for longer than
    /// `timeout` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        let st = self.state.lock();
        st.status == Status::Running && now.saturating_duration_since(st.last_activity) > timeout
    }

    /// Feeds an inbound stage message.
    ///
    /// An edge missing from the pattern's table fails the interaction with an
    /// `INCORRECT_STATE` error, reported at the next expected stage, and the
    /// message payload is never delivered.
    pub fn on_message(&self, msg: Message) -> Step {
        self.apply_message(msg).deliver()
    }

    /// Forces the interaction to FAILED with a synthetic error, delivered
    /// through the same event path as a stage error.
    pub fn fail(&self, failure: &Failure) -> Step {
        self.apply_failure(failure).deliver()
    }

    /// Like [`Interaction::on_message`], but leaves the events undelivered
    /// so the caller can account for the step before any listener runs.
    pub fn apply_message(&self, msg: Message) -> Outcome<'_> {
        let mut st = self.state.lock();
        if st.status != Status::Running {
            debug!(
                transaction_id = %self.transaction_id,
                stage = msg.header.stage,
                "message for finished interaction dropped"
            );
            return Outcome::ignored(self);
        }
        let (step, emits) = self.advance(&mut st, msg);
        Outcome {
            interaction: self,
            step,
            emits,
        }
    }

    /// Like [`Interaction::fail`], with the events left undelivered.
    pub fn apply_failure(&self, failure: &Failure) -> Outcome<'_> {
        let mut st = self.state.lock();
        if st.status != Status::Running {
            return Outcome::ignored(self);
        }
        let at = self.kind.table().next_expected(st.stage).unwrap_or(st.stage);
        let error = failure.standard();
        st.status = Status::Failed;
        st.error = Some(error.clone());
        let emit = Emit::Error {
            header: st.header.reply(at, true),
            caller: failure.caller_error(at, error.clone()),
            error,
        };
        Outcome {
            interaction: self,
            step: Step::Completed,
            emits: vec![emit],
        }
    }

    fn advance(&self, st: &mut InteractionState, msg: Message) -> (Step, Vec<Emit>) {
        let table = self.kind.table();
        let incoming = msg.header.stage;
        let itype = self.kind.interaction_type();

        let Some(edge) = table.edge(st.stage, incoming).copied() else {
            let at = table.next_expected(st.stage).unwrap_or(incoming);
            let error = StandardError::incorrect_state(format!(
                "unexpected {} after {}",
                stage_name(itype, incoming),
                stage_name(itype, st.stage)
            ));
            st.status = Status::Failed;
            st.error = Some(error.clone());
            let emit = Emit::Error {
                header: st.header.reply(at, true),
                caller: CourierError::Interaction {
                    stage: at,
                    error: error.clone(),
                },
                error,
            };
            return (Step::Completed, vec![emit]);
        };

        st.stage = incoming;
        st.last_activity = Instant::now();

        if msg.header.is_error {
            let error = msg.error_body();
            st.status = Status::Failed;
            st.error = Some(error.clone());
            let emit = Emit::Error {
                header: msg.header,
                caller: CourierError::Interaction {
                    stage: incoming,
                    error: error.clone(),
                },
                error,
            };
            return (Step::Completed, vec![emit]);
        }

        let mut emits = Vec::with_capacity(2);
        if self.kind == PatternKind::Progress && incoming == stage::PROGRESS_UPDATE {
            if let Some(seq) = msg.header.sequence {
                if seq > st.last_sequence + 1 {
                    emits.push(Emit::Notice {
                        header: msg.header.with_stage(stage::PROGRESS_UPDATE, true),
                        error: StandardError::updates_lost(seq - st.last_sequence - 1),
                    });
                }
                st.last_sequence = st.last_sequence.max(seq);
            }
        }

        let step = if edge.terminal {
            st.status = Status::Done;
            Step::Completed
        } else {
            Step::Continuing
        };
        emits.push(Emit::Message(msg));
        (step, emits)
    }

    fn emit_all(&self, emits: Vec<Emit>) {
        for emit in emits {
            self.emit(emit);
        }
    }

    fn emit(&self, emit: Emit) {
        match emit {
            Emit::Message(msg) => {
                if msg.header.stage == self.kind.sync_stage() {
                    if let Some(tx) = self.waiter.lock().take() {
                        // A dropped receiver means the caller gave up waiting.
                        let _ = tx.send(Ok(msg));
                        return;
                    }
                }
                match &self.listener {
                    Some(listener) => events::deliver_message(listener.as_ref(), self.kind, &msg),
                    None => debug!(
                        transaction_id = %self.transaction_id,
                        stage = msg.header.stage,
                        "no listener for stage message"
                    ),
                }
            }
            Emit::Error {
                header,
                error,
                caller,
            } => {
                if let Some(tx) = self.waiter.lock().take() {
                    let _ = tx.send(Err(caller));
                    return;
                }
                self.notify_error(&header, &error);
            }
            Emit::Notice { header, error } => self.notify_error(&header, &error),
        }
    }

    fn notify_error(&self, header: &MessageHeader, error: &StandardError) {
        match &self.listener {
            Some(listener) => events::deliver_error(listener.as_ref(), self.kind, header, error),
            None => debug!(
                transaction_id = %self.transaction_id,
                stage = header.stage,
                %error,
                "no listener for error event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Body, InteractionType, ServiceKey, Uri};
    use proptest::prelude::*;

    use super::*;
    use crate::interaction::testing::{Event, RecordingListener};

    fn init_header(kind: PatternKind, txn: u64) -> MessageHeader {
        MessageHeader::initiation(
            Uri::from("memory://consumer"),
            Uri::from("memory://provider"),
            kind.interaction_type(),
            TransactionId(txn),
            ServiceKey::new(1, 1, 1),
            7,
        )
        .with_stage(kind.table().initial, false)
    }

    fn reply(kind: PatternKind, s: u8, body: impl Into<Body>) -> Message {
        Message::new(init_header(kind, 1).reply(s, false), body)
    }

    fn error_reply(kind: PatternKind, s: u8, error: StandardError) -> Message {
        Message::error(init_header(kind, 1).reply(s, true), error)
    }

    fn update(seq: u64) -> Message {
        let header = init_header(PatternKind::Progress, 1)
            .reply(stage::PROGRESS_UPDATE, false)
            .with_sequence(seq);
        Message::new(header, vec![rmpv::Value::from(seq)])
    }

    #[tokio::test]
    async fn blocking_request_resolves_on_response() {
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Request, init_header(PatternKind::Request, 1), 0, None);

        let step = interaction.on_message(reply(PatternKind::Request, stage::REQUEST_RESPONSE, vec![rmpv::Value::from(42)]));
        assert_eq!(step, Step::Completed);
        assert_eq!(interaction.status(), Status::Done);

        let msg = waiter.wait().await.unwrap();
        assert_eq!(msg.body.elements(), &[rmpv::Value::from(42)]);
    }

    #[tokio::test]
    async fn request_resolves_exactly_once() {
        let listener = RecordingListener::new();
        let interaction = Interaction::callback(
            PatternKind::Request,
            init_header(PatternKind::Request, 1),
            0,
            Some(listener.clone()),
        );

        assert_eq!(
            interaction.on_message(reply(PatternKind::Request, stage::REQUEST_RESPONSE, ())),
            Step::Completed
        );
        // A late error for the same transaction changes nothing.
        assert_eq!(
            interaction.on_message(error_reply(
                PatternKind::Request,
                stage::REQUEST_RESPONSE,
                StandardError::internal("late")
            )),
            Step::Ignored
        );
        assert_eq!(interaction.fail(&Failure::Timeout), Step::Ignored);
        assert_eq!(listener.events(), vec![Event::RequestResponse]);
    }

    #[tokio::test]
    async fn blocking_request_surfaces_application_error() {
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Request, init_header(PatternKind::Request, 1), 0, None);
        interaction.on_message(error_reply(
            PatternKind::Request,
            stage::REQUEST_RESPONSE,
            StandardError::new(70_000, Some(rmpv::Value::from("no such item"))),
        ));

        let err = waiter.wait().await.unwrap_err();
        match err {
            CourierError::Interaction { stage: s, error } => {
                assert_eq!(s, stage::REQUEST_RESPONSE);
                assert_eq!(error.number, 70_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(interaction.status(), Status::Failed);
    }

    #[tokio::test]
    async fn progress_delivers_ack_updates_then_response() {
        let listener = RecordingListener::new();
        let (interaction, waiter) = Interaction::blocking(
            PatternKind::Progress,
            init_header(PatternKind::Progress, 1),
            0,
            Some(listener.clone()),
        );

        assert_eq!(
            interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_ACK, ())),
            Step::Continuing
        );
        waiter.wait().await.unwrap();

        for seq in 1..=3 {
            assert_eq!(interaction.on_message(update(seq)), Step::Continuing);
            assert_eq!(interaction.status(), Status::Running);
        }
        assert_eq!(
            interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_RESPONSE, ())),
            Step::Completed
        );
        assert_eq!(interaction.status(), Status::Done);

        assert_eq!(
            listener.events(),
            vec![
                Event::ProgressUpdate(1),
                Event::ProgressUpdate(2),
                Event::ProgressUpdate(3),
                Event::ProgressResponse,
            ]
        );
    }

    #[test]
    fn progress_callback_sees_single_ack() {
        let listener = RecordingListener::new();
        let interaction = Interaction::callback(
            PatternKind::Progress,
            init_header(PatternKind::Progress, 1),
            0,
            Some(listener.clone()),
        );
        interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_ACK, ()));
        interaction.on_message(update(1));
        interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_RESPONSE, ()));

        assert_eq!(
            listener.events(),
            vec![Event::ProgressAck, Event::ProgressUpdate(1), Event::ProgressResponse]
        );
    }

    #[test]
    fn progress_sequence_gap_reports_lost_updates_first() {
        let listener = RecordingListener::new();
        let interaction = Interaction::callback(
            PatternKind::Progress,
            init_header(PatternKind::Progress, 1),
            0,
            Some(listener.clone()),
        );
        interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_ACK, ()));
        interaction.on_message(update(1));
        interaction.on_message(update(4));

        assert_eq!(
            listener.events(),
            vec![
                Event::ProgressAck,
                Event::ProgressUpdate(1),
                Event::ProgressUpdateError(StandardError::updates_lost(2)),
                Event::ProgressUpdate(4),
            ]
        );
        assert_eq!(interaction.status(), Status::Running);
    }

    #[test]
    fn illegal_edge_fails_without_applying_payload() {
        let listener = RecordingListener::new();
        let interaction = Interaction::callback(
            PatternKind::Invoke,
            init_header(PatternKind::Invoke, 1),
            0,
            Some(listener.clone()),
        );

        // RESPONSE before ACK.
        assert_eq!(
            interaction.on_message(reply(PatternKind::Invoke, stage::INVOKE_RESPONSE, ())),
            Step::Completed
        );
        assert_eq!(interaction.status(), Status::Failed);

        let events = listener.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::InvokeAckError(e) => assert_eq!(e.number, courier_core::codes::INCORRECT_STATE),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_invoke_releases_on_ack_and_streams_response_to_listener() {
        let listener = RecordingListener::new();
        let (interaction, waiter) = Interaction::blocking(
            PatternKind::Invoke,
            init_header(PatternKind::Invoke, 1),
            0,
            Some(listener.clone()),
        );
        interaction.on_message(reply(PatternKind::Invoke, stage::INVOKE_ACK, ()));
        let ack = waiter.wait().await.unwrap();
        assert_eq!(ack.header.stage, stage::INVOKE_ACK);

        interaction.on_message(error_reply(
            PatternKind::Invoke,
            stage::INVOKE_RESPONSE,
            StandardError::internal("boom"),
        ));
        assert_eq!(
            listener.events(),
            vec![Event::InvokeResponseError(StandardError::internal("boom"))]
        );
    }

    #[tokio::test]
    async fn fail_releases_blocked_caller_with_timeout() {
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Submit, init_header(PatternKind::Submit, 1), 0, None);
        assert_eq!(interaction.fail(&Failure::Timeout), Step::Completed);
        let err = waiter.wait().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn transmit_failure_uses_transmit_channel() {
        let (interaction, waiter) =
            Interaction::blocking(PatternKind::Request, init_header(PatternKind::Request, 1), 0, None);
        let e = StandardError::with_text(courier_core::codes::DESTINATION_UNKNOWN, "gone");
        interaction.fail(&Failure::Transmit(e.clone()));
        assert!(matches!(waiter.wait().await, Err(CourierError::Transmit(got)) if got == e));
    }

    #[test]
    fn fail_after_ack_reports_at_response_stage() {
        let listener = RecordingListener::new();
        let interaction = Interaction::callback(
            PatternKind::Invoke,
            init_header(PatternKind::Invoke, 1),
            0,
            Some(listener.clone()),
        );
        interaction.on_message(reply(PatternKind::Invoke, stage::INVOKE_ACK, ()));
        interaction.fail(&Failure::Closed);
        assert_eq!(
            listener.events(),
            vec![
                Event::InvokeAck,
                Event::InvokeResponseError(StandardError::shutdown())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_is_strictly_after_timeout() {
        let interaction =
            Interaction::callback(PatternKind::Submit, init_header(PatternKind::Submit, 1), 0, None);
        let timeout = Duration::from_secs(5);
        let start = Instant::now();
        assert!(!interaction.is_stale(start + timeout, timeout));
        assert!(interaction.is_stale(start + timeout + Duration::from_millis(1), timeout));
    }

    #[test]
    fn resumed_interaction_continues_from_given_stage() {
        let listener = RecordingListener::new();
        let interaction = Interaction::resumed(
            PatternKind::Progress,
            init_header(PatternKind::Progress, 1),
            0,
            stage::PROGRESS_UPDATE,
            Instant::now(),
            listener.clone(),
        );
        interaction.on_message(reply(PatternKind::Progress, stage::PROGRESS_RESPONSE, ()));
        assert_eq!(interaction.status(), Status::Done);
        assert_eq!(listener.events(), vec![Event::ProgressResponse]);
    }

    fn kind_strategy() -> impl Strategy<Value = PatternKind> {
        prop_oneof![
            Just(PatternKind::Submit),
            Just(PatternKind::Request),
            Just(PatternKind::Invoke),
            Just(PatternKind::Progress),
            Just(PatternKind::Register),
            Just(PatternKind::Deregister),
            Just(PatternKind::PublishRegister),
            Just(PatternKind::PublishDeregister),
        ]
    }

    proptest! {
        /// Any stage sequence that leaves the table fails the interaction at
        /// the first illegal step, and that step's payload never reaches the
        /// listener.
        #[test]
        fn illegal_orders_always_fail(kind in kind_strategy(), seq in proptest::collection::vec(1u8..=10, 1..6)) {
            let listener = RecordingListener::new();
            let interaction = Interaction::callback(kind, init_header(kind, 1), 0, Some(listener.clone()));
            let table = kind.table();
            let mut current = table.initial;
            let mut legal = 0usize;
            let mut broke = false;

            for s in seq {
                let step = interaction.on_message(reply(kind, s, ()));
                match table.edge(current, s) {
                    Some(edge) => {
                        legal += 1;
                        current = s;
                        if edge.terminal {
                            prop_assert_eq!(step, Step::Completed);
                            prop_assert_eq!(interaction.status(), Status::Done);
                            break;
                        }
                    }
                    None => {
                        prop_assert_eq!(step, Step::Completed);
                        prop_assert_eq!(interaction.status(), Status::Failed);
                        broke = true;
                        break;
                    }
                }
            }

            let events = listener.events();
            let delivered = events.iter().filter(|e| !e.is_error()).count();
            prop_assert_eq!(delivered, legal);
            if broke {
                prop_assert!(events.last().is_some_and(Event::is_error));
            }
        }
    }

    #[test]
    fn send_interaction_type_has_no_state_machine() {
        assert!(PatternKind::from_initiation(InteractionType::Send, stage::SEND).is_none());
    }
}
