//! Per-pattern stage transition tables.
//!
//! A table lists the legal `current -> incoming` edges of one pattern kind,
//! seen from the side that initiated the exchange. The provider's reply
//! handle walks the same tables, so both ends agree on what is legal.

use courier_core::{stage, InteractionType};

/// The stateful pattern kinds. `Send` has no replies and therefore no table;
/// pub/sub splits into its independent acknowledged legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Submit,
    Request,
    Invoke,
    Progress,
    Register,
    Deregister,
    PublishRegister,
    PublishDeregister,
}

impl PatternKind {
    #[must_use]
    pub const fn interaction_type(self) -> InteractionType {
        match self {
            Self::Submit => InteractionType::Submit,
            Self::Request => InteractionType::Request,
            Self::Invoke => InteractionType::Invoke,
            Self::Progress => InteractionType::Progress,
            Self::Register
            | Self::Deregister
            | Self::PublishRegister
            | Self::PublishDeregister => InteractionType::PubSub,
        }
    }

    /// The kind started by an initiating message of `interaction` at `stage`.
    #[must_use]
    pub fn from_initiation(interaction: InteractionType, initial: u8) -> Option<Self> {
        match (interaction, initial) {
            (InteractionType::Submit, stage::SUBMIT) => Some(Self::Submit),
            (InteractionType::Request, stage::REQUEST) => Some(Self::Request),
            (InteractionType::Invoke, stage::INVOKE) => Some(Self::Invoke),
            (InteractionType::Progress, stage::PROGRESS) => Some(Self::Progress),
            (InteractionType::PubSub, stage::REGISTER) => Some(Self::Register),
            (InteractionType::PubSub, stage::DEREGISTER) => Some(Self::Deregister),
            (InteractionType::PubSub, stage::PUBLISH_REGISTER) => Some(Self::PublishRegister),
            (InteractionType::PubSub, stage::PUBLISH_DEREGISTER) => Some(Self::PublishDeregister),
            _ => None,
        }
    }

    #[must_use]
    pub fn table(self) -> &'static TransitionTable {
        match self {
            Self::Submit => &SUBMIT,
            Self::Request => &REQUEST,
            Self::Invoke => &INVOKE,
            Self::Progress => &PROGRESS,
            Self::Register => &REGISTER,
            Self::Deregister => &DEREGISTER,
            Self::PublishRegister => &PUBLISH_REGISTER,
            Self::PublishDeregister => &PUBLISH_DEREGISTER,
        }
    }

    /// Stage at which a blocking caller is released.
    #[must_use]
    pub const fn sync_stage(self) -> u8 {
        match self {
            Self::Submit => stage::SUBMIT_ACK,
            Self::Request => stage::REQUEST_RESPONSE,
            Self::Invoke => stage::INVOKE_ACK,
            Self::Progress => stage::PROGRESS_ACK,
            Self::Register => stage::REGISTER_ACK,
            Self::Deregister => stage::DEREGISTER_ACK,
            Self::PublishRegister => stage::PUBLISH_REGISTER_ACK,
            Self::PublishDeregister => stage::PUBLISH_DEREGISTER_ACK,
        }
    }

    /// Stage of the acknowledgement reply, for kinds that have one.
    #[must_use]
    pub const fn ack_stage(self) -> Option<u8> {
        match self {
            Self::Request => None,
            Self::Submit
            | Self::Invoke
            | Self::Progress
            | Self::Register
            | Self::Deregister
            | Self::PublishRegister
            | Self::PublishDeregister => Some(self.sync_stage()),
        }
    }

    /// Stage of the final response reply, for kinds that have one.
    #[must_use]
    pub const fn response_stage(self) -> Option<u8> {
        match self {
            Self::Request => Some(stage::REQUEST_RESPONSE),
            Self::Invoke => Some(stage::INVOKE_RESPONSE),
            Self::Progress => Some(stage::PROGRESS_RESPONSE),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Request => "request",
            Self::Invoke => "invoke",
            Self::Progress => "progress",
            Self::Register => "register",
            Self::Deregister => "deregister",
            Self::PublishRegister => "publish-register",
            Self::PublishDeregister => "publish-deregister",
        }
    }
}

/// One legal edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: u8,
    pub to: u8,
    /// Whether arriving at `to` successfully ends the interaction. Errors
    /// end it regardless.
    pub terminal: bool,
}

const fn edge(from: u8, to: u8, terminal: bool) -> Edge {
    Edge { from, to, terminal }
}

#[derive(Debug)]
pub struct TransitionTable {
    pub kind: PatternKind,
    pub initial: u8,
    pub edges: &'static [Edge],
}

impl TransitionTable {
    /// The edge `from -> to`, if legal.
    #[must_use]
    pub fn edge(&self, from: u8, to: u8) -> Option<&Edge> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }

    /// First stage reachable from `from`, i.e. the stage an error standing
    /// in for the next message is reported at.
    #[must_use]
    pub fn next_expected(&self, from: u8) -> Option<u8> {
        self.edges.iter().find(|e| e.from == from).map(|e| e.to)
    }

    /// Whether `s` is a stage an interaction can be parked in: the initial
    /// stage or the target of a non-terminal edge.
    #[must_use]
    pub fn is_resumable(&self, s: u8) -> bool {
        s == self.initial || self.edges.iter().any(|e| e.to == s && !e.terminal)
    }

    /// Every stage appearing in the table.
    #[must_use]
    pub fn stages(&self) -> Vec<u8> {
        let mut out = vec![self.initial];
        for e in self.edges {
            if !out.contains(&e.to) {
                out.push(e.to);
            }
        }
        out
    }
}

static SUBMIT: TransitionTable = TransitionTable {
    kind: PatternKind::Submit,
    initial: stage::SUBMIT,
    edges: &[edge(stage::SUBMIT, stage::SUBMIT_ACK, true)],
};

static REQUEST: TransitionTable = TransitionTable {
    kind: PatternKind::Request,
    initial: stage::REQUEST,
    edges: &[edge(stage::REQUEST, stage::REQUEST_RESPONSE, true)],
};

static INVOKE: TransitionTable = TransitionTable {
    kind: PatternKind::Invoke,
    initial: stage::INVOKE,
    edges: &[
        edge(stage::INVOKE, stage::INVOKE_ACK, false),
        edge(stage::INVOKE_ACK, stage::INVOKE_RESPONSE, true),
    ],
};

static PROGRESS: TransitionTable = TransitionTable {
    kind: PatternKind::Progress,
    initial: stage::PROGRESS,
    edges: &[
        edge(stage::PROGRESS, stage::PROGRESS_ACK, false),
        edge(stage::PROGRESS_ACK, stage::PROGRESS_UPDATE, false),
        edge(stage::PROGRESS_ACK, stage::PROGRESS_RESPONSE, true),
        edge(stage::PROGRESS_UPDATE, stage::PROGRESS_UPDATE, false),
        edge(stage::PROGRESS_UPDATE, stage::PROGRESS_RESPONSE, true),
    ],
};

static REGISTER: TransitionTable = TransitionTable {
    kind: PatternKind::Register,
    initial: stage::REGISTER,
    edges: &[edge(stage::REGISTER, stage::REGISTER_ACK, true)],
};

static DEREGISTER: TransitionTable = TransitionTable {
    kind: PatternKind::Deregister,
    initial: stage::DEREGISTER,
    edges: &[edge(stage::DEREGISTER, stage::DEREGISTER_ACK, true)],
};

static PUBLISH_REGISTER: TransitionTable = TransitionTable {
    kind: PatternKind::PublishRegister,
    initial: stage::PUBLISH_REGISTER,
    edges: &[edge(stage::PUBLISH_REGISTER, stage::PUBLISH_REGISTER_ACK, true)],
};

static PUBLISH_DEREGISTER: TransitionTable = TransitionTable {
    kind: PatternKind::PublishDeregister,
    initial: stage::PUBLISH_DEREGISTER,
    edges: &[edge(
        stage::PUBLISH_DEREGISTER,
        stage::PUBLISH_DEREGISTER_ACK,
        true,
    )],
};
