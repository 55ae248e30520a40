//! Interaction state machines.
//!
//! - [`transitions`]: legal stage edges per pattern kind
//! - [`machine`]: the `Interaction` itself (state, flavor, event emission)
//! - [`events`]: mapping from stage outcomes to listener events

pub(crate) mod events;
pub mod machine;
pub mod transitions;

#[cfg(test)]
pub(crate) mod testing;

pub use machine::{
    Failure, Interaction, InteractionState, Outcome, OwnerId, Status, Step, Waiter,
};
pub use transitions::{Edge, PatternKind, TransitionTable};
