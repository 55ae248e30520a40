//! Transaction ids, the table of live interactions, and the timeout watchdog.

pub mod registry;
pub mod watchdog;

pub use registry::{CompletionSink, Signal, TransactionRegistry};
pub use watchdog::{Watchdog, WatchdogJob};
