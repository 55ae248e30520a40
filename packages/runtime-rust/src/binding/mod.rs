//! Bindings and binding managers.
//!
//! - [`consumer`]: initiates interactions, receives replies and notifications
//! - [`provider`]: serves initiating messages, publishes updates
//! - [`broker`]: serves the pub/sub control stages and fans out NOTIFY
//! - [`manager`]: per-role factories owning registry, executors, watchdog

pub mod broker;
pub mod consumer;
mod core;
pub mod manager;
pub mod provider;
mod subscription;

pub use broker::{BrokerBinding, MemoryBroker};
pub use consumer::ConsumerBinding;
pub use self::core::{BindingId, BindingState, BindingStats};
pub use manager::{BrokerManager, ConsumerManager, ProviderManager};
pub use provider::{ProviderBinding, ProviderInteraction};
