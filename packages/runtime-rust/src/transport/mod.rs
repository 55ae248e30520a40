//! Transport implementations bundled with the runtime.

pub mod memory;

pub use memory::{MemoryEndpoint, MemoryTransport};
