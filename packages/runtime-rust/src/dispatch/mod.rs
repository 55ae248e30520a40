//! Shared-endpoint routing.
//!
//! - [`routes`]: `(interaction, stage, is_error) -> role` decision tables
//! - [`dispatcher`]: per-endpoint `(role, routing key) -> binding` table
//! - [`endpoints`]: named endpoints shared by several bindings

pub mod dispatcher;
pub mod endpoints;
pub mod routes;

pub use dispatcher::Dispatcher;
pub use endpoints::SharedEndpoints;
pub use routes::RouteTable;
