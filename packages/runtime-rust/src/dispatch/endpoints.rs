//! Named transport endpoints shared by several bindings.
//!
//! The first binding naming an endpoint creates it and installs a
//! [`Dispatcher`] as its listener; later bindings attach to the same
//! dispatcher. The endpoint is closed once the last binding released it.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{CourierError, MessageReceiver, Role, RoutingKey, Transport, TransportEndpoint};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;

#[derive(Clone)]
struct SharedEndpoint {
    endpoint: Arc<dyn TransportEndpoint>,
    dispatcher: Arc<Dispatcher>,
}

/// Table of shared endpoints of one context, keyed by endpoint name.
#[derive(Default)]
pub struct SharedEndpoints {
    table: Mutex<HashMap<String, SharedEndpoint>>,
}

impl std::fmt::Debug for SharedEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEndpoints").finish_non_exhaustive()
    }
}

impl SharedEndpoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a binding to the endpoint `name`, creating the endpoint on
    /// first use. `build` receives the endpoint and returns the binding plus
    /// the receiver the dispatcher should deliver to.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::DuplicateBinding` if `(role, key)` is already
    /// served on this endpoint, or the transport's error if the endpoint
    /// cannot be created.
    pub async fn attach<B, F>(
        &self,
        transport: &dyn Transport,
        name: &str,
        role: Role,
        key: RoutingKey,
        build: F,
    ) -> Result<B, CourierError>
    where
        F: FnOnce(Arc<dyn TransportEndpoint>) -> (B, Arc<dyn MessageReceiver>) + Send,
    {
        let mut table = self.table.lock().await;
        let shared = match table.get(name) {
            Some(shared) => shared.clone(),
            None => {
                let endpoint = transport.create_endpoint(Some(name)).await?;
                let dispatcher = Arc::new(Dispatcher::new(name));
                endpoint.set_listener(dispatcher.clone());
                endpoint.start_delivery();
                debug!(endpoint = name, uri = %endpoint.uri(), "shared endpoint created");
                let shared = SharedEndpoint {
                    endpoint,
                    dispatcher,
                };
                table.insert(name.to_string(), shared.clone());
                shared
            }
        };

        if shared.dispatcher.contains(role, key) {
            return Err(CourierError::DuplicateBinding {
                role,
                key,
                endpoint: name.to_string(),
            });
        }
        let (binding, receiver) = build(shared.endpoint.clone());
        shared.dispatcher.attach(role, key, receiver)?;
        Ok(binding)
    }

    /// Stops routing to `(role, key)` on `name`.
    pub async fn detach(&self, name: &str, role: Role, key: RoutingKey) {
        let table = self.table.lock().await;
        if let Some(shared) = table.get(name) {
            shared.dispatcher.detach(role, key);
        }
    }

    /// Closes the endpoint `name` if no binding is attached any more.
    /// Errors from the transport are logged and suppressed.
    pub async fn release(&self, name: &str) {
        let mut table = self.table.lock().await;
        let unused = table.get(name).is_some_and(|s| s.dispatcher.is_empty());
        if !unused {
            return;
        }
        if let Some(shared) = table.remove(name) {
            shared.endpoint.stop_delivery();
            if let Err(e) = shared.endpoint.close().await {
                warn!(endpoint = name, error = %e, "error closing shared endpoint");
            } else {
                debug!(endpoint = name, "shared endpoint closed");
            }
        }
    }

    /// Number of bindings attached to `name`.
    pub async fn users(&self, name: &str) -> usize {
        self.table
            .lock()
            .await
            .get(name)
            .map_or(0, |s| s.dispatcher.len())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.table.lock().await.contains_key(name)
    }
}
