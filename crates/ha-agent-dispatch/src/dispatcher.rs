//! Concurrent fan-out of state changes to matched handlers

use std::sync::Arc;

use futures::future::join_all;
use ha_agent_core::StateChange;
use thiserror::Error;
use tracing::{debug, warn};

use crate::SubscriptionRegistry;

/// Errors surfaced by a dispatch call
#[derive(Debug, Error)]
pub enum DispatchError {
    /// One or more handlers for a notification failed; the rest still ran
    #[error("{} handler(s) failed for {entity_id}", failures.len())]
    HandlersFailed {
        entity_id: String,
        failures: Vec<String>,
    },
}

/// Dispatches one state change to every matching subscription
///
/// Each matched handler runs as its own tokio task, so handlers never block
/// each other or the dispatch call itself. The call resolves once every
/// launched handler has finished; failures are collected rather than
/// short-circuiting. The dispatcher never touches the state mirror.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a subscription registry
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher resolves against
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Fan one notification out to all matching handlers and await them all
    ///
    /// Returns immediately when nothing matches.
    pub async fn dispatch(&self, change: StateChange) -> Result<(), DispatchError> {
        let entity_id = change.entity_id.to_string();
        let handlers = self.registry.resolve(&entity_id);
        if handlers.is_empty() {
            return Ok(());
        }

        debug!(entity_id = %entity_id, matched = handlers.len(), "Dispatching state change");

        // Launch every unit before waiting on any of them.
        let mut units = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let entity_id = entity_id.clone();
            let new_state = change.new_state.clone();
            let old_state = change.old_state.clone();
            units.push(tokio::spawn(async move {
                handler(entity_id, new_state, old_state).await
            }));
        }

        let mut failures = Vec::new();
        for outcome in join_all(units).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(entity_id = %entity_id, error = %err, "State handler failed");
                    failures.push(err.to_string());
                }
                Err(err) => {
                    warn!(entity_id = %entity_id, error = %err, "State handler task died");
                    failures.push(err.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::HandlersFailed {
                entity_id,
                failures,
            })
        }
    }
}
