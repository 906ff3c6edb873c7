//! Ordered registry of (pattern, handler) subscriptions

use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use ha_agent_core::State;
use tracing::debug;

/// Future type for async state handlers
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// State handler function type
///
/// Invoked as `(entity_id, new_state, old_state)`; either state may be
/// absent when the entity appeared or was removed.
pub type StateHandler =
    Arc<dyn Fn(String, Option<State>, Option<State>) -> HandlerFuture + Send + Sync>;

struct Subscription {
    pattern: String,
    handler: StateHandler,
}

/// Ordered list of pattern-matched state subscriptions
///
/// Registration order is preserved and is the dispatch order for a single
/// notification. Duplicate patterns are legal and all fire independently;
/// subscriptions live for the lifetime of the host (no unregister).
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every entity whose id matches `pattern`
    ///
    /// An empty pattern matches every entity. Any other pattern is a literal
    /// prefix of the entity id string: `light.kitchen` matches exactly that
    /// entity, and a bare domain like `light` matches everything in the
    /// domain, including ids such as `lighthouse.x` that merely start with
    /// the same characters.
    pub fn register<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(String, Option<State>, Option<State>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = pattern.into();
        debug!(pattern = %pattern, "Registering state subscription");

        let handler: StateHandler =
            Arc::new(move |entity_id, new_state, old_state| {
                Box::pin(handler(entity_id, new_state, old_state)) as HandlerFuture
            });

        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription { pattern, handler });
    }

    /// Resolve the handlers matching an entity id, in registration order
    pub fn resolve(&self, entity_id: &str) -> Vec<StateHandler> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|sub| Self::matches(&sub.pattern, entity_id))
            .map(|sub| sub.handler.clone())
            .collect()
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether any subscription has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(pattern: &str, entity_id: &str) -> bool {
        pattern.is_empty() || entity_id.starts_with(pattern)
    }
}
