//! Subscription registry and dispatch engine for ha-agent
//!
//! This crate resolves incoming state changes against registered
//! (pattern, handler) subscriptions and runs every matched handler as its
//! own concurrently-scheduled task.

mod dispatcher;
mod registry;

pub use dispatcher::{DispatchError, Dispatcher};
pub use registry::{HandlerFuture, StateHandler, SubscriptionRegistry};
