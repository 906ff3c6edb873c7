//! Scheduler collaborator boundary

use async_trait::async_trait;

/// Time-based trigger subsystem, coordinated with during teardown
///
/// The agent stops the scheduler before closing the connection so no new
/// timer-triggered work starts while the host is going down. Its triggering
/// machinery is otherwise its own concern.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Stop issuing timer-triggered work; awaited during teardown
    async fn stop(&self);
}

/// A scheduler with no timers; the default wiring
#[derive(Debug, Default)]
pub struct NoopScheduler;

#[async_trait]
impl Scheduler for NoopScheduler {
    async fn stop(&self) {}
}
