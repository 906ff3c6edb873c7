//! Event-driven automation host for a remote Home-Assistant-style service
//!
//! The [`Agent`] keeps a persistent connection to the remote service,
//! ingests its stream of state-change events, mirrors current entity state
//! in memory, and fans each change out to registered pattern-matched
//! handlers, all without blocking ingestion of further events.
//!
//! ```no_run
//! use ha_agent::{Agent, ConnectConfig};
//!
//! # async fn example() -> Result<(), ha_agent::RunError> {
//! let agent = Agent::with_websocket(ConnectConfig {
//!     host: "hass.local".into(),
//!     token: std::env::var("HASS_TOKEN").unwrap_or_default(),
//!     ..Default::default()
//! });
//!
//! agent.listen_state("light.kitchen", |entity_id, new, _old| async move {
//!     if let Some(new) = new {
//!         println!("{entity_id} is now {}", new.state);
//!     }
//!     Ok(())
//! });
//!
//! agent.run().await
//! # }
//! ```

mod scheduler;
mod services;

pub use scheduler::{NoopScheduler, Scheduler};

pub use ha_agent_client::{ClientError, ConnectConfig, EventClient, WsClient};
pub use ha_agent_core::{
    Context, EntityId, EntityIdError, EventMessage, State, StateChange, STATE_CHANGED,
};
pub use ha_agent_dispatch::{DispatchError, Dispatcher, StateHandler, SubscriptionRegistry};
pub use ha_agent_state::StateMirror;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// How long the loop pauses when the feed has nothing to read
const READ_IDLE_DELAY: Duration = Duration::from_millis(100);

/// Phase of the ingestion loop, observable via [`Agent::phase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Disconnected,
    Connecting,
    Subscribing,
    Running,
    Stopping,
    Stopped,
}

/// Errors surfaced by [`Agent::run`]
#[derive(Debug, Error)]
pub enum RunError {
    /// The run was cancelled; teardown has already completed
    #[error("run cancelled")]
    Cancelled,

    /// A state_changed event arrived without a decodable payload
    ///
    /// This is a contract violation by the remote feed and is fatal to the
    /// run rather than silently skipped.
    #[error("malformed state_changed payload: {0}")]
    MalformedEvent(#[source] serde_json::Error),

    /// The transport failed
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// The automation host
///
/// Wires the transport, state mirror, dispatcher, and scheduler together.
/// [`Agent::run`] drives ingestion until cancelled or disconnected;
/// [`Agent::stop`] cancels it and performs the ordered teardown exactly
/// once, however many times and from wherever it is invoked.
pub struct Agent {
    config: ConnectConfig,
    client: Arc<dyn EventClient>,
    scheduler: Arc<dyn Scheduler>,
    mirror: Arc<StateMirror>,
    dispatcher: Arc<Dispatcher>,
    /// In-flight dispatch units; completed entries prune themselves
    dispatches: TaskTracker,
    cancel: CancellationToken,
    stopped: AtomicBool,
    phase: Mutex<RunPhase>,
}

impl Agent {
    /// Create an agent over the given transport and scheduler
    pub fn new(
        config: ConnectConfig,
        client: Arc<dyn EventClient>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        Self {
            config,
            client,
            scheduler,
            mirror: Arc::new(StateMirror::new()),
            dispatcher: Arc::new(Dispatcher::new(registry)),
            dispatches: TaskTracker::new(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            phase: Mutex::new(RunPhase::Disconnected),
        }
    }

    /// Create an agent over the bundled WebSocket transport, no scheduler
    pub fn with_websocket(config: ConnectConfig) -> Self {
        Self::new(config, Arc::new(WsClient::new()), Arc::new(NoopScheduler))
    }

    /// Register a handler for every entity whose id matches `pattern`
    ///
    /// An empty pattern matches everything; any other pattern is a literal
    /// prefix of the entity id. Handlers are invoked as
    /// `(entity_id, new_state, old_state)` and run concurrently with each
    /// other and with ingestion.
    pub fn listen_state<F, Fut>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(String, Option<State>, Option<State>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispatcher.registry().register(pattern, handler);
    }

    /// Latest known state of an entity
    pub fn get_state(&self, entity_id: &str) -> Option<State> {
        self.mirror.get(entity_id)
    }

    /// Snapshot of all known states matching a predicate
    pub fn query_states<F>(&self, predicate: F) -> Vec<State>
    where
        F: Fn(&State) -> bool,
    {
        self.mirror.query(predicate)
    }

    /// Current phase of the ingestion loop
    pub fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: RunPhase) {
        trace!(?phase, "Run phase");
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Connect, subscribe, and ingest state changes until cancelled or
    /// disconnected
    ///
    /// Returns `Ok(())` when the remote refused the connection (the caller
    /// decides whether to retry). Cancellation surfaces as
    /// [`RunError::Cancelled`], and only after teardown has completed, as
    /// with every other exit from the serving state.
    pub async fn run(&self) -> Result<(), RunError> {
        self.set_phase(RunPhase::Connecting);
        match self.client.connect(&self.config).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Remote refused the connection");
                self.set_phase(RunPhase::Stopped);
                return Ok(());
            }
            Err(err) => {
                self.set_phase(RunPhase::Stopped);
                return Err(err.into());
            }
        }

        let outcome = self.serve().await;

        self.set_phase(RunPhase::Stopping);
        self.teardown().await;
        self.set_phase(RunPhase::Stopped);
        outcome
    }

    async fn serve(&self) -> Result<(), RunError> {
        self.set_phase(RunPhase::Subscribing);
        self.client.subscribe_events().await?;
        self.set_phase(RunPhase::Running);
        info!("Ingesting state changes");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Cancellation observed");
                    return Err(RunError::Cancelled);
                }

                read = self.client.read_event() => match read? {
                    Some(msg) if msg.is_state_changed() => self.ingest(msg)?,
                    Some(msg) => trace!(event_type = %msg.event_type, "Ignoring event"),
                    None => tokio::time::sleep(READ_IDLE_DELAY).await,
                },
            }
        }
    }

    /// Apply one state-changed event to the mirror and fan it out
    ///
    /// Dispatch runs as its own tracked task so ingestion moves straight on
    /// to the next event.
    fn ingest(&self, msg: EventMessage) -> Result<(), RunError> {
        let change: StateChange =
            serde_json::from_value(msg.data).map_err(RunError::MalformedEvent)?;

        match &change.new_state {
            Some(new_state) => self.mirror.update(new_state.clone()),
            None => {
                self.mirror.remove(change.entity_id.as_str());
            }
        }

        let dispatcher = self.dispatcher.clone();
        self.dispatches.spawn(async move {
            if let Err(err) = dispatcher.dispatch(change).await {
                warn!(error = %err, "Dispatch completed with failures");
            }
        });
        Ok(())
    }

    /// Cancel an in-progress [`Agent::run`] and tear the host down
    ///
    /// Idempotent: a second call after the first completed is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.teardown().await;
    }

    /// Wait for all in-flight dispatch units to finish
    ///
    /// Not part of the stop path (an unbounded handler must not wedge
    /// shutdown), but available to callers that want a clean drain.
    pub async fn drain(&self) {
        self.dispatches.close();
        self.dispatches.wait().await;
    }

    /// Ordered teardown: scheduler first, then the connection
    ///
    /// Runs at most once across [`Agent::stop`] and the run loop's own
    /// cancellation/error path.
    async fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping");
        self.scheduler.stop().await;
        if let Err(err) = self.client.close().await {
            warn!(error = %err, "Error closing connection");
        }
        self.dispatches.close();
    }

    /// Turn an entity on
    pub async fn turn_on(
        &self,
        entity_id: &EntityId,
        attributes: impl IntoIterator<Item = (String, Value)> + Send,
    ) -> Result<(), ClientError> {
        self.entity_service("turn_on", entity_id, attributes).await
    }

    /// Turn an entity off
    pub async fn turn_off(
        &self,
        entity_id: &EntityId,
        attributes: impl IntoIterator<Item = (String, Value)> + Send,
    ) -> Result<(), ClientError> {
        self.entity_service("turn_off", entity_id, attributes).await
    }

    /// Toggle an entity
    pub async fn toggle(
        &self,
        entity_id: &EntityId,
        attributes: impl IntoIterator<Item = (String, Value)> + Send,
    ) -> Result<(), ClientError> {
        self.entity_service("toggle", entity_id, attributes).await
    }

    /// Invoke an arbitrary remote service
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> Result<(), ClientError> {
        self.client.call_service(domain, service, data).await
    }

    async fn entity_service(
        &self,
        service: &str,
        entity_id: &EntityId,
        attributes: impl IntoIterator<Item = (String, Value)> + Send,
    ) -> Result<(), ClientError> {
        let domain = services::service_domain(entity_id);
        let data = services::service_data(entity_id, attributes);
        self.client.call_service(domain, service, data).await
    }
}
