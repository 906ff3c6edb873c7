//! In-memory mirror of current entity state
//!
//! This crate provides the StateMirror, which holds the latest known state
//! of every entity reported by the remote feed. The ingestion loop is the
//! only writer; handlers and query operations read it concurrently.

use dashmap::DashMap;
use ha_agent_core::State;
use tracing::trace;

/// The latest known state of every entity, keyed by entity-id string
///
/// Each write replaces the whole entry for an entity in one step, so readers
/// never observe a partially-applied update. There is no ordering guarantee
/// over bulk reads.
#[derive(Debug, Default)]
pub struct StateMirror {
    states: DashMap<String, State>,
}

impl StateMirror {
    /// Create an empty mirror
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Replace an entity's state with a newer snapshot
    pub fn update(&self, state: State) {
        trace!(entity_id = %state.entity_id, state = %state.state, "Mirroring state");
        self.states.insert(state.entity_id.to_string(), state);
    }

    /// Drop an entity that disappeared from the remote feed
    pub fn remove(&self, entity_id: &str) -> Option<State> {
        self.states.remove(entity_id).map(|(_, s)| s)
    }

    /// Snapshot of all known states
    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Snapshot of all states matching a predicate
    pub fn query<F>(&self, predicate: F) -> Vec<State>
    where
        F: Fn(&State) -> bool,
    {
        self.states
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Number of known entities
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the mirror has seen any entity yet
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
