//! Wire-level event types from the remote feed

use serde::{Deserialize, Serialize};

use crate::{EntityId, State};

/// Event kind carrying an entity state transition
pub const STATE_CHANGED: &str = "state_changed";

/// A raw event read from the remote feed
///
/// Only the kind and data payload matter to the agent; other wire fields
/// (origin, fire time, context) are tolerated and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// The event kind (e.g. "state_changed", "service_registered")
    pub event_type: String,

    /// Kind-specific payload; `Null` when the feed sent none
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventMessage {
    /// Whether this event carries a state transition
    pub fn is_state_changed(&self) -> bool {
        self.event_type == STATE_CHANGED
    }
}

/// A single entity state transition
///
/// `old_state` is absent when the entity first appeared; `new_state` is
/// absent when the entity was removed. Decoded from the data payload of a
/// `state_changed` event and consumed exactly once by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub entity_id: EntityId,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
}
