//! Domain resolution and data shaping for remote service calls

use ha_agent_core::EntityId;
use serde_json::{Map, Value};

/// Domains whose entities answer turn_on/turn_off/toggle natively
///
/// Calls against any other domain are routed through the generic
/// `homeassistant` services, which accept any entity id.
static SWITCHABLE_DOMAINS: &[&str] = &[
    "automation",
    "camera",
    "climate",
    "fan",
    "group",
    "humidifier",
    "input_boolean",
    "light",
    "media_player",
    "remote",
    "script",
    "siren",
    "switch",
    "vacuum",
    "water_heater",
];

/// Generic fallback domain for on/off/toggle service calls
const GENERIC_DOMAIN: &str = "homeassistant";

/// Resolve the service domain for an on/off/toggle call on `entity_id`
pub(crate) fn service_domain(entity_id: &EntityId) -> &str {
    let domain = entity_id.domain();
    if SWITCHABLE_DOMAINS.contains(&domain) {
        domain
    } else {
        GENERIC_DOMAIN
    }
}

/// Build the service data map, with the entity id under its conventional key
pub(crate) fn service_data(
    entity_id: &EntityId,
    attributes: impl IntoIterator<Item = (String, Value)>,
) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert(
        "entity_id".to_string(),
        Value::String(entity_id.to_string()),
    );
    data.extend(attributes);
    data
}
