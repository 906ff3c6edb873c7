//! Integration tests for the agent host, driven through scripted collaborators

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_test::assert_ok;

use ha_agent::{
    Agent, ClientError, ConnectConfig, EntityId, EventClient, EventMessage, RunError, RunPhase,
    Scheduler, State, StateChange, STATE_CHANGED,
};

/// Shared record of teardown side effects, in the order they completed
type ActionLog = Arc<Mutex<Vec<&'static str>>>;

enum Feed {
    Event(EventMessage),
    Error(ClientError),
}

/// Transport that serves a scripted sequence of reads, then idles
struct ScriptedClient {
    accept: bool,
    feed: Mutex<VecDeque<Feed>>,
    log: ActionLog,
    service_calls: Mutex<Vec<(String, String, Map<String, Value>)>>,
}

#[async_trait]
impl EventClient for ScriptedClient {
    async fn connect(&self, _config: &ConnectConfig) -> Result<bool, ClientError> {
        Ok(self.accept)
    }

    async fn subscribe_events(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn read_event(&self) -> Result<Option<EventMessage>, ClientError> {
        match self.feed.lock().unwrap().pop_front() {
            Some(Feed::Event(msg)) => Ok(Some(msg)),
            Some(Feed::Error(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> Result<(), ClientError> {
        self.service_calls
            .lock()
            .unwrap()
            .push((domain.to_string(), service.to_string(), data));
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.log.lock().unwrap().push("close");
        Ok(())
    }
}

/// Scheduler whose stop takes long enough to expose ordering violations
struct RecordingScheduler {
    log: ActionLog,
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn stop(&self) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.log.lock().unwrap().push("scheduler_stop");
    }
}

struct Harness {
    agent: Arc<Agent>,
    client: Arc<ScriptedClient>,
    log: ActionLog,
}

fn harness(accept: bool, feed: Vec<Feed>) -> Harness {
    let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(ScriptedClient {
        accept,
        feed: Mutex::new(feed.into()),
        log: log.clone(),
        service_calls: Mutex::new(Vec::new()),
    });
    let scheduler = Arc::new(RecordingScheduler { log: log.clone() });
    let agent = Arc::new(Agent::new(
        ConnectConfig::default(),
        client.clone(),
        scheduler,
    ));
    Harness { agent, client, log }
}

fn state_event(entity_id: &str, old: Option<&str>, new: Option<&str>) -> Feed {
    let snapshot = |value: &str| State::new(entity_id.parse().unwrap(), value, Default::default());
    let change = StateChange {
        entity_id: entity_id.parse().unwrap(),
        old_state: old.map(snapshot),
        new_state: new.map(snapshot),
    };
    Feed::Event(EventMessage {
        event_type: STATE_CHANGED.to_string(),
        data: serde_json::to_value(&change).unwrap(),
    })
}

#[tokio::test]
async fn test_refused_connection_is_a_silent_early_return() {
    let h = harness(false, vec![]);

    assert_ok!(h.agent.run().await);
    assert_eq!(h.agent.phase(), RunPhase::Stopped);
    // Nothing was started, so nothing was torn down.
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_state_changes_reach_mirror_and_handlers() {
    let h = harness(true, vec![state_event("light.kitchen", Some("off"), Some("on"))]);

    let seen = Arc::new(Notify::new());
    let captured = Arc::new(Mutex::new(None));
    {
        let seen = seen.clone();
        let captured = captured.clone();
        h.agent.listen_state("light.kitchen", move |id, new, old| {
            let seen = seen.clone();
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = Some((id, new, old));
                seen.notify_one();
                Ok(())
            }
        });
    }

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), seen.notified())
        .await
        .expect("handler should fire");

    let (id, new, old) = captured.lock().unwrap().take().unwrap();
    assert_eq!(id, "light.kitchen");
    assert_eq!(new.unwrap().state, "on");
    assert_eq!(old.unwrap().state, "off");

    // The mirror was updated before the handler was dispatched.
    assert_eq!(h.agent.get_state("light.kitchen").unwrap().state, "on");
    assert_eq!(h.agent.query_states(|s| s.domain() == "light").len(), 1);

    h.agent.stop().await;
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
    assert_eq!(h.agent.phase(), RunPhase::Stopped);
}

#[tokio::test]
async fn test_removed_entity_leaves_the_mirror() {
    let h = harness(
        true,
        vec![
            state_event("sensor.door", None, Some("open")),
            state_event("sensor.door", Some("open"), None),
        ],
    );

    let removed = Arc::new(Notify::new());
    {
        let removed = removed.clone();
        h.agent.listen_state("sensor.door", move |_, new, _| {
            let removed = removed.clone();
            async move {
                if new.is_none() {
                    removed.notify_one();
                }
                Ok(())
            }
        });
    }

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), removed.notified())
        .await
        .expect("removal should dispatch");
    assert!(h.agent.get_state("sensor.door").is_none());

    h.agent.stop().await;
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
}

#[tokio::test]
async fn test_blocked_handler_does_not_stall_ingestion() {
    let h = harness(
        true,
        vec![
            state_event("light.a", None, Some("on")),
            state_event("light.b", None, Some("on")),
        ],
    );

    // First handler suspends forever; the second notification must still
    // be read and dispatched.
    h.agent.listen_state("light.a", |_, _, _| async {
        std::future::pending::<()>().await;
        Ok(())
    });

    let second = Arc::new(Notify::new());
    {
        let second = second.clone();
        h.agent.listen_state("light.b", move |_, _, _| {
            let second = second.clone();
            async move {
                second.notify_one();
                Ok(())
            }
        });
    }

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), second.notified())
        .await
        .expect("second handler should run while the first is blocked");

    // Stop must not wait on the blocked handler either.
    timeout(Duration::from_secs(2), h.agent.stop())
        .await
        .expect("stop should not hang");
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness(true, vec![]);

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), async {
        while h.agent.phase() != RunPhase::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop should reach the serving state");

    h.agent.stop().await;
    h.agent.stop().await;
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
    h.agent.stop().await;

    // One scheduler stop, one close, in that order, with no repeats.
    assert_eq!(*h.log.lock().unwrap(), vec!["scheduler_stop", "close"]);
}

#[tokio::test]
async fn test_teardown_order_survives_concurrent_stops() {
    for _ in 0..25 {
        let h = harness(true, vec![]);

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });

        let first = tokio::spawn({
            let agent = h.agent.clone();
            async move { agent.stop().await }
        });
        let second = tokio::spawn({
            let agent = h.agent.clone();
            async move { agent.stop().await }
        });

        first.await.unwrap();
        second.await.unwrap();
        assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));

        assert_eq!(*h.log.lock().unwrap(), vec!["scheduler_stop", "close"]);
    }
}

#[tokio::test]
async fn test_malformed_state_changed_payload_is_fatal() {
    let h = harness(
        true,
        vec![Feed::Event(EventMessage {
            event_type: STATE_CHANGED.to_string(),
            data: json!({"not": "a state change"}),
        })],
    );

    let err = h.agent.run().await.unwrap_err();
    assert!(matches!(err, RunError::MalformedEvent(_)));

    // Fatal exits still tear down in order.
    assert_eq!(*h.log.lock().unwrap(), vec!["scheduler_stop", "close"]);
    assert_eq!(h.agent.phase(), RunPhase::Stopped);
}

#[tokio::test]
async fn test_transport_error_propagates_after_teardown() {
    let h = harness(true, vec![Feed::Error(ClientError::ConnectionClosed)]);

    let err = h.agent.run().await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Client(ClientError::ConnectionClosed)
    ));
    assert_eq!(*h.log.lock().unwrap(), vec!["scheduler_stop", "close"]);
}

#[tokio::test]
async fn test_other_event_kinds_are_ignored() {
    let h = harness(
        true,
        vec![
            Feed::Event(EventMessage {
                event_type: "service_registered".to_string(),
                data: json!({"domain": "light", "service": "turn_on"}),
            }),
            state_event("light.kitchen", None, Some("on")),
        ],
    );

    let seen = Arc::new(Notify::new());
    {
        let seen = seen.clone();
        h.agent.listen_state("", move |_, _, _| {
            let seen = seen.clone();
            async move {
                seen.notify_one();
                Ok(())
            }
        });
    }

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), seen.notified())
        .await
        .expect("the state change should still come through");
    // Only the state change dispatched; the foreign event left no trace.
    assert!(h.agent.get_state("light.kitchen").is_some());

    h.agent.stop().await;
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_handlers() {
    let h = harness(true, vec![state_event("light.slow", None, Some("on"))]);

    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    {
        let started = started.clone();
        let finished = finished.clone();
        h.agent.listen_state("light.slow", move |_, _, _| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    let agent = h.agent.clone();
    let run = tokio::spawn(async move { agent.run().await });

    timeout(Duration::from_secs(2), started.notified())
        .await
        .expect("handler should start");
    h.agent.drain().await;
    assert!(finished.load(Ordering::SeqCst));

    h.agent.stop().await;
    assert!(matches!(run.await.unwrap(), Err(RunError::Cancelled)));
}

#[tokio::test]
async fn test_service_helpers_route_domains() {
    let h = harness(true, vec![]);

    let light: EntityId = "light.kitchen".parse().unwrap();
    h.agent
        .turn_on(&light, [("brightness".to_string(), json!(128))])
        .await
        .unwrap();

    let lock: EntityId = "lock.front_door".parse().unwrap();
    h.agent.turn_off(&lock, std::iter::empty()).await.unwrap();

    let pump: EntityId = "switch.pump".parse().unwrap();
    h.agent.toggle(&pump, std::iter::empty()).await.unwrap();

    h.agent
        .call_service("notify", "mobile_app", Map::new())
        .await
        .unwrap();

    let calls = h.client.service_calls.lock().unwrap();
    assert_eq!(calls.len(), 4);

    assert_eq!((calls[0].0.as_str(), calls[0].1.as_str()), ("light", "turn_on"));
    assert_eq!(calls[0].2["entity_id"], json!("light.kitchen"));
    assert_eq!(calls[0].2["brightness"], json!(128));

    // Lock is not in the on/off allow-list: generic domain.
    assert_eq!(
        (calls[1].0.as_str(), calls[1].1.as_str()),
        ("homeassistant", "turn_off")
    );
    assert_eq!(calls[1].2["entity_id"], json!("lock.front_door"));

    assert_eq!((calls[2].0.as_str(), calls[2].1.as_str()), ("switch", "toggle"));
    assert_eq!((calls[3].0.as_str(), calls[3].1.as_str()), ("notify", "mobile_app"));
}
