//! RPC connection capability
//!
//! Actors register their address with the connection and push unsolicited
//! events through it. Marshalling of requests and responses belongs to the
//! service layer.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::ActorId;

/// Unsolicited event pushed from an actor to the connected peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorEvent {
    /// Emitting actor
    pub from: ActorId,

    /// Event type name on the wire
    #[serde(rename = "type")]
    pub kind: String,

    /// Event payload
    pub data: Value,
}

/// Connection to one remote peer
pub trait Connection: Send + Sync {
    /// Make `actor` addressable
    fn register_actor(&self, actor: &ActorId, type_name: &'static str);

    /// Stop routing to `actor`
    fn unregister_actor(&self, actor: &ActorId);

    /// Queue an event for the peer
    ///
    /// Must not block and must not call back into any actor: sandboxed code
    /// emits from inside actor calls.
    fn emit(&self, event: ActorEvent);
}

/// Connection that queues events until the transport drains them
#[derive(Default)]
pub struct BufferedConnection {
    actors: Mutex<HashMap<ActorId, &'static str>>,
    events: Mutex<VecDeque<ActorEvent>>,
}

impl BufferedConnection {
    /// Create an empty connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all queued events in emission order
    pub fn drain_events(&self) -> Vec<ActorEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Number of queued events
    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Type name of a registered actor
    pub fn actor_type(&self, actor: &ActorId) -> Option<&'static str> {
        self.actors.lock().get(actor).copied()
    }

    /// Number of registered actors
    pub fn registered_actors(&self) -> usize {
        self.actors.lock().len()
    }
}

impl Connection for BufferedConnection {
    fn register_actor(&self, actor: &ActorId, type_name: &'static str) {
        self.actors.lock().insert(actor.clone(), type_name);
    }

    fn unregister_actor(&self, actor: &ActorId) {
        self.actors.lock().remove(actor);
    }

    fn emit(&self, event: ActorEvent) {
        self.events.lock().push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_drain_in_order() {
        let conn = BufferedConnection::new();
        let actor = ActorId::new();

        for n in 0..3 {
            conn.emit(ActorEvent {
                from: actor.clone(),
                kind: "instrumenterEvent".into(),
                data: json!({ "n": n }),
            });
        }

        let events = conn.drain_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].data, json!({ "n": 2 }));
        assert_eq!(conn.pending_events(), 0);
    }

    #[test]
    fn test_register_unregister() {
        let conn = BufferedConnection::new();
        let actor = ActorId::new();

        conn.register_actor(&actor, "instrumenter");
        assert_eq!(conn.actor_type(&actor), Some("instrumenter"));

        conn.unregister_actor(&actor);
        assert_eq!(conn.actor_type(&actor), None);
        assert_eq!(conn.registered_actors(), 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ActorEvent {
            from: ActorId::new(),
            kind: "instrumenterEvent".into(),
            data: json!({ "name": "echo", "data": null }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "instrumenterEvent");
        assert_eq!(value["data"]["name"], "echo");
    }
}
