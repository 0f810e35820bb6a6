//! Observability events emitted by the router, scheduler and traffic controller.

use serde::Serialize;
use tokio::sync::broadcast;

use super::conversation::Role;

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    MessageRouted {
        conversation_id: String,
        role: Role,
        targets: Vec<String>,
        failed: usize,
    },
    MessageQueued {
        conversation_id: String,
        sender_id: String,
        reason: String,
    },
    TurnStarted {
        conversation_id: String,
        responder_id: String,
    },
    TurnCompleted {
        conversation_id: String,
        responder_id: String,
    },
    TurnFailed {
        conversation_id: String,
        responder_id: String,
        error: String,
    },
    TurnCancelled {
        conversation_id: String,
        responder_id: String,
    },
    RouteBatchDelivered {
        route: String,
        round: u32,
        remaining: usize,
    },
    RouteStopped {
        route: String,
        reason: String,
    },
}

/// Fan-out of [`HubEvent`]s. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HubEvent) {
        tracing::trace!(?event, "event");
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
