//! Core module - conversations, routing, turn scheduling and traffic pacing.
//!
//! This module contains the heart of copilot-hub's message processing:
//! - Conversation store (membership, history, pending queue)
//! - Message routing to conversation members
//! - Per-conversation round-robin turn scheduling
//! - Batch pacing of agent-to-agent routes

pub mod chunking;
pub mod conversation;
pub mod events;
pub mod pause;
pub mod routing;
pub mod scheduler;
pub mod traffic;

#[cfg(test)]
pub(crate) mod testing;

pub use conversation::{Conversation, ConversationStore, HistoryEntry, MemberRemoval, Role};
pub use events::{EventBus, HubEvent};
pub use pause::{PauseController, PauseSignal};
pub use routing::{MessageRouter, RouteOptions, Strategy};
pub use scheduler::{DrainReport, DrainStop, RoundOutcome, SubmitOutcome, TurnScheduler};
pub use traffic::{
    OrchestrateOptions, OrchestrateOutcome, PolicyPatch, RouteKey, RoutePolicy, RouteReport,
    RouteSnapshot, RouteStop, TrafficController,
};
