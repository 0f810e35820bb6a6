//! Participant seam: the reply capability, participant lookup, and the presentation sink.
//!
//! The core never generates text itself. Everything it needs from the outside world
//! goes through the traits in this module, injected when the hub is built.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::conversation::{HistoryEntry, Role};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The in-flight request was cancelled. Not a failure.
    #[error("Reply cancelled")]
    Cancelled,

    #[error("Participant cannot reply: {0}")]
    Unsupported(String),

    #[error("Reply generation failed: {0}")]
    Failed(String),
}

impl ReplyError {
    pub fn failed(s: impl Into<String>) -> Self {
        ReplyError::Failed(s.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReplyError::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Target not found: {0}")]
    TargetMissing(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Whether a participant is the human operator or an agent instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Operator,
    Agent,
}

/// A conversation participant.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Opaque participant id.
    fn id(&self) -> &str;

    fn kind(&self) -> ParticipantKind;

    /// Author label used when this participant's messages are shown to others.
    fn display_name(&self) -> &str {
        self.id()
    }

    /// Produce a reply to the given history.
    ///
    /// Implementations should watch `cancel` and return [`ReplyError::Cancelled`]
    /// once it fires; callers also race the token themselves.
    async fn generate_reply(
        &self,
        history: &[HistoryEntry],
        cancel: CancellationToken,
    ) -> Result<String, ReplyError>;

    /// Append entries to this participant's own transcript.
    fn absorb_history(&self, entries: &[HistoryEntry]);
}

/// Resolves participant ids to live instances.
pub trait ParticipantDirectory: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Arc<dyn Participant>>;

    fn is_agent(&self, id: &str) -> bool {
        self.lookup(id)
            .map_or(false, |p| p.kind() == ParticipantKind::Agent)
    }
}

/// In-memory participant directory.
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: RwLock<HashMap<String, Arc<dyn Participant>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant, replacing any previous instance with the same id.
    pub fn register(&self, participant: Arc<dyn Participant>) {
        let id = participant.id().to_string();
        let mut participants = self
            .participants
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if participants.insert(id.clone(), participant).is_some() {
            tracing::debug!("Replaced participant {}", id);
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl ParticipantDirectory for ParticipantRegistry {
    fn lookup(&self, id: &str) -> Option<Arc<dyn Participant>> {
        self.participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

/// One message handed to the presentation layer for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub target_id: String,
    pub message: String,
    pub role: Role,
    /// Author label, if the message has one.
    pub author: Option<String>,
    /// Conversation id or route label the message travelled through.
    pub via: Option<String>,
}

/// Renders messages into participants' visible transcripts.
pub trait PresentationSink: Send + Sync {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// Sink that drops everything. Useful when only history matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        tracing::trace!("Discarding delivery to {}", delivery.target_id);
        Ok(())
    }
}
