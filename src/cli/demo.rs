//! Local participants for the `demo` command.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::conversation::{HistoryEntry, Role};
use crate::participant::{
    Delivery, DeliveryError, Participant, ParticipantKind, PresentationSink, ReplyError,
};

/// Agent that answers by quoting the first line of the latest entry.
pub struct EchoAgent {
    id: String,
    name: String,
    delay: Duration,
}

impl EchoAgent {
    pub fn new(id: &str, delay: Duration) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Copilot {}", id.trim_start_matches("copilot")),
            delay,
        }
    }
}

#[async_trait]
impl Participant for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::Agent
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    async fn generate_reply(
        &self,
        history: &[HistoryEntry],
        cancel: CancellationToken,
    ) -> Result<String, ReplyError> {
        let last = history
            .last()
            .ok_or_else(|| ReplyError::failed("empty history"))?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReplyError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        let first_line = last.content.lines().next().unwrap_or_default();
        let reply = match last.role {
            Role::User => format!("{} heard: {}", self.name, first_line),
            Role::Assistant => format!("{} agrees with: {}", self.name, first_line),
        };
        Ok(reply)
    }

    fn absorb_history(&self, entries: &[HistoryEntry]) {
        tracing::debug!("{} absorbed {} entries", self.id, entries.len());
    }
}

/// The human at the console. Never generates replies.
pub struct Operator {
    id: String,
}

impl Operator {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Participant for Operator {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::Operator
    }

    async fn generate_reply(
        &self,
        _history: &[HistoryEntry],
        _cancel: CancellationToken,
    ) -> Result<String, ReplyError> {
        Err(ReplyError::Unsupported(format!(
            "{} answers from the console",
            self.id
        )))
    }

    fn absorb_history(&self, entries: &[HistoryEntry]) {
        tracing::debug!("{} keeps {} entries", self.id, entries.len());
    }
}

/// Prints every delivery to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl PresentationSink for ConsoleSink {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let author = delivery.author.as_deref().unwrap_or("?");
        let via = delivery.via.as_deref().unwrap_or("-");
        println!(
            "[{}] {} -> {} ({}): {}",
            via, author, delivery.target_id, delivery.role, delivery.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_agent_quotes_first_line() {
        let agent = EchoAgent::new("copilot1", Duration::ZERO);
        let history = vec![HistoryEntry::user("Hej\nmore")];

        let reply = agent
            .generate_reply(&history, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "Copilot 1 heard: Hej");
    }

    #[tokio::test]
    async fn test_echo_agent_observes_cancel() {
        let agent = EchoAgent::new("copilot1", Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();

        let err = agent
            .generate_reply(&[HistoryEntry::user("x")], token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_operator_cannot_reply() {
        let operator = Operator::new("user");
        let err = operator
            .generate_reply(&[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Unsupported(_)));
    }
}
