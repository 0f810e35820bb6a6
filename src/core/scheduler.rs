//! Turn scheduler: drains each conversation's pending queue one round at a time.
//!
//! A round claims exactly one pending marker, advances the turn cursor, asks the
//! member at the cursor for a reply and routes the result to every member. The
//! busy flag on the conversation is the only thing that keeps two rounds of the
//! same conversation from overlapping; it is claimed atomically by
//! [`ConversationStore::begin_round`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::participant::{ParticipantDirectory, ReplyError};

use super::conversation::{ConversationStore, HistoryEntry, PendingItem, Round, RoundStart};
use super::events::{EventBus, HubEvent};
use super::pause::PauseSignal;
use super::routing::{MessageRouter, RouteOptions};

/// Result of [`TurnScheduler::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No such conversation; nothing was recorded.
    NotFound,
    /// Recorded and queued, but the flow is paused.
    Queued,
    /// Recorded and drained.
    Drained(DrainReport),
}

/// How one round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Replied { responder_id: String },
    /// Generation failed and the fallback message was routed instead.
    Fallback { responder_id: String, error: String },
    /// Cancelled; the marker is back in the queue.
    Cancelled { responder_id: String },
}

/// Why a drain loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    NotFound,
    /// Another loop owns the conversation.
    Busy,
    Paused,
    /// The queue is empty.
    Idle,
    NoMembers,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub rounds: Vec<RoundOutcome>,
    pub stop: DrainStop,
}

struct SchedulerInner {
    store: Arc<ConversationStore>,
    router: Arc<MessageRouter>,
    directory: Arc<dyn ParticipantDirectory>,
    pause: Arc<dyn PauseSignal>,
    events: EventBus,
    config: SchedulerConfig,
    /// Generation and cancellation token of in-flight rounds, by conversation id
    in_flight: Mutex<HashMap<String, (u64, CancellationToken)>>,
}

impl SchedulerInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases a claimed round however the round ends.
///
/// If the marker was never consumed (cancellation, or the drain future being
/// dropped mid-await) it goes back to the front of the queue. Everything is
/// keyed on the round's generation, so a conversation re-created under the same
/// id is never touched.
struct RoundGuard<'a> {
    inner: &'a SchedulerInner,
    conversation_id: &'a str,
    generation: u64,
    marker: Option<PendingItem>,
    previous_cursor: usize,
}

impl RoundGuard<'_> {
    fn consume(&mut self) {
        self.marker = None;
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        {
            let mut in_flight = self.inner.lock_in_flight();
            if matches!(in_flight.get(self.conversation_id), Some((g, _)) if *g == self.generation)
            {
                in_flight.remove(self.conversation_id);
            }
        }

        match self.marker.take() {
            Some(marker) => {
                if self.inner.store.abort_round(
                    self.conversation_id,
                    self.generation,
                    marker,
                    self.previous_cursor,
                ) {
                    tracing::debug!("Round in {} abandoned, marker restored", self.conversation_id);
                }
            }
            None => {
                self.inner
                    .store
                    .end_round(self.conversation_id, self.generation);
            }
        }
    }
}

/// Per-conversation round-robin scheduler. Cheap to clone.
#[derive(Clone)]
pub struct TurnScheduler {
    inner: Arc<SchedulerInner>,
}

impl TurnScheduler {
    pub fn new(
        store: Arc<ConversationStore>,
        router: Arc<MessageRouter>,
        directory: Arc<dyn ParticipantDirectory>,
        pause: Arc<dyn PauseSignal>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                router,
                directory,
                pause,
                events,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record a user message, show it to the other members, queue a round and,
    /// unless paused, drain.
    pub async fn submit(&self, conversation_id: &str, sender_id: &str, text: &str) -> SubmitOutcome {
        let inner = &*self.inner;

        let entry = HistoryEntry::user(text).with_sender(sender_id);
        if !inner.store.append_history(conversation_id, entry) {
            tracing::warn!("Submit to unknown conversation {}", conversation_id);
            return SubmitOutcome::NotFound;
        }

        if let Some(view) = inner.store.view(conversation_id) {
            if !view.members.iter().any(|m| m == sender_id) {
                tracing::debug!("{} submitted to {} without being a member", sender_id, conversation_id);
            }
            let author = self.display_name(sender_id);
            inner
                .router
                .route(&view, text, &RouteOptions::user(sender_id).with_author(&author));
        }

        inner
            .store
            .enqueue_pending(conversation_id, PendingItem::new(sender_id, text));

        if inner.pause.is_paused() {
            tracing::info!("Flow paused, message from {} queued in {}", sender_id, conversation_id);
            inner.events.emit(HubEvent::MessageQueued {
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                reason: "paused".to_string(),
            });
            return SubmitOutcome::Queued;
        }

        SubmitOutcome::Drained(self.drain(conversation_id).await)
    }

    /// Run rounds until the queue is empty, the flow is paused, or a round is
    /// cancelled. Returns at once if another loop already owns the conversation.
    pub async fn drain(&self, conversation_id: &str) -> DrainReport {
        let mut rounds = Vec::new();

        let stop = loop {
            if self.inner.pause.is_paused() {
                break DrainStop::Paused;
            }

            let round = match self.inner.store.begin_round(conversation_id) {
                RoundStart::Started(round) => round,
                RoundStart::NotFound => break DrainStop::NotFound,
                RoundStart::Busy => break DrainStop::Busy,
                RoundStart::Idle => break DrainStop::Idle,
                RoundStart::NoMembers => break DrainStop::NoMembers,
            };

            let outcome = self.run_round(conversation_id, round).await;
            let cancelled = matches!(outcome, RoundOutcome::Cancelled { .. });
            rounds.push(outcome);

            if cancelled {
                break DrainStop::Cancelled;
            }
            if !self.inner.store.has_pending(conversation_id) {
                break DrainStop::Idle;
            }

            // Let other tasks in before the next round.
            tokio::task::yield_now().await;
        };

        tracing::debug!(
            "Drain of {} stopped ({:?}) after {} round(s)",
            conversation_id,
            stop,
            rounds.len()
        );

        DrainReport { rounds, stop }
    }

    async fn run_round(&self, conversation_id: &str, round: Round) -> RoundOutcome {
        let inner = &*self.inner;

        let generation = round.generation;
        let token = CancellationToken::new();
        inner
            .lock_in_flight()
            .insert(conversation_id.to_string(), (generation, token.clone()));

        let mut guard = RoundGuard {
            inner,
            conversation_id,
            generation,
            marker: Some(round.marker),
            previous_cursor: round.previous_cursor,
        };
        let responder_id = round.responder;

        tracing::debug!("Turn in {} goes to {}", conversation_id, responder_id);
        inner.events.emit(HubEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            responder_id: responder_id.clone(),
        });

        let reply = match inner.directory.lookup(&responder_id) {
            Some(participant) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ReplyError::Cancelled),
                    reply = participant.generate_reply(&round.history, token.child_token()) => reply,
                }
            }
            None => Err(ReplyError::Unsupported(format!(
                "participant {} not found",
                responder_id
            ))),
        };

        match reply {
            Err(ReplyError::Cancelled) => {
                tracing::info!("Turn of {} in {} cancelled", responder_id, conversation_id);
                inner.events.emit(HubEvent::TurnCancelled {
                    conversation_id: conversation_id.to_string(),
                    responder_id: responder_id.clone(),
                });
                RoundOutcome::Cancelled { responder_id }
            }
            Ok(text) => {
                guard.consume();
                let text = if text.trim().is_empty() {
                    inner.config.empty_reply_placeholder.clone()
                } else {
                    text
                };
                self.publish(conversation_id, generation, &responder_id, text);
                inner.events.emit(HubEvent::TurnCompleted {
                    conversation_id: conversation_id.to_string(),
                    responder_id: responder_id.clone(),
                });
                RoundOutcome::Replied { responder_id }
            }
            Err(e) => {
                guard.consume();
                tracing::warn!(
                    "Reply from {} in {} failed: {}",
                    responder_id,
                    conversation_id,
                    e
                );
                self.publish(
                    conversation_id,
                    generation,
                    &responder_id,
                    inner.config.fallback_message.clone(),
                );
                inner.events.emit(HubEvent::TurnFailed {
                    conversation_id: conversation_id.to_string(),
                    responder_id: responder_id.clone(),
                    error: e.to_string(),
                });
                RoundOutcome::Fallback {
                    responder_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Append an assistant entry and route it to every member.
    fn publish(&self, conversation_id: &str, generation: u64, responder_id: &str, text: String) {
        let inner = &*self.inner;

        let entry = HistoryEntry::assistant(text.as_str()).with_sender(responder_id);
        if !inner.store.append_reply(conversation_id, generation, entry) {
            tracing::debug!("Conversation {} closed before its reply landed", conversation_id);
            return;
        }

        if let Some(view) = inner.store.view(conversation_id) {
            let author = self.display_name(responder_id);
            inner
                .router
                .route(&view, &text, &RouteOptions::assistant(Some(&author)));
        }
    }

    fn display_name(&self, participant_id: &str) -> String {
        self.inner
            .directory
            .lookup(participant_id)
            .map(|p| p.display_name().to_string())
            .unwrap_or_else(|| participant_id.to_string())
    }

    /// Drain every idle conversation that has queued work, concurrently.
    pub async fn resume_all(&self) -> Vec<(String, DrainReport)> {
        let ids = self.inner.store.resumable();
        tracing::info!("Resuming {} conversation(s)", ids.len());

        let mut tasks = JoinSet::new();
        for id in ids {
            let scheduler = self.clone();
            tasks.spawn(async move {
                let report = scheduler.drain(&id).await;
                (id, report)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Drain task failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports
    }

    /// Cancel the in-flight round of a conversation. Returns false if none.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.inner.lock_in_flight().get(conversation_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Conversations with a reply in flight.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_in_flight().keys().cloned().collect();
        ids.sort();
        ids
    }
}
