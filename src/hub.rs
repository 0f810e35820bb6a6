//! Hub: the application context that owns every core component.
//!
//! One `Hub` holds the conversation store, router, turn scheduler, traffic
//! controller, pause switch and event bus, wired to an injected participant
//! directory and presentation sink.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Settings;
use crate::core::conversation::{Conversation, ConversationStore, MemberRemoval, StoreStats};
use crate::core::events::{EventBus, HubEvent};
use crate::core::pause::{PauseController, PauseSignal};
use crate::core::routing::MessageRouter;
use crate::core::scheduler::{DrainReport, SubmitOutcome, TurnScheduler};
use crate::core::traffic::{
    OrchestrateOptions, OrchestrateOutcome, PolicyPatch, RoutePolicy, TrafficController,
};
use crate::participant::{ParticipantDirectory, PresentationSink};

/// What retiring a participant removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetireReport {
    /// The conversation it left and how the removal went
    pub conversation: Option<(String, MemberRemoval)>,
    pub discarded_markers: usize,
    pub dropped_routes: usize,
}

/// Hub-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub store: StoreStats,
    pub routes: usize,
    pub draining_routes: usize,
    pub replies_in_flight: usize,
    pub paused: bool,
}

impl std::fmt::Display for HubStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.store)?;
        writeln!(f, "Traffic Stats:")?;
        writeln!(f, "  Routes:        {}", self.routes)?;
        writeln!(f, "  Draining:      {}", self.draining_routes)?;
        writeln!(f, "Scheduler:")?;
        writeln!(f, "  In flight:     {}", self.replies_in_flight)?;
        write!(f, "  Paused:        {}", self.paused)
    }
}

pub struct Hub {
    settings: Settings,
    store: Arc<ConversationStore>,
    directory: Arc<dyn ParticipantDirectory>,
    router: Arc<MessageRouter>,
    scheduler: TurnScheduler,
    traffic: TrafficController,
    pause: Arc<PauseController>,
    events: EventBus,
}

impl Hub {
    pub fn new(
        directory: Arc<dyn ParticipantDirectory>,
        sink: Arc<dyn PresentationSink>,
        settings: Settings,
    ) -> Self {
        let events = EventBus::new();
        let store = Arc::new(ConversationStore::new());
        let pause = Arc::new(PauseController::default());
        let router = Arc::new(MessageRouter::new(
            directory.clone(),
            sink.clone(),
            events.clone(),
        ));
        let scheduler = TurnScheduler::new(
            store.clone(),
            router.clone(),
            directory.clone(),
            pause.clone(),
            events.clone(),
            settings.scheduler.clone(),
        );
        let traffic = TrafficController::new(
            directory.clone(),
            sink,
            events.clone(),
            settings.traffic.clone(),
            settings.scheduler.fallback_message.clone(),
        );

        Self {
            settings,
            store,
            directory,
            router,
            scheduler,
            traffic,
            pause,
            events,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn traffic(&self) -> &TrafficController {
        &self.traffic
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.store.get(id)
    }

    /// Put two participants in one conversation and return its id.
    ///
    /// Reuses `a`'s conversation, else `b`'s, else creates a new one. A
    /// participant already in a different conversation is moved out of it first.
    pub fn link(&self, a: &str, b: &str) -> String {
        let id = self
            .store
            .conversation_of(a)
            .or_else(|| self.store.conversation_of(b))
            .unwrap_or_else(|| self.store.create());

        for participant_id in [a, b] {
            if let Some(previous) = self.store.conversation_of(participant_id) {
                if previous != id {
                    tracing::debug!("Moving {} from {} to {}", participant_id, previous, id);
                    self.remove_member(&previous, participant_id);
                }
            }
            self.store.add_member(&id, participant_id);
        }

        tracing::info!("Linked {} and {} in {}", a, b, id);
        id
    }

    pub async fn submit(&self, conversation_id: &str, sender_id: &str, text: &str) -> SubmitOutcome {
        self.scheduler.submit(conversation_id, sender_id, text).await
    }

    /// Remove a member. When one member is left, the conversation history is
    /// handed to the survivor's own transcript.
    pub fn remove_member(&self, conversation_id: &str, participant_id: &str) -> MemberRemoval {
        let removal = self.store.remove_member(conversation_id, participant_id);

        if let MemberRemoval::Merged { survivor, history } = &removal {
            match self.directory.lookup(survivor) {
                Some(participant) => participant.absorb_history(history),
                None => tracing::warn!(
                    "Survivor {} of {} is gone, dropping {} history entries",
                    survivor,
                    conversation_id,
                    history.len()
                ),
            }
        }

        removal
    }

    pub async fn orchestrate(
        &self,
        from_id: &str,
        to_id: &str,
        text: &str,
        options: &OrchestrateOptions,
    ) -> OrchestrateOutcome {
        self.traffic.orchestrate(from_id, to_id, text, options).await
    }

    pub fn reset(&self, from_id: &str, to_id: &str) -> bool {
        self.traffic.reset(from_id, to_id)
    }

    pub fn set_policy(&self, from_id: &str, to_id: &str, patch: &PolicyPatch) -> RoutePolicy {
        self.traffic.set_policy(from_id, to_id, patch)
    }

    /// Stop starting new rounds. Returns false if already paused.
    pub fn pause(&self) -> bool {
        self.pause.pause()
    }

    /// Lift the pause and drain everything that queued up meanwhile.
    pub async fn resume(&self) -> Vec<(String, DrainReport)> {
        if !self.pause.resume() {
            tracing::debug!("Resume requested while not paused");
        }
        self.scheduler.resume_all().await
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn cancel_conversation(&self, conversation_id: &str) -> bool {
        self.scheduler.cancel(conversation_id)
    }

    pub fn cancel_route(&self, from_id: &str, to_id: &str) -> bool {
        self.traffic.cancel(from_id, to_id)
    }

    /// Take a participant out of the hub: leave its conversation, drop its
    /// queued markers and every route it is on.
    pub fn retire_participant(&self, participant_id: &str) -> RetireReport {
        let conversation = self.store.conversation_of(participant_id).map(|id| {
            let removal = self.remove_member(&id, participant_id);
            (id, removal)
        });
        let discarded_markers = self.store.discard_pending_from(participant_id);
        let dropped_routes = self.traffic.reset_participant(participant_id);

        tracing::info!(
            "Retired {}: {} marker(s) discarded, {} route(s) dropped",
            participant_id,
            discarded_markers,
            dropped_routes
        );

        RetireReport {
            conversation,
            discarded_markers,
            dropped_routes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> HubStats {
        let routes = self.traffic.routes();
        HubStats {
            store: self.store.stats(),
            routes: routes.len(),
            draining_routes: routes.iter().filter(|r| r.draining).count(),
            replies_in_flight: self.scheduler.in_flight().len(),
            paused: self.is_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::{PendingItem, Role};
    use crate::core::scheduler::{DrainReport, DrainStop};
    use crate::core::testing::{wait_until, CallLog, FakeParticipant, RecordingSink};
    use crate::participant::ParticipantRegistry;

    fn hub_with(ids: &[&str]) -> (Hub, Vec<Arc<FakeParticipant>>, Arc<RecordingSink>) {
        crate::logging::init_test();
        let registry = Arc::new(ParticipantRegistry::new());
        let participants: Vec<Arc<FakeParticipant>> = ids
            .iter()
            .map(|id| {
                let p = if *id == "user" {
                    FakeParticipant::operator(id)
                } else {
                    FakeParticipant::agent(id)
                };
                registry.register(p.clone());
                p
            })
            .collect();
        let sink = Arc::new(RecordingSink::new());
        let hub = Hub::new(registry, sink.clone(), Settings::default());
        (hub, participants, sink)
    }

    #[test]
    fn test_link_reuses_existing_conversation() {
        let (hub, _, _) = hub_with(&["user", "a", "b"]);

        let first = hub.link("user", "a");
        assert!(first.starts_with("conv_"));
        let second = hub.link("b", "a");
        assert_eq!(first, second);
        assert_eq!(hub.conversation(&first).unwrap().members, vec!["user", "a", "b"]);
    }

    #[test]
    fn test_link_moves_participant() {
        let (hub, participants, _) = hub_with(&["a", "b", "c", "d"]);
        let left = hub.link("a", "b");
        let right = hub.link("c", "d");
        hub.store().append_history(&right, crate::core::HistoryEntry::user("hi"));

        // c moves into a's conversation; d is left alone and absorbs the history.
        let joined = hub.link("a", "c");
        assert_eq!(joined, left);
        assert!(hub.conversation(&right).is_none());
        assert_eq!(hub.conversation(&left).unwrap().members, vec!["a", "b", "c"]);
        assert_eq!(participants[3].absorbed().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_on_removal() {
        let (hub, participants, _) = hub_with(&["user", "copilot1"]);
        let id = hub.link("user", "copilot1");
        hub.submit(&id, "user", "Hej").await;

        let removal = hub.remove_member(&id, "user");
        assert!(matches!(removal, MemberRemoval::Merged { .. }));
        assert!(hub.conversation(&id).is_none());

        let absorbed = participants[1].absorbed();
        assert_eq!(absorbed.len(), 2);
        assert_eq!(absorbed[0].content, "Hej");
        assert_eq!(absorbed[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (hub, participants, _) = hub_with(&["user", "copilot1"]);
        let id = hub.link("user", "copilot1");
        let mut events = hub.subscribe();

        assert!(hub.pause());
        assert!(!hub.pause());
        assert_eq!(hub.submit(&id, "user", "one").await, SubmitOutcome::Queued);
        assert_eq!(hub.submit(&id, "user", "two").await, SubmitOutcome::Queued);
        assert_eq!(participants[1].call_count(), 0);
        assert!(hub.stats().paused);

        let reports = hub.resume().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.rounds.len(), 2);
        assert_eq!(reports[0].1.stop, DrainStop::Idle);
        // Two rounds alternate between the two members.
        assert_eq!(participants[1].call_count(), 1);
        assert_eq!(participants[0].call_count(), 1);

        let mut queued = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HubEvent::MessageQueued { .. }) {
                queued += 1;
            }
        }
        assert_eq!(queued, 2);
    }

    #[tokio::test]
    async fn test_retire_participant() {
        let (hub, participants, _) = hub_with(&["user", "a", "b"]);
        let id = hub.link("user", "a");
        hub.link("user", "b");
        hub.pause();
        hub.submit(&id, "a", "from a").await;
        hub.submit(&id, "user", "from user").await;
        hub.set_policy("a", "b", &PolicyPatch::new());
        hub.set_policy("b", "a", &PolicyPatch::new());

        let report = hub.retire_participant("a");

        assert_eq!(
            report.conversation,
            Some((id.clone(), MemberRemoval::Removed { remaining: 2 }))
        );
        assert_eq!(report.discarded_markers, 1);
        assert_eq!(report.dropped_routes, 2);
        assert_eq!(hub.conversation(&id).unwrap().members, vec!["user", "b"]);
        assert_eq!(participants[1].call_count(), 0);

        let stats = hub.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.store.with_pending, 1);
    }

    #[tokio::test]
    async fn test_retire_during_round_keeps_one_reply_in_flight() {
        let (hub, participants, _) = hub_with(&["user", "a", "b"]);
        let log = CallLog::new();
        for p in &participants {
            p.set_hang(true);
            p.set_log(&log);
        }
        let id = hub.link("user", "a");
        hub.link("user", "b");
        hub.store()
            .enqueue_pending(&id, PendingItem::new("user", "first"));
        hub.store()
            .enqueue_pending(&id, PendingItem::new("b", "second"));

        let (report, again) = tokio::join!(hub.scheduler().drain(&id), async {
            wait_until(|| participants[1].call_count() == 1).await;

            let retired = hub.retire_participant("b");
            assert_eq!(retired.discarded_markers, 1);
            assert!(hub.store().is_busy(&id));

            let again = hub.submit(&id, "user", "again").await;
            assert!(hub.cancel_conversation(&id));
            again
        });

        assert_eq!(
            again,
            SubmitOutcome::Drained(DrainReport {
                rounds: Vec::new(),
                stop: DrainStop::Busy,
            })
        );
        assert_eq!(report.stop, DrainStop::Cancelled);
        assert_eq!(log.max_in_flight(), 1);
        assert_eq!(log.order(), vec!["a"]);

        let payloads: Vec<String> = hub
            .store()
            .pending(&id)
            .unwrap()
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(payloads, vec!["first", "again"]);
        assert!(!hub.store().is_busy(&id));
        assert_eq!(hub.stats().replies_in_flight, 0);
    }

    #[tokio::test]
    async fn test_orchestrate_through_hub() {
        let (hub, _, sink) = hub_with(&["a", "b"]);

        let outcome = hub
            .orchestrate("a", "b", "1\n2\n3\n4", &OrchestrateOptions::default())
            .await;

        assert!(matches!(outcome, OrchestrateOutcome::Drained(_)));
        let batches: Vec<String> = sink
            .for_target("b")
            .into_iter()
            .filter(|d| d.role == Role::User)
            .map(|d| d.message)
            .collect();
        assert_eq!(batches, vec!["1\n2\n3", "4"]);
        assert!(hub.reset("a", "b"));
        assert!(!hub.cancel_route("a", "b"));
        assert!(!hub.cancel_conversation("nope"));
    }
}
