//! Conversation store for copilot-hub.
//!
//! Handles:
//! - Conversation membership and shared history
//! - Turn cursor bookkeeping
//! - The pending-work queue and the busy flag
//!
//! Every operation on an unknown conversation id is a no-op that reports
//! "not found" through its return value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Author role of a history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,

    /// Unix timestamp (ms)
    pub timestamp: i64,

    /// Participant that produced the entry, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_timestamp(),
            sender_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_sender(mut self, sender_id: &str) -> Self {
        self.sender_id = Some(sender_id.to_string());
        self
    }
}

/// A marker of unconsumed scheduling work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingItem {
    pub sender_id: String,
    pub payload: String,
    pub enqueued_at: i64,
}

impl PendingItem {
    pub fn new(sender_id: &str, payload: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            payload: payload.to_string(),
            enqueued_at: now_timestamp(),
        }
    }
}

/// A shared multi-party thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: String,

    /// Member ids, unique, in join order
    pub members: Vec<String>,

    /// Shared history
    pub history: Vec<HistoryEntry>,

    /// Index into `members` of the last selected responder
    pub turn_cursor: usize,

    /// FIFO of pending work
    pub pending: VecDeque<PendingItem>,

    /// True while a round is in flight
    pub busy: bool,

    /// Distinguishes this record from an earlier one under the same id
    pub generation: u64,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new(id: &str) -> Self {
        let now = now_timestamp();

        Self {
            id: id.to_string(),
            members: Vec::new(),
            history: Vec::new(),
            turn_cursor: 0,
            pending: VecDeque::new(),
            busy: false,
            generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, participant_id: &str) -> bool {
        self.members.iter().any(|m| m == participant_id)
    }

    /// Add a member. Returns false if it was already present.
    pub fn add_member(&mut self, participant_id: &str) -> bool {
        if self.is_member(participant_id) {
            return false;
        }
        self.members.push(participant_id.to_string());
        self.touch();
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn touch(&mut self) {
        self.updated_at = now_timestamp();
    }
}

/// Routing-relevant view of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub id: String,
    pub members: Vec<String>,
    pub turn_cursor: usize,
}

/// Result of removing a member.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberRemoval {
    /// No such conversation.
    NotFound,
    /// The participant was not a member.
    NotMember,
    /// Removed; the conversation lives on with `remaining` members.
    Removed { remaining: usize },
    /// One member was left: the conversation was deleted and its history is
    /// handed back for the survivor's own transcript.
    Merged {
        survivor: String,
        history: Vec<HistoryEntry>,
    },
    /// No members were left and the conversation was deleted.
    Deleted,
}

/// A round claimed by the scheduler.
#[derive(Debug, Clone)]
pub struct Round {
    /// The consumed pending marker
    pub marker: PendingItem,

    /// Cursor before the round advanced it
    pub previous_cursor: usize,

    /// Member now at the cursor
    pub responder: String,

    /// Generation of the conversation the round belongs to
    pub generation: u64,

    /// History snapshot taken when the round started
    pub history: Vec<HistoryEntry>,
}

/// Result of trying to claim a round.
#[derive(Debug, Clone)]
pub enum RoundStart {
    NotFound,
    Busy,
    /// Nothing queued.
    Idle,
    NoMembers,
    Started(Round),
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub conversations: usize,
    pub members: usize,
    pub messages: usize,
    pub busy: usize,
    pub with_pending: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Conversation Stats:")?;
        writeln!(f, "  Conversations: {}", self.conversations)?;
        writeln!(f, "  Members:       {}", self.members)?;
        writeln!(f, "  Messages:      {}", self.messages)?;
        writeln!(f, "  Busy:          {}", self.busy)?;
        write!(f, "  With pending:  {}", self.with_pending)
    }
}

/// Owner of all conversation records.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    generations: AtomicU64,
}

impl ConversationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh(&self, id: &str) -> Conversation {
        let mut conv = Conversation::new(id);
        conv.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        conv
    }

    /// Get an existing conversation or create an empty one. Returns a snapshot.
    pub fn ensure(&self, id: &str) -> Conversation {
        let mut conversations = self.lock();
        conversations
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Created conversation {}", id);
                self.fresh(id)
            })
            .clone()
    }

    /// Create a conversation with a generated id.
    pub fn create(&self) -> String {
        let id = format!("conv_{}", ulid::Ulid::new());
        self.ensure(&id);
        id
    }

    /// Snapshot of a conversation.
    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn view(&self, id: &str) -> Option<ConversationView> {
        self.lock().get(id).map(|conv| ConversationView {
            id: conv.id.clone(),
            members: conv.members.clone(),
            turn_cursor: conv.turn_cursor,
        })
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Id of the conversation a participant belongs to.
    pub fn conversation_of(&self, participant_id: &str) -> Option<String> {
        let conversations = self.lock();
        let mut ids: Vec<&String> = conversations
            .values()
            .filter(|c| c.is_member(participant_id))
            .map(|c| &c.id)
            .collect();
        ids.sort();
        ids.first().map(|id| id.to_string())
    }

    /// Add a member, creating the conversation if needed.
    pub fn add_member(&self, id: &str, participant_id: &str) -> bool {
        let mut conversations = self.lock();
        let conv = conversations
            .entry(id.to_string())
            .or_insert_with(|| self.fresh(id));
        let added = conv.add_member(participant_id);
        if added {
            tracing::debug!("Added {} to conversation {}", participant_id, id);
        }
        added
    }

    /// Remove a member, collapsing the conversation when one or zero remain.
    pub fn remove_member(&self, id: &str, participant_id: &str) -> MemberRemoval {
        let mut conversations = self.lock();

        let conv = match conversations.get_mut(id) {
            Some(c) => c,
            None => return MemberRemoval::NotFound,
        };

        let pos = match conv.members.iter().position(|m| m == participant_id) {
            Some(p) => p,
            None => return MemberRemoval::NotMember,
        };
        conv.members.remove(pos);
        conv.touch();

        match conv.members.len() {
            0 => {
                conversations.remove(id);
                tracing::debug!("Deleted empty conversation {}", id);
                MemberRemoval::Deleted
            }
            1 => {
                let survivor = conv.members[0].clone();
                let history = std::mem::take(&mut conv.history);
                conversations.remove(id);
                tracing::debug!(
                    "Collapsed conversation {} into {} ({} entries)",
                    id,
                    survivor,
                    history.len()
                );
                MemberRemoval::Merged { survivor, history }
            }
            remaining => {
                conv.turn_cursor %= remaining;
                MemberRemoval::Removed { remaining }
            }
        }
    }

    pub fn append_history(&self, id: &str, entry: HistoryEntry) -> bool {
        match self.lock().get_mut(id) {
            Some(conv) => {
                conv.history.push(entry);
                conv.touch();
                true
            }
            None => false,
        }
    }

    /// Copy of the history.
    pub fn history(&self, id: &str) -> Option<Vec<HistoryEntry>> {
        self.lock().get(id).map(|c| c.history.clone())
    }

    pub fn enqueue_pending(&self, id: &str, item: PendingItem) -> bool {
        match self.lock().get_mut(id) {
            Some(conv) => {
                conv.pending.push_back(item);
                conv.touch();
                true
            }
            None => false,
        }
    }

    /// Drain and return the whole pending queue.
    pub fn consume_pending(&self, id: &str) -> Option<Vec<PendingItem>> {
        self.lock()
            .get_mut(id)
            .map(|conv| conv.pending.drain(..).collect())
    }

    pub fn pending(&self, id: &str) -> Option<Vec<PendingItem>> {
        self.lock()
            .get(id)
            .map(|conv| conv.pending.iter().cloned().collect())
    }

    pub fn has_pending(&self, id: &str) -> bool {
        self.lock().get(id).map_or(false, |c| c.has_pending())
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.lock().get(id).map_or(false, |c| c.busy)
    }

    pub fn set_busy(&self, id: &str, busy: bool) -> bool {
        match self.lock().get_mut(id) {
            Some(conv) => {
                conv.busy = busy;
                true
            }
            None => false,
        }
    }

    /// Claim the next round: mark busy, take one marker, advance the cursor and
    /// snapshot the history, all under one lock.
    pub fn begin_round(&self, id: &str) -> RoundStart {
        let mut conversations = self.lock();

        let conv = match conversations.get_mut(id) {
            Some(c) => c,
            None => return RoundStart::NotFound,
        };

        if conv.busy {
            return RoundStart::Busy;
        }
        if conv.members.is_empty() {
            return if conv.has_pending() {
                RoundStart::NoMembers
            } else {
                RoundStart::Idle
            };
        }

        let marker = match conv.pending.pop_front() {
            Some(m) => m,
            None => return RoundStart::Idle,
        };

        conv.busy = true;
        let previous_cursor = conv.turn_cursor;
        conv.turn_cursor = (conv.turn_cursor + 1) % conv.members.len();
        conv.touch();

        RoundStart::Started(Round {
            marker,
            previous_cursor,
            responder: conv.members[conv.turn_cursor].clone(),
            generation: conv.generation,
            history: conv.history.clone(),
        })
    }

    /// Undo a claimed round: the marker goes back to the front of the queue,
    /// the cursor is restored and the conversation is idle again.
    ///
    /// A no-op when the conversation is gone or was re-created since the round
    /// began.
    pub fn abort_round(
        &self,
        id: &str,
        generation: u64,
        marker: PendingItem,
        previous_cursor: usize,
    ) -> bool {
        match self.lock().get_mut(id) {
            Some(conv) if conv.generation == generation => {
                conv.pending.push_front(marker);
                if previous_cursor < conv.members.len() {
                    conv.turn_cursor = previous_cursor;
                }
                conv.busy = false;
                true
            }
            _ => false,
        }
    }

    /// Finish a round. Returns whether pending work remains, or `None` when
    /// the round's conversation no longer exists.
    pub fn end_round(&self, id: &str, generation: u64) -> Option<bool> {
        self.lock()
            .get_mut(id)
            .filter(|conv| conv.generation == generation)
            .map(|conv| {
                conv.busy = false;
                conv.has_pending()
            })
    }

    /// Append a round's reply, provided the round's conversation still exists.
    pub fn append_reply(&self, id: &str, generation: u64, entry: HistoryEntry) -> bool {
        match self.lock().get_mut(id) {
            Some(conv) if conv.generation == generation => {
                conv.history.push(entry);
                conv.touch();
                true
            }
            _ => false,
        }
    }

    /// Drop every marker queued by a participant, across all conversations.
    /// The busy flag is left alone: a round in flight stays in flight.
    pub fn discard_pending_from(&self, participant_id: &str) -> usize {
        let mut removed = 0;

        for conv in self.lock().values_mut() {
            let before = conv.pending.len();
            conv.pending.retain(|p| p.sender_id != participant_id);
            removed += before - conv.pending.len();
        }

        removed
    }

    /// Conversations with queued work and no round in flight.
    pub fn resumable(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|c| c.has_pending() && !c.busy)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> StoreStats {
        let conversations = self.lock();

        StoreStats {
            conversations: conversations.len(),
            members: conversations.values().map(|c| c.members.len()).sum(),
            messages: conversations.values().map(|c| c.history.len()).sum(),
            busy: conversations.values().filter(|c| c.busy).count(),
            with_pending: conversations.values().filter(|c| c.has_pending()).count(),
        }
    }
}

/// Get current timestamp.
pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: &str, members: &[&str]) -> ConversationStore {
        let store = ConversationStore::new();
        store.ensure(id);
        for m in members {
            store.add_member(id, m);
        }
        store
    }

    #[test]
    fn test_ensure_creates_empty_conversation() {
        let store = ConversationStore::new();

        let conv = store.ensure("conv1");
        assert_eq!(conv.id, "conv1");
        assert!(conv.members.is_empty());
        assert!(conv.history.is_empty());
        assert_eq!(conv.turn_cursor, 0);
        assert!(!conv.busy);

        store.append_history("conv1", HistoryEntry::user("hi"));
        let again = store.ensure("conv1");
        assert_eq!(again.history.len(), 1);
    }

    #[test]
    fn test_members_are_unique() {
        let store = store_with("conv1", &["a", "b"]);
        assert!(!store.add_member("conv1", "a"));
        assert_eq!(store.get("conv1").unwrap().members, vec!["a", "b"]);
        assert_eq!(store.conversation_of("b"), Some("conv1".to_string()));
        assert_eq!(store.conversation_of("z"), None);
    }

    #[test]
    fn test_unknown_conversation_is_noop() {
        let store = ConversationStore::new();

        assert!(!store.append_history("nope", HistoryEntry::user("x")));
        assert!(!store.enqueue_pending("nope", PendingItem::new("a", "x")));
        assert!(store.consume_pending("nope").is_none());
        assert!(!store.set_busy("nope", true));
        assert!(store.end_round("nope", 1).is_none());
        assert_eq!(store.remove_member("nope", "a"), MemberRemoval::NotFound);
        assert!(matches!(store.begin_round("nope"), RoundStart::NotFound));
    }

    #[test]
    fn test_remove_member_renormalizes_cursor() {
        let store = store_with("conv1", &["a", "b", "c"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "x"));
        store.enqueue_pending("conv1", PendingItem::new("a", "y"));

        // Advance cursor to 2.
        for _ in 0..2 {
            match store.begin_round("conv1") {
                RoundStart::Started(round) => store.end_round("conv1", round.generation),
                other => panic!("expected a round, got {:?}", other),
            };
        }
        assert_eq!(store.get("conv1").unwrap().turn_cursor, 2);

        assert_eq!(
            store.remove_member("conv1", "a"),
            MemberRemoval::Removed { remaining: 2 }
        );
        assert_eq!(store.get("conv1").unwrap().turn_cursor, 0);
        assert_eq!(store.remove_member("conv1", "a"), MemberRemoval::NotMember);
    }

    #[test]
    fn test_remove_to_one_member_merges_history() {
        let store = store_with("conv1", &["a", "b"]);
        store.append_history("conv1", HistoryEntry::user("first"));
        store.append_history("conv1", HistoryEntry::assistant("second"));

        match store.remove_member("conv1", "a") {
            MemberRemoval::Merged { survivor, history } => {
                assert_eq!(survivor, "b");
                let contents: Vec<&str> = history.iter().map(|e| e.content.as_str()).collect();
                assert_eq!(contents, vec!["first", "second"]);
            }
            other => panic!("unexpected removal outcome: {:?}", other),
        }
        assert!(store.get("conv1").is_none());
    }

    #[test]
    fn test_remove_last_member_deletes() {
        let store = store_with("conv1", &["a"]);
        assert_eq!(store.remove_member("conv1", "a"), MemberRemoval::Deleted);
        assert!(!store.contains("conv1"));
    }

    #[test]
    fn test_consume_pending_drains_in_order() {
        let store = store_with("conv1", &["a", "b"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "one"));
        store.enqueue_pending("conv1", PendingItem::new("b", "two"));

        let drained = store.consume_pending("conv1").unwrap();
        let payloads: Vec<&str> = drained.iter().map(|p| p.payload.as_str()).collect();
        assert_eq!(payloads, vec!["one", "two"]);
        assert!(!store.has_pending("conv1"));
    }

    #[test]
    fn test_begin_round_claims_one_marker() {
        let store = store_with("conv1", &["a", "b", "c"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "one"));
        store.enqueue_pending("conv1", PendingItem::new("a", "two"));

        let round = match store.begin_round("conv1") {
            RoundStart::Started(r) => r,
            other => panic!("expected a round, got {:?}", other),
        };
        assert_eq!(round.marker.payload, "one");
        assert_eq!(round.previous_cursor, 0);
        assert_eq!(round.responder, "b");
        assert!(store.is_busy("conv1"));
        assert!(matches!(store.begin_round("conv1"), RoundStart::Busy));

        assert_eq!(store.end_round("conv1", round.generation), Some(true));
        assert!(!store.is_busy("conv1"));
    }

    #[test]
    fn test_abort_round_restores_queue_and_cursor() {
        let store = store_with("conv1", &["a", "b"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "one"));
        store.enqueue_pending("conv1", PendingItem::new("a", "two"));
        let before = store.pending("conv1").unwrap();

        let round = match store.begin_round("conv1") {
            RoundStart::Started(r) => r,
            other => panic!("expected a round, got {:?}", other),
        };
        assert!(store.abort_round(
            "conv1",
            round.generation,
            round.marker,
            round.previous_cursor
        ));

        let conv = store.get("conv1").unwrap();
        assert!(!conv.busy);
        assert_eq!(conv.turn_cursor, 0);
        assert_eq!(store.pending("conv1").unwrap(), before);
    }

    #[test]
    fn test_round_without_members() {
        let store = store_with("conv1", &[]);
        assert!(matches!(store.begin_round("conv1"), RoundStart::Idle));
        store.enqueue_pending("conv1", PendingItem::new("a", "x"));
        assert!(matches!(store.begin_round("conv1"), RoundStart::NoMembers));
        assert!(store.has_pending("conv1"));
    }

    #[test]
    fn test_discard_pending_from() {
        let store = store_with("conv1", &["a", "b"]);
        store.ensure("conv2");
        store.add_member("conv2", "a");
        store.enqueue_pending("conv1", PendingItem::new("a", "1"));
        store.enqueue_pending("conv1", PendingItem::new("b", "2"));
        store.enqueue_pending("conv2", PendingItem::new("a", "3"));

        assert_eq!(store.discard_pending_from("a"), 2);
        assert_eq!(store.pending("conv1").unwrap().len(), 1);
        assert!(!store.has_pending("conv2"));
        assert_eq!(store.resumable(), vec!["conv1".to_string()]);
    }

    #[test]
    fn test_discard_pending_keeps_round_in_flight() {
        let store = store_with("conv1", &["a", "b", "c"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "1"));
        store.enqueue_pending("conv1", PendingItem::new("c", "2"));
        assert!(matches!(store.begin_round("conv1"), RoundStart::Started(_)));

        assert_eq!(store.discard_pending_from("c"), 1);
        assert!(store.is_busy("conv1"));
        assert!(matches!(store.begin_round("conv1"), RoundStart::Busy));
    }

    #[test]
    fn test_stale_round_leaves_recreated_conversation_alone() {
        let store = store_with("conv1", &["a", "b"]);
        store.enqueue_pending("conv1", PendingItem::new("a", "1"));
        let round = match store.begin_round("conv1") {
            RoundStart::Started(r) => r,
            other => panic!("expected a round, got {:?}", other),
        };

        assert!(matches!(
            store.remove_member("conv1", "a"),
            MemberRemoval::Merged { .. }
        ));
        let recreated = store.ensure("conv1");
        assert_ne!(recreated.generation, round.generation);
        store.set_busy("conv1", true);

        assert!(store.end_round("conv1", round.generation).is_none());
        assert!(!store.append_reply("conv1", round.generation, HistoryEntry::assistant("late")));
        assert!(!store.abort_round(
            "conv1",
            round.generation,
            round.marker.clone(),
            round.previous_cursor
        ));

        let conv = store.get("conv1").unwrap();
        assert!(conv.busy);
        assert!(conv.history.is_empty());
        assert!(conv.pending.is_empty());
    }

    #[test]
    fn test_stats() {
        let store = store_with("conv1", &["a", "b"]);
        store.append_history("conv1", HistoryEntry::user("hi"));
        store.enqueue_pending("conv1", PendingItem::new("a", "hi"));

        let stats = store.stats();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.members, 2);
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.with_pending, 1);
        assert_eq!(stats.busy, 0);
        assert!(stats.to_string().contains("Conversations: 1"));
    }
}
