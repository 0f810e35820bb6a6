//! Test doubles shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::conversation::HistoryEntry;
use crate::participant::{
    Delivery, DeliveryError, Participant, ParticipantKind, PresentationSink, ReplyError,
};

/// Shared record of reply calls across several fakes.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog {
    order: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl CallLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn enter(&self, id: &str) {
        self.order.lock().unwrap().push(id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Scripted participant.
///
/// Replies come from the script when one is queued, otherwise `"<id> reply <n>"`.
/// A hanging fake never answers until its token is cancelled.
pub(crate) struct FakeParticipant {
    id: String,
    kind: ParticipantKind,
    script: Mutex<VecDeque<Result<String, ReplyError>>>,
    calls: Mutex<Vec<Vec<HistoryEntry>>>,
    absorbed: Mutex<Vec<HistoryEntry>>,
    hang: AtomicBool,
    log: Mutex<Option<CallLog>>,
}

impl FakeParticipant {
    fn new(id: &str, kind: ParticipantKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            absorbed: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
            log: Mutex::new(None),
        })
    }

    pub(crate) fn agent(id: &str) -> Arc<Self> {
        Self::new(id, ParticipantKind::Agent)
    }

    pub(crate) fn operator(id: &str) -> Arc<Self> {
        Self::new(id, ParticipantKind::Operator)
    }

    pub(crate) fn push_reply(&self, reply: Result<String, ReplyError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_log(&self, log: &CallLog) {
        *self.log.lock().unwrap() = Some(log.clone());
    }

    pub(crate) fn calls(&self) -> Vec<Vec<HistoryEntry>> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn absorbed(&self) -> Vec<HistoryEntry> {
        self.absorbed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Participant for FakeParticipant {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ParticipantKind {
        self.kind
    }

    async fn generate_reply(
        &self,
        history: &[HistoryEntry],
        cancel: CancellationToken,
    ) -> Result<String, ReplyError> {
        self.calls.lock().unwrap().push(history.to_vec());
        let n = self.call_count();
        let log = self.log.lock().unwrap().clone();
        if let Some(log) = &log {
            log.enter(&self.id);
        }

        let result = if self.hang.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            Err(ReplyError::Cancelled)
        } else {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(format!("{} reply {}", self.id, n)))
        };

        if let Some(log) = &log {
            log.exit();
        }
        result
    }

    fn absorb_history(&self, entries: &[HistoryEntry]) {
        self.absorbed.lock().unwrap().extend_from_slice(entries);
    }
}

/// Sink that records every delivery and can refuse chosen targets.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reject(&self, target_id: &str) {
        self.rejected.lock().unwrap().insert(target_id.to_string());
    }

    pub(crate) fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub(crate) fn targets(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .map(|d| d.target_id)
            .collect()
    }

    pub(crate) fn for_target(&self, target_id: &str) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.target_id == target_id)
            .collect()
    }
}

impl PresentationSink for RecordingSink {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        if self.rejected.lock().unwrap().contains(&delivery.target_id) {
            return Err(DeliveryError::Rejected("view closed".to_string()));
        }
        self.deliveries.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}

/// Yield to the runtime until `condition` holds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
