//! Route traffic controller.
//!
//! Paces agent-to-agent exchanges. Each ordered (from, to) pair gets a route
//! with its own outbound batch queue, round counter and policy. Oversized text
//! is split into line batches and released one batch per round, each round
//! waiting for the target's reply before the next batch goes out.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TrafficConfig;
use crate::participant::{Delivery, ParticipantDirectory, PresentationSink, ReplyError};

use super::chunking::{make_batches, BatchMode};
use super::conversation::{HistoryEntry, Role};
use super::events::{EventBus, HubEvent};

/// Ordered (from, to) pair identifying a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub from: String,
    pub to: String,
}

impl RouteKey {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    pub fn touches(&self, participant_id: &str) -> bool {
        self.from == participant_id || self.to == participant_id
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Custom stop condition, checked before every round.
pub type StopPredicate = Arc<dyn Fn(&RouteSnapshot) -> bool + Send + Sync>;

/// Tie-break between routes resumed together. `Less` goes first.
pub type PriorityFn = Arc<dyn Fn(&RouteSnapshot, &RouteSnapshot) -> Ordering + Send + Sync>;

/// Pacing policy of a route.
#[derive(Clone)]
pub struct RoutePolicy {
    /// 0 disables the limit
    pub max_rounds: u32,
    pub line_batch_size: usize,
    pub backpressure: bool,
    pub strict_alternation: bool,
    pub batch_mode: BatchMode,
    pub stop_when: StopPredicate,
    pub priority: PriorityFn,
}

impl RoutePolicy {
    /// Shallow-merge a patch into this policy.
    pub fn apply(&mut self, patch: &PolicyPatch) {
        if let Some(max_rounds) = patch.max_rounds {
            self.max_rounds = max_rounds;
        }
        if let Some(size) = patch.line_batch_size {
            self.line_batch_size = size;
        }
        if let Some(backpressure) = patch.backpressure {
            self.backpressure = backpressure;
        }
        if let Some(strict) = patch.strict_alternation {
            self.strict_alternation = strict;
        }
        if let Some(mode) = patch.batch_mode {
            self.batch_mode = mode;
        }
        if let Some(stop_when) = &patch.stop_when {
            self.stop_when = stop_when.clone();
        }
        if let Some(priority) = &patch.priority {
            self.priority = priority.clone();
        }
    }

    fn batch_size(&self) -> usize {
        self.line_batch_size.max(1)
    }
}

impl From<&TrafficConfig> for RoutePolicy {
    fn from(config: &TrafficConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            line_batch_size: config.line_batch_size,
            backpressure: config.backpressure,
            strict_alternation: config.strict_alternation,
            batch_mode: config.batch_mode,
            stop_when: Arc::new(|_| false),
            priority: Arc::new(|_, _| Ordering::Equal),
        }
    }
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self::from(&TrafficConfig::default())
    }
}

impl fmt::Debug for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePolicy")
            .field("max_rounds", &self.max_rounds)
            .field("line_batch_size", &self.line_batch_size)
            .field("backpressure", &self.backpressure)
            .field("strict_alternation", &self.strict_alternation)
            .field("batch_mode", &self.batch_mode)
            .finish_non_exhaustive()
    }
}

/// Partial policy. Unset fields keep their current value.
#[derive(Clone, Default)]
pub struct PolicyPatch {
    pub max_rounds: Option<u32>,
    pub line_batch_size: Option<usize>,
    pub backpressure: Option<bool>,
    pub strict_alternation: Option<bool>,
    pub batch_mode: Option<BatchMode>,
    pub stop_when: Option<StopPredicate>,
    pub priority: Option<PriorityFn>,
}

impl PolicyPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn line_batch_size(mut self, size: usize) -> Self {
        self.line_batch_size = Some(size);
        self
    }

    pub fn backpressure(mut self, enabled: bool) -> Self {
        self.backpressure = Some(enabled);
        self
    }

    pub fn strict_alternation(mut self, enabled: bool) -> Self {
        self.strict_alternation = Some(enabled);
        self
    }

    pub fn batch_mode(mut self, mode: BatchMode) -> Self {
        self.batch_mode = Some(mode);
        self
    }

    pub fn stop_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&RouteSnapshot) -> bool + Send + Sync + 'static,
    {
        self.stop_when = Some(Arc::new(f));
        self
    }

    pub fn priority<F>(mut self, f: F) -> Self
    where
        F: Fn(&RouteSnapshot, &RouteSnapshot) -> Ordering + Send + Sync + 'static,
    {
        self.priority = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PolicyPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyPatch")
            .field("max_rounds", &self.max_rounds)
            .field("line_batch_size", &self.line_batch_size)
            .field("backpressure", &self.backpressure)
            .field("strict_alternation", &self.strict_alternation)
            .field("batch_mode", &self.batch_mode)
            .field("stop_when", &self.stop_when.is_some())
            .field("priority", &self.priority.is_some())
            .finish()
    }
}

/// Options for [`TrafficController::orchestrate`].
#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// Applied only when the route is created by this call
    pub policy: Option<PolicyPatch>,
}

impl OrchestrateOptions {
    pub fn with_policy(policy: PolicyPatch) -> Self {
        Self {
            policy: Some(policy),
        }
    }
}

/// Read-only view of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub key: RouteKey,
    pub rounds: u32,
    pub queued: Vec<String>,
    pub draining: bool,
    pub locked: bool,
    pub last_speaker: Option<String>,
}

struct RouteState {
    /// Distinguishes a route from one recreated after a reset
    epoch: u64,
    rounds: u32,
    queue: VecDeque<String>,
    draining: bool,
    locked: bool,
    last_speaker: Option<String>,
    policy: RoutePolicy,
    token: Option<CancellationToken>,
}

impl RouteState {
    fn snapshot(&self, key: &RouteKey) -> RouteSnapshot {
        RouteSnapshot {
            key: key.clone(),
            rounds: self.rounds,
            queued: self.queue.iter().cloned().collect(),
            draining: self.draining,
            locked: self.locked,
            last_speaker: self.last_speaker.clone(),
        }
    }
}

/// Why a route's drain loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStop {
    QueueEmpty,
    MaxRounds,
    StopPredicate,
    Cancelled,
    /// The route was reset while draining.
    RouteReset,
}

impl fmt::Display for RouteStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteStop::QueueEmpty => "queue_empty",
            RouteStop::MaxRounds => "max_rounds",
            RouteStop::StopPredicate => "stop_predicate",
            RouteStop::Cancelled => "cancelled",
            RouteStop::RouteReset => "route_reset",
        };
        write!(f, "{}", s)
    }
}

/// What one drain loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub key: RouteKey,
    /// Batches released to the target
    pub delivered: usize,
    /// Rounds whose reply failed and got the fallback
    pub failed: usize,
    pub stop: RouteStop,
    /// Batches still queued when the loop ended
    pub remaining: usize,
}

/// Result of [`TrafficController::orchestrate`] and [`TrafficController::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrateOutcome {
    Drained(RouteReport),
    /// A loop is already draining this route; the batches were appended to it.
    Queued { pending: usize },
    /// The reverse route holds the alternation lock; the batches wait for the hand-off.
    Deferred { pending: usize },
    UnknownParticipant(String),
}

struct TrafficInner {
    routes: Mutex<HashMap<RouteKey, RouteState>>,
    directory: Arc<dyn ParticipantDirectory>,
    sink: Arc<dyn PresentationSink>,
    events: EventBus,
    defaults: TrafficConfig,
    fallback_message: String,
    next_epoch: AtomicU64,
}

impl TrafficInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<RouteKey, RouteState>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_state(&self, patch: Option<&PolicyPatch>) -> RouteState {
        let mut policy = RoutePolicy::from(&self.defaults);
        if let Some(patch) = patch {
            policy.apply(patch);
        }
        RouteState {
            epoch: self.next_epoch.fetch_add(1, AtomicOrdering::Relaxed),
            rounds: 0,
            queue: VecDeque::new(),
            draining: false,
            locked: false,
            last_speaker: None,
            policy,
            token: None,
        }
    }

    fn deliver(&self, target_id: &str, message: &str, role: Role, author: &str, key: &RouteKey) {
        let delivery = Delivery {
            target_id: target_id.to_string(),
            message: message.to_string(),
            role,
            author: Some(author.to_string()),
            via: Some(key.to_string()),
        };
        if let Err(e) = self.sink.deliver(&delivery) {
            tracing::warn!("Route {} could not deliver to {}: {}", key, target_id, e);
        }
    }

    fn display_name(&self, participant_id: &str) -> String {
        self.directory
            .lookup(participant_id)
            .map(|p| p.display_name().to_string())
            .unwrap_or_else(|| participant_id.to_string())
    }
}

/// Clears a route's draining and lock flags when its loop ends, however it ends.
struct DrainGuard<'a> {
    inner: &'a TrafficInner,
    key: &'a RouteKey,
    epoch: u64,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.inner.lock().get_mut(self.key) {
            if state.epoch == self.epoch {
                state.draining = false;
                state.locked = false;
                state.token = None;
            }
        }
    }
}

/// A drain loop that was allowed to start.
struct Claim {
    epoch: u64,
    token: CancellationToken,
}

enum Start {
    Claimed(Claim),
    Outcome(OrchestrateOutcome),
}

/// Paces paired agent-to-agent exchanges. Cheap to clone.
#[derive(Clone)]
pub struct TrafficController {
    inner: Arc<TrafficInner>,
}

impl TrafficController {
    pub fn new(
        directory: Arc<dyn ParticipantDirectory>,
        sink: Arc<dyn PresentationSink>,
        events: EventBus,
        defaults: TrafficConfig,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(TrafficInner {
                routes: Mutex::new(HashMap::new()),
                directory,
                sink,
                events,
                defaults,
                fallback_message: fallback_message.into(),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Queue `text` on the route from `from_id` to `to_id` and drain it, unless
    /// a loop is already draining that route.
    pub async fn orchestrate(
        &self,
        from_id: &str,
        to_id: &str,
        text: &str,
        options: &OrchestrateOptions,
    ) -> OrchestrateOutcome {
        let inner = &*self.inner;

        for id in [from_id, to_id] {
            if inner.directory.lookup(id).is_none() {
                tracing::warn!("Cannot orchestrate {}->{}: unknown participant {}", from_id, to_id, id);
                return OrchestrateOutcome::UnknownParticipant(id.to_string());
            }
        }
        let both_agents = inner.directory.is_agent(from_id) && inner.directory.is_agent(to_id);

        let key = RouteKey::new(from_id, to_id);
        let start = {
            let mut routes = inner.lock();
            if !routes.contains_key(&key) {
                tracing::debug!("Created route {}", key);
                let state = inner.new_state(options.policy.as_ref());
                routes.insert(key.clone(), state);
            }

            if let Some(state) = routes.get_mut(&key) {
                let batches = if state.policy.backpressure && both_agents {
                    make_batches(text, state.policy.batch_size(), state.policy.batch_mode)
                } else if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![text.to_string()]
                };
                tracing::debug!("Route {} queued {} batch(es)", key, batches.len());
                state.queue.extend(batches);
            }

            Self::try_start(&mut routes, &key)
        };

        match start {
            Start::Claimed(claim) => {
                OrchestrateOutcome::Drained(self.run_claimed(&key, claim).await)
            }
            Start::Outcome(outcome) => outcome,
        }
    }

    /// Drain whatever is already queued on a route. `None` if there is no such route.
    pub async fn resume(&self, from_id: &str, to_id: &str) -> Option<OrchestrateOutcome> {
        let key = RouteKey::new(from_id, to_id);
        let start = {
            let mut routes = self.inner.lock();
            if !routes.contains_key(&key) {
                return None;
            }
            Self::try_start(&mut routes, &key)
        };

        Some(match start {
            Start::Claimed(claim) => {
                OrchestrateOutcome::Drained(self.run_claimed(&key, claim).await)
            }
            Start::Outcome(outcome) => outcome,
        })
    }

    /// Resume every idle route with queued batches, started in priority order.
    pub async fn resume_all(&self) -> Vec<(RouteKey, OrchestrateOutcome)> {
        let mut candidates: Vec<(RouteSnapshot, PriorityFn)> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, state)| !state.draining && !state.queue.is_empty())
            .map(|(key, state)| (state.snapshot(key), state.policy.priority.clone()))
            .collect();

        candidates.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        candidates.sort_by(|a, b| (a.1)(&a.0, &b.0));

        tracing::info!("Resuming {} route(s)", candidates.len());

        let mut tasks = JoinSet::new();
        for (index, (snapshot, _)) in candidates.into_iter().enumerate() {
            let controller = self.clone();
            let key = snapshot.key;
            tasks.spawn(async move {
                let outcome = controller.resume(&key.from, &key.to).await;
                (index, key, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, key, Some(outcome))) => results.push((index, key, outcome)),
                Ok((_, key, None)) => tracing::debug!("Route {} vanished before resuming", key),
                Err(e) => tracing::error!("Route task failed: {}", e),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, key, outcome)| (key, outcome))
            .collect()
    }

    /// Decide whether a drain loop may start on `key`, claiming it if so.
    ///
    /// A route waits while its reverse holds the alternation lock. A strict
    /// route also waits while its reverse is draining at all.
    fn try_start(routes: &mut HashMap<RouteKey, RouteState>, key: &RouteKey) -> Start {
        let (reverse_locked, reverse_draining) = routes
            .get(&key.reversed())
            .map_or((false, false), |reverse| (reverse.locked, reverse.draining));

        let state = match routes.get_mut(key) {
            Some(s) => s,
            None => {
                return Start::Outcome(OrchestrateOutcome::Drained(RouteReport {
                    key: key.clone(),
                    delivered: 0,
                    failed: 0,
                    stop: RouteStop::RouteReset,
                    remaining: 0,
                }))
            }
        };

        if state.draining {
            return Start::Outcome(OrchestrateOutcome::Queued {
                pending: state.queue.len(),
            });
        }
        if reverse_locked || (state.policy.strict_alternation && reverse_draining) {
            tracing::debug!("Route {} deferred until {} hands off", key, key.reversed());
            return Start::Outcome(OrchestrateOutcome::Deferred {
                pending: state.queue.len(),
            });
        }

        let token = CancellationToken::new();
        state.draining = true;
        state.locked = state.policy.strict_alternation;
        state.token = Some(token.clone());

        Start::Claimed(Claim {
            epoch: state.epoch,
            token,
        })
    }

    async fn run_claimed(&self, key: &RouteKey, claim: Claim) -> RouteReport {
        let report = {
            let _guard = DrainGuard {
                inner: &*self.inner,
                key,
                epoch: claim.epoch,
            };
            self.drain_loop(key, claim.epoch, &claim.token).await
        };

        tracing::debug!(
            "Route {} stopped ({}) after {} batch(es), {} left",
            key,
            report.stop,
            report.delivered,
            report.remaining
        );
        self.inner.events.emit(HubEvent::RouteStopped {
            route: key.to_string(),
            reason: report.stop.to_string(),
        });

        self.hand_off(key);
        report
    }

    /// When either side alternates strictly, let the reverse route drain what
    /// it deferred.
    fn hand_off(&self, key: &RouteKey) {
        let reverse = key.reversed();
        let should_resume = {
            let routes = self.inner.lock();
            let strict_here = routes
                .get(key)
                .map_or(false, |state| state.policy.strict_alternation);
            routes.get(&reverse).map_or(false, |r| {
                (strict_here || r.policy.strict_alternation) && !r.draining && !r.queue.is_empty()
            })
        };

        if should_resume {
            tracing::debug!("Route {} hands off to {}", key, reverse);
            let controller = self.clone();
            tokio::spawn(async move {
                controller.resume(&reverse.from, &reverse.to).await;
            });
        }
    }

    async fn drain_loop(&self, key: &RouteKey, epoch: u64, token: &CancellationToken) -> RouteReport {
        let inner = &*self.inner;
        let mut delivered = 0;
        let mut failed = 0;

        let stop = loop {
            // Count the round and check the limit.
            let (round, max_rounds, snapshot, stop_when) = {
                let mut routes = inner.lock();
                let state = match routes.get_mut(key) {
                    Some(s) if s.epoch == epoch => s,
                    _ => break RouteStop::RouteReset,
                };
                if state.queue.is_empty() {
                    break RouteStop::QueueEmpty;
                }
                state.rounds += 1;
                (
                    state.rounds,
                    state.policy.max_rounds,
                    state.snapshot(key),
                    state.policy.stop_when.clone(),
                )
            };

            if max_rounds > 0 && round > max_rounds {
                break RouteStop::MaxRounds;
            }
            if stop_when(&snapshot) {
                break RouteStop::StopPredicate;
            }
            if token.is_cancelled() {
                break RouteStop::Cancelled;
            }

            let (batch, remaining) = {
                let mut routes = inner.lock();
                let state = match routes.get_mut(key) {
                    Some(s) if s.epoch == epoch => s,
                    _ => break RouteStop::RouteReset,
                };
                match state.queue.pop_front() {
                    Some(batch) => (batch, state.queue.len()),
                    None => break RouteStop::QueueEmpty,
                }
            };

            let from_name = inner.display_name(&key.from);
            inner.deliver(&key.to, &batch, Role::User, &from_name, key);
            delivered += 1;
            inner.events.emit(HubEvent::RouteBatchDelivered {
                route: key.to_string(),
                round,
                remaining,
            });

            let input = [HistoryEntry::user(batch.as_str()).with_sender(&key.from)];
            let reply = match inner.directory.lookup(&key.to) {
                Some(participant) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(ReplyError::Cancelled),
                        reply = participant.generate_reply(&input, token.child_token()) => reply,
                    }
                }
                None => Err(ReplyError::Unsupported(format!("participant {} not found", key.to))),
            };

            let to_name = inner.display_name(&key.to);
            match reply {
                Err(ReplyError::Cancelled) => {
                    tracing::info!("Route {} cancelled in round {}", key, round);
                    break RouteStop::Cancelled;
                }
                Ok(text) => {
                    inner.deliver(&key.to, &text, Role::Assistant, &to_name, key);
                }
                Err(e) => {
                    tracing::warn!("Reply on route {} failed: {}", key, e);
                    failed += 1;
                    inner.deliver(&key.to, &inner.fallback_message, Role::Assistant, &to_name, key);
                }
            }

            if let Some(state) = inner.lock().get_mut(key) {
                if state.epoch == epoch {
                    state.last_speaker = Some(key.to.clone());
                }
            }

            tokio::task::yield_now().await;
        };

        let remaining = inner
            .lock()
            .get(key)
            .filter(|s| s.epoch == epoch)
            .map_or(0, |s| s.queue.len());

        RouteReport {
            key: key.clone(),
            delivered,
            failed,
            stop,
            remaining,
        }
    }

    /// Discard a route entirely. A loop draining it stops after its current round.
    pub fn reset(&self, from_id: &str, to_id: &str) -> bool {
        let removed = self.inner.lock().remove(&RouteKey::new(from_id, to_id));
        match removed {
            Some(_) => {
                tracing::debug!("Reset route {}->{}", from_id, to_id);
                true
            }
            None => false,
        }
    }

    /// Merge a patch into the route's policy, creating the route if needed.
    /// Counters and queued batches are untouched.
    pub fn set_policy(&self, from_id: &str, to_id: &str, patch: &PolicyPatch) -> RoutePolicy {
        let key = RouteKey::new(from_id, to_id);
        let mut routes = self.inner.lock();
        let state = routes
            .entry(key)
            .or_insert_with(|| self.inner.new_state(None));
        state.policy.apply(patch);
        state.policy.clone()
    }

    /// Cancel the in-flight round of a route. Returns false if it is not draining.
    pub fn cancel(&self, from_id: &str, to_id: &str) -> bool {
        let routes = self.inner.lock();
        match routes
            .get(&RouteKey::new(from_id, to_id))
            .and_then(|s| s.token.as_ref())
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, from_id: &str, to_id: &str) -> Option<RouteSnapshot> {
        let key = RouteKey::new(from_id, to_id);
        self.inner.lock().get(&key).map(|s| s.snapshot(&key))
    }

    /// Snapshots of every route, ordered by key.
    pub fn routes(&self) -> Vec<RouteSnapshot> {
        let mut snapshots: Vec<RouteSnapshot> = self
            .inner
            .lock()
            .iter()
            .map(|(key, state)| state.snapshot(key))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Drop every route that starts or ends at a participant, cancelling any
    /// that are draining. Returns how many were dropped.
    pub fn reset_participant(&self, participant_id: &str) -> usize {
        let mut routes = self.inner.lock();
        let before = routes.len();
        routes.retain(|key, state| {
            if !key.touches(participant_id) {
                return true;
            }
            if let Some(token) = &state.token {
                token.cancel();
            }
            false
        });
        before - routes.len()
    }
}
