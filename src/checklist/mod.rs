#[cfg(test)]
mod checklist_test;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use util::sync::Mutex as SyncMutex;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidatePairState, CandidateType};
use crate::events::{EventBus, StreamEvent};
use crate::state::CheckListState;

/// Default bound on the number of pairs a single stream may carry.
pub const DEFAULT_MAX_CHECK_LIST_SIZE: usize = 100;

/// Per-stream ordered sequence of candidate pairs subject to connectivity
/// checks, together with the FIFO of triggered checks.
pub struct CheckList {
    stream_name: String,
    state: AtomicU8, // CheckListState
    pairs: SyncMutex<Vec<Arc<CandidatePair>>>,
    triggered: SyncMutex<VecDeque<Arc<CandidatePair>>>,
    max_size: AtomicUsize,
    events: EventBus,

    // Cancel handle of the running grace timer, if armed.
    grace_timer_tx: SyncMutex<Option<mpsc::Sender<()>>>,
}

impl CheckList {
    #[must_use]
    pub fn new(stream_name: &str, max_size: usize, events: EventBus) -> Self {
        Self {
            stream_name: stream_name.to_owned(),
            state: AtomicU8::new(CheckListState::Running as u8),
            pairs: SyncMutex::new(vec![]),
            triggered: SyncMutex::new(VecDeque::new()),
            max_size: AtomicUsize::new(max_size),
            events,
            grace_timer_tx: SyncMutex::new(None),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn max_size(&self) -> usize {
        std::cmp::max(1, self.max_size.load(Ordering::SeqCst))
    }

    /// Lowers or raises the cap; the agent splits its global cap across
    /// streams as they are created. Already-admitted pairs are kept.
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::SeqCst);
    }

    pub fn state(&self) -> CheckListState {
        CheckListState::from(self.state.load(Ordering::SeqCst))
    }

    /// Moves the list to `new_state`. Completed and Failed are terminal.
    pub fn set_state(&self, new_state: CheckListState) -> bool {
        let current = self.state();
        if current == new_state || current != CheckListState::Running {
            return false;
        }

        log::info!(
            "check list of stream {} is now {}",
            self.stream_name,
            new_state
        );
        self.state.store(new_state as u8, Ordering::SeqCst);
        self.events.publish(StreamEvent::CheckListStateChanged {
            stream: self.stream_name.clone(),
            state: new_state,
        });
        true
    }

    /// Applies a pair state transition and publishes it when it took effect.
    pub fn set_pair_state(&self, pair: &Arc<CandidatePair>, state: CandidatePairState) -> bool {
        if !pair.set_state(state) {
            return false;
        }

        self.events.publish(StreamEvent::PairStateChanged {
            stream: self.stream_name.clone(),
            local: pair.local.addr(),
            remote: pair.remote.addr(),
            state,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }

    /// Snapshot of the ordered pairs.
    pub fn pairs(&self) -> Vec<Arc<CandidatePair>> {
        self.pairs.lock().clone()
    }

    /// Inserts a pair at its priority-sorted position. Refuses duplicates and
    /// silently drops the pair when the list is at capacity.
    pub fn add_pair(&self, pair: Arc<CandidatePair>) -> bool {
        let mut pairs = self.pairs.lock();
        if pairs.iter().any(|p| **p == *pair) {
            return false;
        }
        if pairs.len() >= self.max_size() {
            log::debug!(
                "check list of stream {} is full ({}), dropping pair {}",
                self.stream_name,
                self.max_size(),
                pair
            );
            return false;
        }

        let priority = pair.priority();
        let pos = pairs
            .iter()
            .position(|p| p.priority() < priority)
            .unwrap_or(pairs.len());
        pairs.insert(pos, pair);
        true
    }

    /// Re-sorts the list; pair priorities flip when the agent changes role.
    pub fn resort(&self) {
        let mut pairs = self.pairs.lock();
        pairs.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn find_pair(&self, pair: &CandidatePair) -> Option<Arc<CandidatePair>> {
        let pairs = self.pairs.lock();
        pairs.iter().find(|p| ***p == *pair).cloned()
    }

    pub fn find_pair_by_addrs(
        &self,
        local: std::net::SocketAddr,
        remote: std::net::SocketAddr,
    ) -> Option<Arc<CandidatePair>> {
        let pairs = self.pairs.lock();
        pairs
            .iter()
            .find(|p| p.local.addr() == local && p.remote.addr() == remote)
            .cloned()
    }

    /// Seeds the list from the full local x remote cross product:
    /// server-reflexive locals are replaced by their base, duplicates are
    /// dropped in favor of the higher-priority pair, the result is sorted by
    /// descending pair priority and capped.
    pub fn form_pairs(
        &self,
        locals: &[Arc<dyn Candidate + Send + Sync>],
        remotes: &[Arc<dyn Candidate + Send + Sync>],
        controlling: bool,
    ) {
        let mut formed: Vec<Arc<CandidatePair>> = vec![];

        for local in locals {
            for remote in remotes {
                if !can_pair(&**local, &**remote) {
                    continue;
                }

                // Checks originate from the base socket and the mapped
                // address reappears in the response, so a reflexive local is
                // paired through its base.
                let effective_local = if local.candidate_type() == CandidateType::ServerReflexive {
                    match locals
                        .iter()
                        .find(|c| c.addr() == local.base_addr() && c.owns_conn())
                    {
                        Some(base) => base.clone(),
                        None => continue,
                    }
                } else {
                    local.clone()
                };

                let pair = Arc::new(CandidatePair::new(
                    effective_local,
                    remote.clone(),
                    controlling,
                ));
                if !formed.iter().any(|p| **p == *pair) {
                    formed.push(pair);
                }
            }
        }

        formed.sort_by(|a, b| b.priority().cmp(&a.priority()));
        formed.dedup_by(|a, b| a == b);
        formed.truncate(self.max_size());

        let mut pairs = self.pairs.lock();
        for pair in formed {
            if !pairs.iter().any(|p| **p == *pair) {
                let priority = pair.priority();
                let pos = pairs
                    .iter()
                    .position(|p| p.priority() < priority)
                    .unwrap_or(pairs.len());
                pairs.insert(pos, pair);
            }
        }
        pairs.truncate(self.max_size());
    }

    /// Computes the initial pair states: per foundation group, the pair with
    /// the lowest component id (ties broken by highest priority) becomes
    /// Waiting, the rest stay Frozen.
    pub fn compute_initial_states(&self) {
        let pairs = self.pairs.lock().clone();

        let mut groups: HashMap<String, Vec<Arc<CandidatePair>>> = HashMap::new();
        for pair in pairs {
            groups.entry(pair.foundation()).or_default().push(pair);
        }

        for (_, group) in groups {
            let mut best: Option<&Arc<CandidatePair>> = None;
            for pair in &group {
                match best {
                    None => best = Some(pair),
                    Some(b) => {
                        let better = pair.local.component_id() < b.local.component_id()
                            || (pair.local.component_id() == b.local.component_id()
                                && pair.priority() > b.priority());
                        if better {
                            best = Some(pair);
                        }
                    }
                }
            }

            if let Some(pair) = best {
                self.set_pair_state(pair, CandidatePairState::Waiting);
            }
        }
    }

    /// Unfreezes every Frozen pair sharing `foundation`.
    pub fn unfreeze_foundation(&self, foundation: &str) {
        let pairs = self.pairs.lock().clone();
        for pair in pairs {
            if pair.state() == CandidatePairState::Frozen && pair.foundation() == foundation {
                self.set_pair_state(&pair, CandidatePairState::Waiting);
            }
        }
    }

    /// Unfreezes every Frozen pair whose foundation appears in `foundations`.
    /// Returns the number of pairs unfrozen.
    pub fn unfreeze_foundations(&self, foundations: &HashSet<String>) -> usize {
        let pairs = self.pairs.lock().clone();
        let mut unfrozen = 0;
        for pair in pairs {
            if pair.state() == CandidatePairState::Frozen
                && foundations.contains(&pair.foundation())
            {
                if self.set_pair_state(&pair, CandidatePairState::Waiting) {
                    unfrozen += 1;
                }
            }
        }
        unfrozen
    }

    pub fn is_fully_frozen(&self) -> bool {
        let pairs = self.pairs.lock();
        !pairs.is_empty() && pairs.iter().all(|p| p.state() == CandidatePairState::Frozen)
    }

    /// True once every pair reached Succeeded or Failed.
    pub fn all_terminated(&self) -> bool {
        let pairs = self.pairs.lock();
        !pairs.is_empty() && pairs.iter().all(|p| p.state().is_terminated())
    }

    /// Appends a pair to the triggered-check FIFO unless it is already queued.
    pub fn schedule_triggered(&self, pair: Arc<CandidatePair>) {
        let mut triggered = self.triggered.lock();
        if !triggered.iter().any(|p| **p == *pair) {
            triggered.push_back(pair);
        }
    }

    pub fn triggered_len(&self) -> usize {
        self.triggered.lock().len()
    }

    /// Picks the pair the next paced check should exercise: the head of the
    /// triggered FIFO, else the highest-priority Waiting pair, else the
    /// highest-priority Frozen pair whose foundation has no Waiting or
    /// InProgress sibling.
    pub fn next_pair(&self) -> Option<Arc<CandidatePair>> {
        {
            let mut triggered = self.triggered.lock();
            if let Some(pair) = triggered.pop_front() {
                return Some(pair);
            }
        }

        let pairs = self.pairs.lock();

        if let Some(pair) = pairs
            .iter()
            .find(|p| p.state() == CandidatePairState::Waiting)
        {
            return Some(pair.clone());
        }

        let busy_foundations: HashSet<String> = pairs
            .iter()
            .filter(|p| {
                matches!(
                    p.state(),
                    CandidatePairState::Waiting | CandidatePairState::InProgress
                )
            })
            .map(|p| p.foundation())
            .collect();

        pairs
            .iter()
            .find(|p| {
                p.state() == CandidatePairState::Frozen
                    && !busy_foundations.contains(&p.foundation())
            })
            .cloned()
    }

    /// Stores the cancel handle of a freshly armed grace timer. Returns false
    /// when a timer is already pending, making arming idempotent.
    pub(crate) fn arm_grace_timer(&self, cancel_tx: mpsc::Sender<()>) -> bool {
        let mut grace = self.grace_timer_tx.lock();
        if grace.is_some() {
            return false;
        }
        *grace = Some(cancel_tx);
        true
    }

    pub(crate) fn disarm_grace_timer(&self) {
        self.grace_timer_tx.lock().take();
    }
}

/// Two candidates can form a pair when they agree on transport and address
/// family.
fn can_pair(local: &dyn Candidate, remote: &dyn Candidate) -> bool {
    local.network_type() == remote.network_type()
}
