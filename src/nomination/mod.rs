#[cfg(test)]
mod nomination_test;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Duration;
use util::sync::Mutex as SyncMutex;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::CandidateType;

/// How long a validated relayed pair waits for a better, non-relayed pair
/// before being nominated anyway.
pub const DEFAULT_RELAYED_NOMINATION_DEBOUNCE: Duration = Duration::from_millis(800);

/// Decides which validated pair the controlling agent nominates. The
/// controlled side never initiates nominations, it only confirms them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominationStrategy {
    /// The application nominates through the agent API.
    None,

    /// The first pair to validate is nominated immediately.
    NominateFirstValid,

    /// Wait until the whole list terminated, then take the highest-priority
    /// validated pair per component.
    NominateHighestPriority,

    /// Nominate the first validated host or server-reflexive pair
    /// immediately; a validated relayed pair only after a debounce window in
    /// which something better may still validate.
    NominateFirstHostOrReflexiveValid,

    /// Wait until the whole list terminated, then take the validated pair
    /// with the smallest measured round-trip per component.
    NominateBestRtt,
}

impl Default for NominationStrategy {
    fn default() -> Self {
        Self::NominateFirstValid
    }
}

impl fmt::Display for NominationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::None => "None",
            Self::NominateFirstValid => "NominateFirstValid",
            Self::NominateHighestPriority => "NominateHighestPriority",
            Self::NominateFirstHostOrReflexiveValid => "NominateFirstHostOrReflexiveValid",
            Self::NominateBestRtt => "NominateBestRtt",
        };
        write!(f, "{}", s)
    }
}

/// What the check client should do for a pair that just validated.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NominationDecision {
    Nominate,
    ArmRelayedTimer,
    Ignore,
}

pub(crate) fn pair_is_relayed(pair: &CandidatePair) -> bool {
    pair.local.candidate_type() == CandidateType::Relay
        || pair.remote.candidate_type() == CandidateType::Relay
}

/// Policy reaction to a freshly validated pair.
pub(crate) fn on_pair_validated(
    strategy: NominationStrategy,
    pair: &CandidatePair,
    component_already_nominated: bool,
) -> NominationDecision {
    if component_already_nominated {
        return NominationDecision::Ignore;
    }

    match strategy {
        NominationStrategy::None
        | NominationStrategy::NominateHighestPriority
        | NominationStrategy::NominateBestRtt => NominationDecision::Ignore,

        NominationStrategy::NominateFirstValid => NominationDecision::Nominate,

        NominationStrategy::NominateFirstHostOrReflexiveValid => {
            if pair_is_relayed(pair) {
                NominationDecision::ArmRelayedTimer
            } else {
                NominationDecision::Nominate
            }
        }
    }
}

/// Policy reaction to a fully terminated check list: the pair to nominate for
/// one component, given that component's validated pairs.
pub(crate) fn on_list_exhausted(
    strategy: NominationStrategy,
    validated: &[Arc<CandidatePair>],
    component_already_nominated: bool,
) -> Option<Arc<CandidatePair>> {
    if component_already_nominated || validated.is_empty() {
        return None;
    }

    match strategy {
        NominationStrategy::None | NominationStrategy::NominateFirstValid => None,

        NominationStrategy::NominateHighestPriority => validated
            .iter()
            .max_by_key(|p| p.priority())
            .cloned(),

        NominationStrategy::NominateBestRtt => validated
            .iter()
            .filter(|p| p.round_trip_time().is_some())
            .min_by_key(|p| p.round_trip_time())
            .cloned()
            .or_else(|| validated.iter().max_by_key(|p| p.priority()).cloned()),

        // Everything non-relayed failed, so the relayed pair goes out
        // immediately instead of waiting for the debounce window.
        NominationStrategy::NominateFirstHostOrReflexiveValid => validated
            .iter()
            .filter(|p| pair_is_relayed(p))
            .max_by_key(|p| p.priority())
            .cloned(),
    }
}

/// Tracks the per-component relayed-nomination timers. Arming hands the
/// caller a receiver to select the expiry against; cancelling drops the
/// sender, which fires the receiver's closed branch.
pub(crate) struct RelayedDebounce {
    pending: SyncMutex<HashMap<(String, u16), mpsc::Sender<()>>>,
    pub(crate) window: Duration,
}

impl RelayedDebounce {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            pending: SyncMutex::new(HashMap::new()),
            window,
        }
    }

    /// Arms the timer for (stream, component). Returns None when one is
    /// already pending.
    pub(crate) fn arm(&self, stream: &str, component_id: u16) -> Option<mpsc::Receiver<()>> {
        let mut pending = self.pending.lock();
        let key = (stream.to_owned(), component_id);
        if pending.contains_key(&key) {
            return None;
        }

        let (tx, rx) = mpsc::channel(1);
        pending.insert(key, tx);
        Some(rx)
    }

    /// Cancels a pending timer, if any.
    pub(crate) fn cancel(&self, stream: &str, component_id: u16) {
        self.pending
            .lock()
            .remove(&(stream.to_owned(), component_id));
    }

    /// Forgets an expired timer without cancelling it.
    pub(crate) fn clear(&self, stream: &str, component_id: u16) {
        self.cancel(stream, component_id);
    }

    pub(crate) fn is_armed(&self, stream: &str, component_id: u16) -> bool {
        self.pending
            .lock()
            .contains_key(&(stream.to_owned(), component_id))
    }
}
