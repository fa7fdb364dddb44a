use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use stun::agent::TransactionId;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;

use super::*;
use crate::error::Result;

/// Represents a combination of a local and remote candidate subject to
/// connectivity checks.
pub struct CandidatePair {
    pub(crate) ice_role_controlling: AtomicBool,
    pub remote: Arc<dyn Candidate + Send + Sync>,
    pub local: Arc<dyn Candidate + Send + Sync>,

    pub(crate) state: AtomicU8, // CandidatePairState
    pub(crate) nominated: AtomicBool,
    pub(crate) use_candidate_sent: AtomicBool,
    pub(crate) use_candidate_received: AtomicBool,
    pub(crate) validated: AtomicBool,

    pub(crate) binding_request_count: AtomicU16,
    pub(crate) rtt_nanos: AtomicU64, // 0 = unmeasured
    pub(crate) consent_freshness_at: SyncMutex<Option<Instant>>,

    // Linearizes check-related transitions: the paced check, a superseding
    // triggered check and the response handler all take this lock, so
    // nomination runs exactly once even when a response and an incoming
    // USE-CANDIDATE request race on the same pair.
    pub(crate) check_lock: Arc<Mutex<()>>,
    pub(crate) transaction_id: SyncMutex<Option<TransactionId>>,
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl PartialEq for CandidatePair {
    /// Pair equality is equality of the transport addresses.
    fn eq(&self, other: &Self) -> bool {
        self.local.addr() == other.local.addr() && self.remote.addr() == other.remote.addr()
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
        controlling: bool,
    ) -> Self {
        Self {
            ice_role_controlling: AtomicBool::new(controlling),
            remote,
            local,

            state: AtomicU8::new(CandidatePairState::Frozen as u8),
            nominated: AtomicBool::new(false),
            use_candidate_sent: AtomicBool::new(false),
            use_candidate_received: AtomicBool::new(false),
            validated: AtomicBool::new(false),

            binding_request_count: AtomicU16::new(0),
            rtt_nanos: AtomicU64::new(0),
            consent_freshness_at: SyncMutex::new(None),

            check_lock: Arc::new(Mutex::new(())),
            transaction_id: SyncMutex::new(None),
        }
    }

    /// The pair foundation: the concatenation of the member foundations.
    pub fn foundation(&self) -> String {
        self.local.foundation() + &self.remote.foundation()
    }

    /// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority of the controlling agent's candidate and D the
    /// priority of the controlled agent's candidate:
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling.load(Ordering::SeqCst) {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        (1_u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    pub fn state(&self) -> CandidatePairState {
        CandidatePairState::from(self.state.load(Ordering::SeqCst))
    }

    /// Attempts the transition to `new_state`, enforcing the sequence
    /// Frozen → Waiting → InProgress → {Succeeded, Failed}. InProgress may
    /// return to Waiting when a triggered check supersedes the transaction,
    /// and Failed may return to Waiting through a triggered check. Returns
    /// false (and leaves the state alone) for anything else, which is how
    /// late arrivals for cancelled transactions are tolerated.
    pub fn set_state(&self, new_state: CandidatePairState) -> bool {
        let current = self.state();
        if current == new_state {
            return false;
        }

        let allowed = matches!(
            (current, new_state),
            (CandidatePairState::Frozen, CandidatePairState::Waiting)
                | (CandidatePairState::Waiting, CandidatePairState::InProgress)
                | (CandidatePairState::InProgress, CandidatePairState::Succeeded)
                | (CandidatePairState::InProgress, CandidatePairState::Failed)
                | (CandidatePairState::InProgress, CandidatePairState::Waiting)
                | (CandidatePairState::Failed, CandidatePairState::Waiting)
        );

        if !allowed {
            log::trace!(
                "ignoring pair state transition {} -> {} for {}",
                current,
                new_state,
                self
            );
            return false;
        }

        self.state.store(new_state as u8, Ordering::SeqCst);
        true
    }

    pub fn nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    pub fn validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn use_candidate_received(&self) -> bool {
        self.use_candidate_received.load(Ordering::SeqCst)
    }

    /// The last measured Binding round-trip, if any check completed.
    pub fn round_trip_time(&self) -> Option<Duration> {
        match self.rtt_nanos.load(Ordering::SeqCst) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    pub(crate) fn record_round_trip_time(&self, rtt: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.rtt_nanos.store(rtt.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Stamps consent freshness; only meaningful for the selected pair.
    pub(crate) fn stamp_consent_freshness(&self) {
        *self.consent_freshness_at.lock() = Some(Instant::now());
    }

    pub fn consent_freshness_at(&self) -> Option<Instant> {
        *self.consent_freshness_at.lock()
    }

    pub(crate) fn set_in_flight(&self, id: Option<TransactionId>) {
        *self.transaction_id.lock() = id;
    }

    pub(crate) fn in_flight(&self) -> Option<TransactionId> {
        *self.transaction_id.lock()
    }

    pub async fn write(&self, b: &[u8]) -> Result<usize> {
        self.local.write_to(b, &*self.remote).await
    }
}
