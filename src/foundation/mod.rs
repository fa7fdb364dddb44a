
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use util::sync::Mutex as SyncMutex;

use crate::candidate::{Candidate, CandidateType};
use crate::network_type::NetworkType;

/// The characteristics that make two candidates behave identically on the
/// network: same kind, same base IP, same transport, same discovery server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FoundationKey {
    pub kind: CandidateType,
    pub base_ip: IpAddr,
    pub network_type: NetworkType,
    pub server: Option<String>,
}

/// Process-wide assignment of foundation strings. Candidates sharing a key
/// share a foundation. Peer-reflexive foundations come from an independent
/// counter and carry a distinct prefix, so no amount of ordinary
/// assignments can ever produce a colliding token.
pub struct FoundationsRegistry {
    assigned: SyncMutex<HashMap<FoundationKey, String>>,
    next: AtomicUsize,
    next_prflx: AtomicUsize,
}

// Ordinary foundations are bare decimals; peer-reflexive ones wear this
// prefix. The two alphabets are disjoint by construction.
const PRFLX_FOUNDATION_PREFIX: &str = "p";

impl Default for FoundationsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FoundationsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assigned: SyncMutex::new(HashMap::new()),
            next: AtomicUsize::new(1),
            next_prflx: AtomicUsize::new(1),
        }
    }

    fn key_of(candidate: &dyn Candidate) -> FoundationKey {
        FoundationKey {
            kind: candidate.candidate_type(),
            base_ip: candidate.base_addr().ip(),
            network_type: candidate.network_type(),
            server: candidate.server(),
        }
    }

    /// Assigns `candidate` the foundation registered for its key, allocating
    /// a fresh token when the key is new.
    pub fn assign(&self, candidate: &dyn Candidate) {
        let key = Self::key_of(candidate);

        let foundation = {
            let mut assigned = self.assigned.lock();
            if let Some(existing) = assigned.get(&key) {
                existing.clone()
            } else {
                let fresh = self.next.fetch_add(1, Ordering::SeqCst).to_string();
                assigned.insert(key, fresh.clone());
                fresh
            }
        };

        candidate.set_foundation(&foundation);
    }

    /// Allocates a peer-reflexive foundation. These are drawn from their own
    /// counter and are never reused for ordinary candidates.
    pub fn assign_peer_reflexive(&self, candidate: &dyn Candidate) {
        let n = self.next_prflx.fetch_add(1, Ordering::SeqCst);
        candidate.set_foundation(&format!("{}{}", PRFLX_FOUNDATION_PREFIX, n));
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.assigned.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.lock().is_empty()
    }
}
