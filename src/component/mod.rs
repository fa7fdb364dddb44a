
pub mod component_socket;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use util::sync::Mutex as SyncMutex;
use util::Buffer;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidatePairState, CandidateType};
use crate::error::*;
use crate::events::{EventBus, StreamEvent};
use crate::foundation::FoundationsRegistry;

// The number of bytes the ingress buffer may hold before writes error.
pub(crate) const MAX_BUFFER_SIZE: usize = 1000 * 1000; // 1MB

/// A component is one piece of a data stream: component 1 carries RTP,
/// component 2 RTCP. It owns the stream's candidates for that piece, the
/// default candidates, and the selected pair once nomination confirmed one.
pub struct Component {
    id: u16,
    stream_name: String,

    local_candidates: SyncMutex<Vec<Arc<dyn Candidate + Send + Sync>>>,
    remote_candidates: SyncMutex<Vec<Arc<dyn Candidate + Send + Sync>>>,
    // Remote candidates that trickled in after the initial offer/answer,
    // queued until the orchestrator folds them into the check list.
    remote_update_candidates: SyncMutex<Vec<Arc<dyn Candidate + Send + Sync>>>,

    default_local: SyncMutex<Option<Arc<dyn Candidate + Send + Sync>>>,
    default_remote: SyncMutex<Option<Arc<dyn Candidate + Send + Sync>>>,

    selected_pair: ArcSwapOption<CandidatePair>,
    valid_pairs: SyncMutex<Vec<Arc<CandidatePair>>>,

    // Sources validated via a Succeeded check. Copy-on-write so the receive
    // hot path reads without locking.
    authorized_remotes: ArcSwap<HashSet<SocketAddr>>,

    pub(crate) buffer: Buffer,
    events: EventBus,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component").field("id", &self.id).finish()
    }
}

impl Component {
    #[must_use]
    pub fn new(id: u16, stream_name: &str, events: EventBus) -> Self {
        Self {
            id,
            stream_name: stream_name.to_owned(),

            local_candidates: SyncMutex::new(vec![]),
            remote_candidates: SyncMutex::new(vec![]),
            remote_update_candidates: SyncMutex::new(vec![]),

            default_local: SyncMutex::new(None),
            default_remote: SyncMutex::new(None),

            selected_pair: ArcSwapOption::empty(),
            valid_pairs: SyncMutex::new(vec![]),

            authorized_remotes: ArcSwap::from_pointee(HashSet::new()),

            buffer: Buffer::new(0, MAX_BUFFER_SIZE),
            events,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Adopts a local candidate: rejects it as redundant when another local
    /// candidate carries the same transport address and the same base,
    /// otherwise assigns its foundation, stamps the component id and inserts
    /// it at its priority-sorted position.
    pub fn add_local_candidate(
        &self,
        candidate: Arc<dyn Candidate + Send + Sync>,
        foundations: &FoundationsRegistry,
    ) -> bool {
        {
            let locals = self.local_candidates.lock();
            if locals.iter().any(|c| c.redundant_with(&*candidate)) {
                log::debug!(
                    "[{}/{}]: redundant local candidate ignored: {}",
                    self.stream_name,
                    self.id,
                    candidate
                );
                return false;
            }
        }

        candidate.set_component_id(self.id);
        if candidate.candidate_type() == CandidateType::PeerReflexive {
            foundations.assign_peer_reflexive(&*candidate);
        } else {
            foundations.assign(&*candidate);
        }

        let addr = candidate.addr();
        {
            let mut locals = self.local_candidates.lock();
            locals.push(candidate);
            locals.sort_by(|a, b| b.priority().cmp(&a.priority()));
        }

        self.events.publish(StreamEvent::CandidateAdded {
            stream: self.stream_name.clone(),
            component_id: self.id,
            addr,
        });
        true
    }

    /// Adds a peer-reported candidate, deduplicating by transport address and
    /// kind as trickle updates require.
    pub fn add_remote_candidate(&self, candidate: Arc<dyn Candidate + Send + Sync>) -> bool {
        candidate.set_component_id(self.id);

        let mut remotes = self.remote_candidates.lock();
        if remotes.iter().any(|c| {
            c.addr() == candidate.addr() && c.candidate_type() == candidate.candidate_type()
        }) {
            return false;
        }

        remotes.push(candidate);
        true
    }

    /// Queues a trickled remote candidate for the orchestrator.
    pub fn queue_remote_update(&self, candidate: Arc<dyn Candidate + Send + Sync>) {
        self.remote_update_candidates.lock().push(candidate);
    }

    pub fn drain_remote_updates(&self) -> Vec<Arc<dyn Candidate + Send + Sync>> {
        self.remote_update_candidates.lock().drain(..).collect()
    }

    pub fn local_candidates(&self) -> Vec<Arc<dyn Candidate + Send + Sync>> {
        self.local_candidates.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<Arc<dyn Candidate + Send + Sync>> {
        self.remote_candidates.lock().clone()
    }

    pub fn find_local_candidate(&self, addr: SocketAddr) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let locals = self.local_candidates.lock();
        locals.iter().find(|c| c.addr() == addr).cloned()
    }

    pub fn find_remote_candidate(
        &self,
        addr: SocketAddr,
    ) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let remotes = self.remote_candidates.lock();
        remotes.iter().find(|c| c.addr() == addr).cloned()
    }

    /// Elects the default local candidate: the one with the highest default
    /// preference, i.e. the address most likely to work without ICE.
    pub fn select_default_candidate(&self) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let best = {
            let locals = self.local_candidates.lock();
            let mut best: Option<&Arc<dyn Candidate + Send + Sync>> = None;
            for c in locals.iter() {
                let pref = c.candidate_type().default_preference(c.network_type());
                match best {
                    None => best = Some(c),
                    Some(b) => {
                        if pref > b.candidate_type().default_preference(b.network_type()) {
                            best = Some(c);
                        }
                    }
                }
            }
            best.cloned()
        };

        *self.default_local.lock() = best.clone();
        best
    }

    pub fn default_local_candidate(&self) -> Option<Arc<dyn Candidate + Send + Sync>> {
        self.default_local.lock().clone()
    }

    pub fn set_default_remote_candidate(&self, candidate: Arc<dyn Candidate + Send + Sync>) {
        *self.default_remote.lock() = Some(candidate);
    }

    pub fn default_remote_candidate(&self) -> Option<Arc<dyn Candidate + Send + Sync>> {
        self.default_remote.lock().clone()
    }

    /// Records a validated pair for this component.
    pub fn add_valid_pair(&self, pair: Arc<CandidatePair>) {
        let mut valid = self.valid_pairs.lock();
        if !valid.iter().any(|p| **p == *pair) {
            valid.push(pair);
        }
    }

    pub fn valid_pairs(&self) -> Vec<Arc<CandidatePair>> {
        self.valid_pairs.lock().clone()
    }

    pub(crate) fn best_valid_pair(&self) -> Option<Arc<CandidatePair>> {
        let valid = self.valid_pairs.lock();
        valid
            .iter()
            .filter(|p| p.state() == CandidatePairState::Succeeded)
            .max_by_key(|p| p.priority())
            .cloned()
    }

    /// Sets the selected pair. Only the first confirmation takes effect.
    pub fn set_selected_pair(&self, pair: Arc<CandidatePair>) -> bool {
        if self.selected_pair.load().is_some() {
            return false;
        }

        self.authorize_remote(pair.remote.addr());
        self.selected_pair.store(Some(pair.clone()));
        self.events.publish(StreamEvent::SelectedPairChanged {
            stream: self.stream_name.clone(),
            component_id: self.id,
            local: pair.local.addr(),
            remote: pair.remote.addr(),
        });
        true
    }

    pub fn selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.selected_pair.load().clone()
    }

    /// Adds `addr` to the set of sources the component socket accepts.
    pub fn authorize_remote(&self, addr: SocketAddr) {
        let current = self.authorized_remotes.load();
        if current.contains(&addr) {
            return;
        }
        let mut next = HashSet::clone(&current);
        next.insert(addr);
        self.authorized_remotes.store(Arc::new(next));
    }

    pub fn is_authorized(&self, addr: SocketAddr) -> bool {
        self.authorized_remotes.load().contains(&addr)
    }

    /// Hands a non-STUN datagram to the component socket buffer, dropping it
    /// when the source was never validated.
    pub(crate) async fn ingest(&self, buf: &[u8], src_addr: SocketAddr) -> Result<()> {
        if !self.is_authorized(src_addr) {
            log::warn!(
                "[{}/{}]: discarded {} bytes from unauthorized source {}",
                self.stream_name,
                self.id,
                buf.len(),
                src_addr
            );
            return Ok(());
        }

        self.buffer
            .write(buf)
            .await
            .map_err(|err| Error::Other(err.to_string()))?;
        Ok(())
    }

    /// Releases candidates in the order Relayed → PeerReflexive →
    /// ServerReflexive → Host, so sockets shared with a host base are off the
    /// books before the base itself closes. When `keep` names a pair, its
    /// local candidate survives for media and keep-alives.
    pub async fn free(&self, keep: Option<&CandidatePair>) {
        let locals: Vec<Arc<dyn Candidate + Send + Sync>> = {
            let mut locals = self.local_candidates.lock();
            let all = locals.clone();
            locals.retain(|c| {
                if let Some(pair) = keep {
                    c.addr() == pair.local.addr() || c.addr() == pair.local.base_addr()
                } else {
                    false
                }
            });
            all
        };

        for kind in [
            CandidateType::Relay,
            CandidateType::PeerReflexive,
            CandidateType::ServerReflexive,
            CandidateType::Host,
        ] {
            for c in locals.iter().filter(|c| c.candidate_type() == kind) {
                if let Some(pair) = keep {
                    if c.addr() == pair.local.addr() || c.addr() == pair.local.base_addr() {
                        continue;
                    }
                }
                if let Err(err) = c.close().await {
                    log::warn!(
                        "[{}/{}]: failed to close candidate {}: {}",
                        self.stream_name,
                        self.id,
                        c,
                        err
                    );
                }
            }
        }

        self.remote_candidates.lock().clear();
        self.remote_update_candidates.lock().clear();
    }
}
