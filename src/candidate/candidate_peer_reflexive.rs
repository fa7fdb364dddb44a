use std::net::SocketAddr;

use super::candidate_base::*;
use super::*;
use crate::error::Result;

/// Configuration for a peer-reflexive candidate: an address learned only
/// through the mapped address in a Binding response from the peer (local
/// side), or through the source address of an unknown check (remote side).
#[derive(Default)]
pub struct CandidatePeerReflexiveConfig {
    pub base_config: CandidateBaseConfig,
    pub rel_addr: String,
    pub rel_port: u16,
    /// The local candidate this one was discovered from. Absent for remote
    /// peer-reflexive candidates.
    pub base_addr: Option<SocketAddr>,
}

impl CandidatePeerReflexiveConfig {
    /// Creates a new peer-reflexive candidate.
    pub fn new_candidate_peer_reflexive(self) -> Result<CandidateBase> {
        let related = if self.rel_addr.is_empty() {
            None
        } else {
            Some(CandidateRelatedAddress {
                address: self.rel_addr,
                port: self.rel_port,
            })
        };

        self.base_config.build(
            CandidateType::PeerReflexive,
            related,
            None,
            self.base_addr,
            false,
        )
    }
}
