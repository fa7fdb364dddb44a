use url::Url;

use super::candidate_base::*;
use super::*;
use crate::error::Result;

/// Configuration for a relayed candidate: an allocation on a TURN server.
/// Allocation bookkeeping itself happens outside this crate; the candidate
/// only models the relayed transport address.
#[derive(Default)]
pub struct CandidateRelayConfig {
    pub base_config: CandidateBaseConfig,
    pub rel_addr: String,
    pub rel_port: u16,
    /// The TURN server the allocation lives on; part of the foundation key.
    pub server: Option<Url>,
}

impl CandidateRelayConfig {
    /// Creates a new relayed candidate. Relayed candidates are their own base
    /// and own the socket that talks to the relay.
    pub fn new_candidate_relay(self) -> Result<CandidateBase> {
        let related = if self.rel_addr.is_empty() {
            None
        } else {
            Some(CandidateRelatedAddress {
                address: self.rel_addr,
                port: self.rel_port,
            })
        };

        self.base_config.build(
            CandidateType::Relay,
            related,
            self.server.map(|url| url.to_string()),
            None,
            true,
        )
    }
}
