use super::candidate_base::*;
use super::*;
use crate::error::Result;

/// Configuration for a host candidate: an address the agent bound directly.
#[derive(Default)]
pub struct CandidateHostConfig {
    pub base_config: CandidateBaseConfig,
}

impl CandidateHostConfig {
    /// Creates a new host candidate. Host candidates are their own base and
    /// own the socket they were bound on.
    pub fn new_candidate_host(self) -> Result<CandidateBase> {
        self.base_config
            .build(CandidateType::Host, None, None, None, true)
    }
}
