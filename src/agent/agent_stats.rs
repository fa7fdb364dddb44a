use serde::Serialize;

use super::Agent;
use crate::candidate::{Candidate, CandidatePairState, CandidateType};
use crate::error::*;
use crate::network_type::NetworkType;

/// A snapshot of one candidate pair, taken under the list lock.
#[derive(Debug, Clone, Serialize)]
pub struct CandidatePairStats {
    pub stream: String,
    pub component_id: u16,
    pub local_addr: String,
    pub remote_addr: String,
    pub pair_priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
    pub validated: bool,
    /// Last measured Binding round-trip, in milliseconds.
    pub current_round_trip_time_ms: Option<u128>,
}

/// A snapshot of one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStats {
    pub id: String,
    pub stream: String,
    pub component_id: u16,
    pub network_type: NetworkType,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub priority: u32,
    pub foundation: String,
    pub related_address: Option<String>,
}

impl Agent {
    /// Returns a list of candidate pair stats across all streams.
    pub fn get_candidate_pairs_stats(&self) -> Vec<CandidatePairStats> {
        let mut stats = vec![];
        for stream in self.internal.stream_list() {
            for pair in stream.check_list().pairs() {
                stats.push(CandidatePairStats {
                    stream: stream.name().to_owned(),
                    component_id: pair.local.component_id(),
                    local_addr: pair.local.addr().to_string(),
                    remote_addr: pair.remote.addr().to_string(),
                    pair_priority: pair.priority(),
                    state: pair.state(),
                    nominated: pair.nominated(),
                    validated: pair.validated(),
                    current_round_trip_time_ms: pair
                        .round_trip_time()
                        .map(|rtt| rtt.as_millis()),
                });
            }
        }
        stats
    }

    /// Returns a list of local candidate stats.
    pub fn get_local_candidates_stats(&self) -> Result<Vec<CandidateStats>> {
        let mut stats = vec![];
        for stream in self.internal.stream_list() {
            for component in stream.components() {
                for candidate in component.local_candidates() {
                    stats.push(CandidateStats {
                        id: candidate.id(),
                        stream: stream.name().to_owned(),
                        component_id: component.id(),
                        network_type: candidate.network_type(),
                        address: candidate.address(),
                        port: candidate.port(),
                        candidate_type: candidate.candidate_type(),
                        priority: candidate.priority(),
                        foundation: candidate.foundation(),
                        related_address: candidate
                            .related_address()
                            .map(|r| format!("{}:{}", r.address, r.port)),
                    });
                }
            }
        }
        Ok(stats)
    }

    /// Returns a list of remote candidate stats.
    pub fn get_remote_candidates_stats(&self) -> Result<Vec<CandidateStats>> {
        let mut stats = vec![];
        for stream in self.internal.stream_list() {
            for component in stream.components() {
                for candidate in component.remote_candidates() {
                    stats.push(CandidateStats {
                        id: candidate.id(),
                        stream: stream.name().to_owned(),
                        component_id: component.id(),
                        network_type: candidate.network_type(),
                        address: candidate.address(),
                        port: candidate.port(),
                        candidate_type: candidate.candidate_type(),
                        priority: candidate.priority(),
                        foundation: candidate.foundation(),
                        related_address: candidate
                            .related_address()
                            .map(|r| format!("{}:{}", r.address, r.port)),
                    });
                }
            }
        }
        Ok(stats)
    }
}
