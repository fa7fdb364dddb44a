#[cfg(test)]
mod candidate_test;

pub mod candidate_base;
pub mod candidate_host;
pub mod candidate_pair;
pub mod candidate_peer_reflexive;
pub mod candidate_relay;
pub mod candidate_server_reflexive;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::error::Result;
use crate::network_type::*;

pub(crate) const RECEIVE_MTU: usize = 8192;
pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Component id of the RTP component.
pub const COMPONENT_RTP: u16 = 1;
/// Component id of the RTCP component.
pub const COMPONENT_RTCP: u16 = 2;
/// Largest allowed component id.
pub const MAX_COMPONENT_ID: u16 = 256;

/// Candidate represents an ICE candidate: a transport address together with
/// its discovery method and priority.
#[async_trait]
pub trait Candidate: fmt::Display + fmt::Debug {
    /// An arbitrary string used in the freezing algorithm to
    /// group similar candidates. It is the same for two candidates that
    /// have the same type, base IP address, protocol and STUN/TURN server.
    fn foundation(&self) -> String;

    /// Overwrites the foundation; called by the foundations registry when the
    /// candidate is adopted by a component.
    fn set_foundation(&self, foundation: &str);

    /// A unique identifier for just this candidate.
    fn id(&self) -> String;

    /// The id of the component the candidate belongs to (1 = RTP, 2 = RTCP).
    fn component_id(&self) -> u16;
    fn set_component_id(&self, c: u16);

    /// The last time this candidate received traffic.
    fn last_received(&self) -> SystemTime;

    /// The last time this candidate sent traffic.
    fn last_sent(&self) -> SystemTime;

    fn network_type(&self) -> NetworkType;
    fn address(&self) -> String;
    fn port(&self) -> u16;

    fn priority(&self) -> u32;
    fn local_preference(&self) -> u16;

    /// A transport address related to the candidate,
    /// useful for diagnostics and other purposes.
    fn related_address(&self) -> Option<CandidateRelatedAddress>;

    fn candidate_type(&self) -> CandidateType;

    /// The STUN or TURN server this candidate was discovered through, if any.
    /// Part of the foundation key.
    fn server(&self) -> Option<String>;

    fn marshal(&self) -> String;

    /// The candidate's own transport address.
    fn addr(&self) -> SocketAddr;

    /// The base address: the candidate's own address for host and relayed
    /// candidates, the owning host candidate's address for reflexive ones.
    /// Checks always originate from the base socket.
    fn base_addr(&self) -> SocketAddr;

    async fn close(&self) -> Result<()>;
    fn seen(&self, outbound: bool);

    async fn write_to(&self, raw: &[u8], dst: &(dyn Candidate + Send + Sync)) -> Result<usize>;
    fn equal(&self, other: &dyn Candidate) -> bool;

    /// Two local candidates are redundant when they share both the transport
    /// address and the base; a component refuses to adopt the second one.
    fn redundant_with(&self, other: &dyn Candidate) -> bool;

    fn get_conn(&self) -> Option<&Arc<dyn util::Conn + Send + Sync>>;

    /// Whether `close()` may release the underlying socket. Reflexive
    /// candidates share their base's socket and must leave it open.
    fn owns_conn(&self) -> bool;

    fn get_closed_ch(&self) -> Arc<Mutex<Option<broadcast::Sender<()>>>>;
}

/// Represents the type of candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{}", s)
    }
}

impl Default for CandidateType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl CandidateType {
    /// Returns the type preference of a `CandidateType`.
    ///
    /// RFC 8445 5.1.2.2: the RECOMMENDED values are 126 for host candidates,
    /// 110 for peer-reflexive candidates, 100 for server-reflexive candidates
    /// and 0 for relayed candidates. Peer-reflexive must stay strictly above
    /// server-reflexive so that learned candidates outrank their origin.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }

    /// Returns the preference used when electing a component's default
    /// candidate: the candidate most likely to work for naive peers, which
    /// orders exactly opposite to the connectivity preference.
    #[must_use]
    pub fn default_preference(self, network_type: NetworkType) -> u16 {
        match self {
            Self::Relay => 30,
            Self::ServerReflexive => 20,
            Self::Host => {
                if network_type.is_ipv6() {
                    10
                } else {
                    15
                }
            }
            Self::PeerReflexive | Self::Unspecified => 5,
        }
    }
}

pub(crate) fn contains_candidate_type(
    candidate_type: CandidateType,
    candidate_type_list: &[CandidateType],
) -> bool {
    candidate_type_list.iter().any(|ct| *ct == candidate_type)
}

/// Conveys transport addresses related to the candidate, useful for
/// diagnostics and other purposes.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CandidateRelatedAddress {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for CandidateRelatedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " related {}:{}", self.address, self.port)
    }
}

/// Represents the ICE candidate pair state.
///
/// The canonical sequence is Frozen → Waiting → InProgress →
/// {Succeeded, Failed}; a Failed pair may return to Waiting only through a
/// triggered check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidatePairState {
    #[serde(rename = "unspecified")]
    Unspecified = 0,

    /// A check for this pair is held back until its foundation is unfrozen.
    #[serde(rename = "frozen")]
    Frozen = 1,

    /// A check has not been performed for this pair yet.
    #[serde(rename = "waiting")]
    Waiting = 2,

    /// A check has been sent for this pair and the transaction is in progress.
    #[serde(rename = "in-progress")]
    InProgress = 3,

    /// The check for this pair produced a successful, symmetric response.
    #[serde(rename = "succeeded")]
    Succeeded = 4,

    /// The check for this pair failed: it never produced a response or
    /// produced an unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed = 5,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Frozen,
            2 => Self::Waiting,
            3 => Self::InProgress,
            4 => Self::Succeeded,
            5 => Self::Failed,
            _ => Self::Unspecified,
        }
    }
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unspecified => "unspecified",
        };

        write!(f, "{}", s)
    }
}

impl CandidatePairState {
    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}
