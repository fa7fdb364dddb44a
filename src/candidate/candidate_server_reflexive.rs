use std::net::SocketAddr;

use url::Url;

use super::candidate_base::*;
use super::*;
use crate::error::Result;

/// Configuration for a server-reflexive candidate: the mapped address a STUN
/// server reported for one of our host sockets.
#[derive(Default)]
pub struct CandidateServerReflexiveConfig {
    pub base_config: CandidateBaseConfig,
    pub rel_addr: String,
    pub rel_port: u16,
    /// The STUN server the mapping was learned from; part of the foundation key.
    pub server: Option<Url>,
    /// The owning host candidate's address. Checks are sent from this socket.
    pub base_addr: Option<SocketAddr>,
}

impl CandidateServerReflexiveConfig {
    /// Creates a new server-reflexive candidate. The socket reference, when
    /// present, is shared with the base and never closed from here.
    pub fn new_candidate_server_reflexive(self) -> Result<CandidateBase> {
        let related = if self.rel_addr.is_empty() {
            None
        } else {
            Some(CandidateRelatedAddress {
                address: self.rel_addr,
                port: self.rel_port,
            })
        };

        self.base_config.build(
            CandidateType::ServerReflexive,
            related,
            self.server.map(|url| url.to_string()),
            self.base_addr,
            false,
        )
    }
}
