
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use util::vnet::net::Net;

use crate::candidate::candidate_base::{derive_local_preference, CandidateBaseConfig};
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::Candidate;
use crate::error::*;
use crate::util::listen_udp_in_port_range;

/// Produces local candidates for one component. STUN/TURN/UPnP harvesters
/// live outside this crate and plug in through this trait; the built-in
/// [`HostHarvester`] covers plain sockets.
#[async_trait]
pub trait CandidateHarvester: Send + Sync {
    fn name(&self) -> &str;

    async fn harvest(
        &self,
        component_id: u16,
    ) -> Result<Vec<Arc<dyn Candidate + Send + Sync>>>;
}

/// Binds one UDP socket per configured address and wraps each in a host
/// candidate. Interface enumeration is out of scope: the addresses to use
/// are handed in explicitly.
pub struct HostHarvester {
    net: Arc<Net>,
    addresses: Vec<IpAddr>,
    port_min: u16,
    port_max: u16,
}

impl HostHarvester {
    #[must_use]
    pub fn new(net: Arc<Net>, addresses: Vec<IpAddr>, port_min: u16, port_max: u16) -> Self {
        Self {
            net,
            addresses,
            port_min,
            port_max,
        }
    }
}

#[async_trait]
impl CandidateHarvester for HostHarvester {
    fn name(&self) -> &str {
        "host"
    }

    async fn harvest(
        &self,
        component_id: u16,
    ) -> Result<Vec<Arc<dyn Candidate + Send + Sync>>> {
        if self.port_min > self.port_max && self.port_max != 0 {
            return Err(Error::ErrPortRange);
        }

        let single = self.addresses.len() <= 1;
        let mut harvested: Vec<Arc<dyn Candidate + Send + Sync>> = vec![];

        for ip in &self.addresses {
            let conn = match listen_udp_in_port_range(
                &self.net,
                self.port_max,
                self.port_min,
                SocketAddr::new(*ip, 0),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("[host harvester]: failed to bind {}: {}", ip, err);
                    continue;
                }
            };

            let bound = conn.local_addr().map_err(|_| Error::ErrBindFailure)?;

            let candidate = CandidateHostConfig {
                base_config: CandidateBaseConfig {
                    network: "udp".to_owned(),
                    address: bound.ip().to_string(),
                    port: bound.port(),
                    component_id,
                    local_preference: if single {
                        None
                    } else {
                        Some(derive_local_preference(ip, false))
                    },
                    conn: Some(conn),
                    ..CandidateBaseConfig::default()
                },
            }
            .new_candidate_host()?;

            harvested.push(Arc::new(candidate));
        }

        if harvested.is_empty() {
            return Err(Error::ErrBindFailure);
        }

        Ok(harvested)
    }
}
