use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Add;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use util::sync::Mutex as SyncMutex;

use super::*;
use crate::error::*;
use crate::network_type::{determine_network_type, NetworkType};
use crate::rand::generate_cand_id;
use crate::util::create_addr;

#[derive(Default)]
pub struct CandidateBaseConfig {
    pub candidate_id: String,
    pub network: String,
    pub address: String,
    pub port: u16,
    pub component_id: u16,
    pub priority: u32,
    pub local_preference: Option<u16>,
    pub foundation: String,
    pub conn: Option<Arc<dyn util::Conn + Send + Sync>>,
}

pub struct CandidateBase {
    pub(crate) id: String,
    pub(crate) network_type: AtomicU8,
    pub(crate) candidate_type: CandidateType,

    pub(crate) component_id: AtomicU16,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) related_address: Option<CandidateRelatedAddress>,
    pub(crate) server: Option<String>,

    pub(crate) resolved_addr: SyncMutex<SocketAddr>,
    pub(crate) base_addr: SyncMutex<SocketAddr>,

    pub(crate) foundation_override: SyncMutex<String>,
    pub(crate) priority_override: AtomicU32,
    pub(crate) local_preference: u16,

    pub(crate) last_sent: AtomicU64,
    pub(crate) last_received: AtomicU64,

    pub(crate) conn: Option<Arc<dyn util::Conn + Send + Sync>>,
    pub(crate) owns_conn: bool,
    pub(crate) closed_ch: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl Default for CandidateBase {
    fn default() -> Self {
        Self {
            id: String::new(),
            network_type: AtomicU8::new(0),
            candidate_type: CandidateType::default(),

            component_id: AtomicU16::new(0),
            address: String::new(),
            port: 0,
            related_address: None,
            server: None,

            resolved_addr: SyncMutex::new(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)),
            base_addr: SyncMutex::new(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)),

            foundation_override: SyncMutex::new(String::new()),
            priority_override: AtomicU32::new(0),
            local_preference: DEFAULT_LOCAL_PREFERENCE,

            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),

            conn: None,
            owns_conn: false,
            closed_ch: Arc::new(Mutex::new(None)),
        }
    }
}

// String makes the candidateBase printable
impl fmt::Display for CandidateBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related_address) = self.related_address() {
            write!(
                f,
                "{} {} {}:{}{}",
                self.network_type(),
                self.candidate_type(),
                self.address(),
                self.port(),
                related_address,
            )
        } else {
            write!(
                f,
                "{} {} {}:{}",
                self.network_type(),
                self.candidate_type(),
                self.address(),
                self.port(),
            )
        }
    }
}

impl fmt::Debug for CandidateBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[async_trait]
impl Candidate for CandidateBase {
    fn foundation(&self) -> String {
        self.foundation_override.lock().clone()
    }

    fn set_foundation(&self, foundation: &str) {
        *self.foundation_override.lock() = foundation.to_owned();
    }

    /// Returns Candidate ID.
    fn id(&self) -> String {
        self.id.clone()
    }

    fn component_id(&self) -> u16 {
        self.component_id.load(Ordering::SeqCst)
    }

    fn set_component_id(&self, component_id: u16) {
        self.component_id.store(component_id, Ordering::SeqCst);
    }

    /// Returns a time indicating the last time this candidate was received.
    fn last_received(&self) -> SystemTime {
        UNIX_EPOCH.add(Duration::from_nanos(
            self.last_received.load(Ordering::SeqCst),
        ))
    }

    /// Returns a time indicating the last time this candidate was sent.
    fn last_sent(&self) -> SystemTime {
        UNIX_EPOCH.add(Duration::from_nanos(self.last_sent.load(Ordering::SeqCst)))
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::from(self.network_type.load(Ordering::SeqCst))
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    /// Computes the priority for this ICE Candidate:
    /// priority = (type_pref << 24) | (local_pref << 8) | (256 - component_id)
    fn priority(&self) -> u32 {
        let priority_override = self.priority_override.load(Ordering::SeqCst);
        if priority_override != 0 {
            return priority_override;
        }

        (1 << 24) * u32::from(self.candidate_type().preference())
            + (1 << 8) * u32::from(self.local_preference())
            + (256 - u32::from(self.component_id()))
    }

    fn local_preference(&self) -> u16 {
        self.local_preference
    }

    fn related_address(&self) -> Option<CandidateRelatedAddress> {
        self.related_address.as_ref().cloned()
    }

    fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    fn server(&self) -> Option<String> {
        self.server.as_ref().cloned()
    }

    /// Returns the text representation of this candidate as exchanged at the
    /// offer/answer boundary.
    fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation(),
            self.component_id(),
            self.network_type().network_short(),
            self.priority(),
            self.address(),
            self.port(),
            self.candidate_type()
        );

        if let Some(related_address) = self.related_address() {
            val += format!(
                " raddr {} rport {}",
                related_address.address, related_address.port,
            )
            .as_str();
        }

        val
    }

    fn addr(&self) -> SocketAddr {
        *self.resolved_addr.lock()
    }

    fn base_addr(&self) -> SocketAddr {
        *self.base_addr.lock()
    }

    /// Releases the candidate's socket, but only when it owns one. Closing a
    /// candidate that never ran a reader is a no-op unless it holds a socket.
    async fn close(&self) -> Result<()> {
        {
            let mut closed_ch = self.closed_ch.lock().await;
            if closed_ch.is_none() && self.owns_conn && self.conn.is_some() {
                return Err(Error::ErrClosed);
            }
            closed_ch.take();
        }

        if self.owns_conn {
            if let Some(conn) = &self.conn {
                let _ = conn.close().await;
            }
        }

        Ok(())
    }

    fn seen(&self, outbound: bool) {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));

        if outbound {
            self.set_last_sent(d);
        } else {
            self.set_last_received(d);
        }
    }

    async fn write_to(&self, raw: &[u8], dst: &(dyn Candidate + Send + Sync)) -> Result<usize> {
        let n = if let Some(conn) = &self.conn {
            let addr = dst.addr();
            conn.send_to(raw, addr).await?
        } else {
            return Err(Error::ErrSendPacket);
        };
        self.seen(true);
        Ok(n)
    }

    /// Used to compare two candidateBases.
    fn equal(&self, other: &dyn Candidate) -> bool {
        self.network_type() == other.network_type()
            && self.candidate_type() == other.candidate_type()
            && self.address() == other.address()
            && self.port() == other.port()
            && self.related_address() == other.related_address()
    }

    fn redundant_with(&self, other: &dyn Candidate) -> bool {
        self.addr() == other.addr() && self.base_addr() == other.base_addr()
    }

    fn get_conn(&self) -> Option<&Arc<dyn util::Conn + Send + Sync>> {
        self.conn.as_ref()
    }

    fn owns_conn(&self) -> bool {
        self.owns_conn
    }

    fn get_closed_ch(&self) -> Arc<Mutex<Option<broadcast::Sender<()>>>> {
        self.closed_ch.clone()
    }
}

impl CandidateBase {
    pub fn set_last_received(&self, d: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_received
            .store(d.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_last_sent(&self, d: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_sent.store(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl CandidateBaseConfig {
    /// Shared plumbing for the per-kind constructors.
    pub(crate) fn build(
        self,
        candidate_type: CandidateType,
        related_address: Option<CandidateRelatedAddress>,
        server: Option<String>,
        base_addr: Option<SocketAddr>,
        owns_conn: bool,
    ) -> Result<CandidateBase> {
        let ip: IpAddr = self.address.parse()?;
        let network_type = determine_network_type(&self.network, &ip)?;

        let id = if self.candidate_id.is_empty() {
            generate_cand_id()
        } else {
            self.candidate_id
        };

        let resolved = create_addr(network_type, ip, self.port);
        let local_preference = self.local_preference.unwrap_or(DEFAULT_LOCAL_PREFERENCE);

        Ok(CandidateBase {
            id,
            network_type: AtomicU8::new(network_type as u8),
            candidate_type,

            component_id: AtomicU16::new(self.component_id),
            address: self.address,
            port: self.port,
            related_address,
            server,

            resolved_addr: SyncMutex::new(resolved),
            base_addr: SyncMutex::new(base_addr.unwrap_or(resolved)),

            foundation_override: SyncMutex::new(self.foundation),
            priority_override: AtomicU32::new(self.priority),
            local_preference,

            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),

            conn: self.conn,
            owns_conn,
            closed_ch: Arc::new(Mutex::new(None)),
        })
    }
}

/// Derives the local preference of a host address when the agent owns more
/// than one: IPv6 over IPv4, link-local above global, 0 for VPN interfaces.
pub fn derive_local_preference(ip: &IpAddr, vpn: bool) -> u16 {
    if vpn {
        return 0;
    }

    match ip {
        IpAddr::V6(v6) => {
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                DEFAULT_LOCAL_PREFERENCE
            } else {
                DEFAULT_LOCAL_PREFERENCE - 1
            }
        }
        IpAddr::V4(v4) => {
            if v4.is_link_local() {
                DEFAULT_LOCAL_PREFERENCE - 2
            } else {
                DEFAULT_LOCAL_PREFERENCE - 3
            }
        }
    }
}

/// One remote candidate as exchanged at the offer/answer boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    pub foundation: String,
    pub component_id: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: CandidateType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_port: Option<u16>,
}

impl CandidateDescriptor {
    /// Captures a local candidate for the wire.
    pub fn from_candidate(c: &dyn Candidate) -> Self {
        let related = c.related_address();
        Self {
            foundation: c.foundation(),
            component_id: c.component_id(),
            transport: c.network_type().network_short(),
            priority: c.priority(),
            address: c.address(),
            port: c.port(),
            kind: c.candidate_type(),
            rel_addr: related.as_ref().map(|r| r.address.clone()),
            rel_port: related.as_ref().map(|r| r.port),
        }
    }

    /// Builds the peer-reported candidate this descriptor describes.
    /// Remote candidates never own sockets.
    pub fn to_remote_candidate(&self) -> Result<CandidateBase> {
        if !self.transport.eq_ignore_ascii_case("udp") {
            return Err(Error::ErrProtoType);
        }

        let base_config = CandidateBaseConfig {
            network: self.transport.to_lowercase(),
            address: self.address.clone(),
            port: self.port,
            component_id: self.component_id,
            priority: self.priority,
            foundation: self.foundation.clone(),
            ..CandidateBaseConfig::default()
        };

        let related = match (&self.rel_addr, self.rel_port) {
            (Some(addr), Some(port)) => Some(CandidateRelatedAddress {
                address: addr.clone(),
                port,
            }),
            _ => None,
        };

        match self.kind {
            CandidateType::Host => base_config.build(CandidateType::Host, None, None, None, false),
            CandidateType::ServerReflexive => {
                base_config.build(CandidateType::ServerReflexive, related, None, None, false)
            }
            CandidateType::PeerReflexive => {
                base_config.build(CandidateType::PeerReflexive, related, None, None, false)
            }
            CandidateType::Relay => {
                base_config.build(CandidateType::Relay, related, None, None, false)
            }
            CandidateType::Unspecified => Err(Error::ErrUnknownCandidateType),
        }
    }
}

/// Creates a Candidate from its string representation.
pub fn unmarshal_candidate(raw: &str) -> Result<CandidateBase> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    let foundation = split[0].to_owned();
    let component_id: u16 = split[1].parse().map_err(|_| Error::ErrParseComponent)?;
    let network = split[2].to_owned();
    let priority: u32 = split[3].parse().map_err(|_| Error::ErrParsePriority)?;
    let address = split[4].to_owned();
    let port: u16 = split[5].parse().map_err(|_| Error::ErrParsePort)?;
    let typ = split[7];

    if !network.eq_ignore_ascii_case("udp") {
        return Err(Error::ErrProtoType);
    }

    let mut rel_addr = None;
    let mut rel_port = None;

    if split.len() > 8 {
        let split2 = &split[8..];

        if split2[0] == "raddr" {
            if split2.len() < 4 {
                return Err(Error::Other(format!(
                    "{:?}: incorrect length",
                    Error::ErrParseRelatedAddr
                )));
            }

            rel_addr = Some(split2[1].to_owned());
            rel_port = Some(split2[3].parse().map_err(|_| Error::ErrParsePort)?);
        }
    }

    let kind = match typ {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        _ => {
            return Err(Error::Other(format!(
                "{:?} ({})",
                Error::ErrUnknownCandidateType,
                typ
            )))
        }
    };

    let descriptor = CandidateDescriptor {
        foundation,
        component_id,
        transport: network,
        priority,
        address,
        port,
        kind,
        rel_addr,
        rel_port,
    };

    descriptor.to_remote_candidate()
}
