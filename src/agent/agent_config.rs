use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use util::vnet::net::Net;

use crate::checklist::DEFAULT_MAX_CHECK_LIST_SIZE;
use crate::harvest::CandidateHarvester;
use crate::nomination::NominationStrategy;
use crate::transaction::{
    DEFAULT_INITIAL_RTO, DEFAULT_MAX_RETRANSMISSIONS, DEFAULT_MAX_RTO,
};

/// The base pacing interval between consecutive checks of one list (Ta).
pub(crate) const DEFAULT_TA: Duration = Duration::from_millis(20);

/// How long a terminated-but-incomplete check list waits for late successes.
pub(crate) const DEFAULT_CHECK_LIST_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Completed → Terminated delay; the window in which late peer traffic is
/// still answered before non-selected candidates are released.
pub(crate) const DEFAULT_TERMINATION_DELAY: Duration = Duration::from_millis(3000);

/// The interval used to keep selected pairs alive.
pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Which pairs the keep-alive task refreshes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepAliveStrategy {
    /// Only the component's selected pair (the default).
    SelectedOnly,
    /// Selected plus TCP pairs; degenerates to SelectedOnly in UDP-only scope.
    SelectedAndTcp,
    /// Every pair that reached Succeeded.
    AllSucceeded,
}

impl Default for KeepAliveStrategy {
    fn default() -> Self {
        Self::SelectedOnly
    }
}

impl fmt::Display for KeepAliveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::SelectedOnly => "SelectedOnly",
            Self::SelectedAndTcp => "SelectedAndTcp",
            Self::AllSucceeded => "AllSucceeded",
        };
        write!(f, "{}", s)
    }
}

/// Collects the arguments to `Agent` construction into a single structure,
/// for future-proofness of the interface.
pub struct AgentConfig {
    /// Global cap on check-list size, divided across the media streams.
    pub max_check_list_size: usize,

    /// Completed → Terminated grace.
    pub termination_delay: Duration,

    /// Whether the built-in host harvester participates in gathering.
    pub use_dynamic_host_harvester: bool,

    /// Pair keep-alive selection.
    pub keep_alive_strategy: KeepAliveStrategy,

    pub keep_alive_interval: Duration,

    /// Which validated pair gets nominated, and when.
    pub nomination_strategy: NominationStrategy,

    /// Expose a demuxing socket over all pairs of each component.
    pub use_component_socket: bool,

    /// Value of the STUN SOFTWARE attribute on every emitted message.
    pub software: String,

    /// Pacing base; the effective period is Ta times the number of active
    /// check lists.
    pub ta: Duration,

    /// How long a terminated check list without full valid-list coverage
    /// lingers before failing.
    pub check_list_grace_period: Duration,

    /// STUN retransmission schedule.
    pub initial_rto: Duration,
    pub max_rto: Duration,
    pub max_retransmissions: u16,

    pub is_controlling: bool,

    /// Local credentials; generated when empty.
    pub local_ufrag: String,
    pub local_pwd: String,

    /// Addresses the host harvester binds, in lieu of interface enumeration.
    pub local_addresses: Vec<IpAddr>,

    /// Port range for harvested sockets; zeroes mean any port.
    pub port_min: u16,
    pub port_max: u16,

    /// Additional harvesters (STUN, TURN, UPnP live outside this crate).
    pub harvesters: Vec<Arc<dyn CandidateHarvester>>,

    /// The network used to bind sockets; virtual networks are used in tests.
    pub net: Option<Arc<Net>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_check_list_size: DEFAULT_MAX_CHECK_LIST_SIZE,
            termination_delay: DEFAULT_TERMINATION_DELAY,
            use_dynamic_host_harvester: true,
            keep_alive_strategy: KeepAliveStrategy::default(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            nomination_strategy: NominationStrategy::default(),
            use_component_socket: true,
            software: "ice4j.org".to_owned(),
            ta: DEFAULT_TA,
            check_list_grace_period: DEFAULT_CHECK_LIST_GRACE_PERIOD,
            initial_rto: DEFAULT_INITIAL_RTO,
            max_rto: DEFAULT_MAX_RTO,
            max_retransmissions: DEFAULT_MAX_RETRANSMISSIONS,
            is_controlling: false,
            local_ufrag: String::new(),
            local_pwd: String::new(),
            local_addresses: vec![],
            port_min: 0,
            port_max: 0,
            harvesters: vec![],
            net: None,
        }
    }
}
