use std::net::SocketAddr;
use std::str::FromStr;

use super::*;
use crate::candidate::candidate_base::{CandidateBase, CandidateBaseConfig};
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;
use crate::candidate::COMPONENT_RTP;
use crate::error::Result;

fn host(address: &str, port: u16, component_id: u16, foundation: &str) -> Result<CandidateBase> {
    CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: address.to_owned(),
            port,
            component_id,
            foundation: foundation.to_owned(),
            ..Default::default()
        },
    }
    .new_candidate_host()
}

fn remote(address: &str, port: u16, component_id: u16, foundation: &str) -> Result<CandidateBase> {
    host(address, port, component_id, foundation)
}

fn new_list(max_size: usize) -> CheckList {
    CheckList::new("audio", max_size, EventBus::new())
}

fn pair_of(
    list: &CheckList,
    local: CandidateBase,
    remote: CandidateBase,
) -> Arc<CandidatePair> {
    let pair = Arc::new(CandidatePair::new(
        Arc::new(local),
        Arc::new(remote),
        true,
    ));
    assert!(list.add_pair(pair.clone()));
    pair
}

#[test]
fn test_add_pair_sorted_and_deduped() -> Result<()> {
    let list = new_list(10);

    let relay_local = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.9".to_owned(),
            port: 4444,
            component_id: COMPONENT_RTP,
            foundation: "9".to_owned(),
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_server_reflexive()?;

    let low = Arc::new(CandidatePair::new(
        Arc::new(relay_local),
        Arc::new(remote("10.0.0.2", 4000, COMPONENT_RTP, "r")?),
        true,
    ));
    let high = Arc::new(CandidatePair::new(
        Arc::new(host("10.0.0.1", 4000, COMPONENT_RTP, "1")?),
        Arc::new(remote("10.0.0.2", 4000, COMPONENT_RTP, "r")?),
        true,
    ));

    assert!(list.add_pair(low.clone()));
    assert!(list.add_pair(high.clone()));
    assert!(!list.add_pair(high.clone()), "duplicate must be refused");

    let pairs = list.pairs();
    assert_eq!(pairs.len(), 2);
    assert!(pairs[0].priority() >= pairs[1].priority(), "descending order");

    Ok(())
}

#[test]
fn test_capacity_cap() -> Result<()> {
    let list = new_list(2);

    for port in 4000..4005 {
        let pair = Arc::new(CandidatePair::new(
            Arc::new(host("10.0.0.1", port, COMPONENT_RTP, "1")?),
            Arc::new(remote("10.0.0.2", port, COMPONENT_RTP, "r")?),
            true,
        ));
        list.add_pair(pair);
    }

    assert_eq!(list.len(), 2, "list must stay within its cap");

    Ok(())
}

#[test]
fn test_form_pairs_replaces_srflx_with_base() -> Result<()> {
    let list = new_list(10);

    let base = host("10.0.0.1", 40000, COMPONENT_RTP, "1")?;
    let base_addr = base.addr();

    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.1".to_owned(),
            port: 55000,
            component_id: COMPONENT_RTP,
            foundation: "2".to_owned(),
            ..Default::default()
        },
        base_addr: Some(base_addr),
        ..Default::default()
    }
    .new_candidate_server_reflexive()?;

    // The host owns a conn in production; form_pairs only compares addresses
    // and ownership, and a host candidate without a conn still owns "itself".
    let locals: Vec<Arc<dyn Candidate + Send + Sync>> =
        vec![Arc::new(base), Arc::new(srflx)];
    let remotes: Vec<Arc<dyn Candidate + Send + Sync>> =
        vec![Arc::new(remote("10.0.0.2", 40000, COMPONENT_RTP, "r")?)];

    list.form_pairs(&locals, &remotes, true);

    // host x remote and srflx x remote collapse into a single host-based pair.
    assert_eq!(list.len(), 1);
    let only = &list.pairs()[0];
    assert_eq!(only.local.addr(), base_addr);

    Ok(())
}

#[test]
fn test_initial_states_one_waiting_per_foundation() -> Result<()> {
    let list = new_list(10);

    // Two foundations; the second foundation has components 1 and 2.
    let p1 = pair_of(
        &list,
        host("10.0.0.1", 4000, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4000, COMPONENT_RTP, "x")?,
    );
    let p2 = pair_of(
        &list,
        host("10.0.0.2", 4001, 2, "b")?,
        remote("10.0.0.9", 4001, 2, "x")?,
    );
    let p3 = pair_of(
        &list,
        host("10.0.0.2", 4002, COMPONENT_RTP, "b")?,
        remote("10.0.0.9", 4002, COMPONENT_RTP, "x")?,
    );

    list.compute_initial_states();

    assert_eq!(p1.state(), CandidatePairState::Waiting);
    assert_eq!(
        p3.state(),
        CandidatePairState::Waiting,
        "lowest component id of its foundation group"
    );
    assert_eq!(p2.state(), CandidatePairState::Frozen);

    Ok(())
}

#[test]
fn test_unfreeze_foundation() -> Result<()> {
    let list = new_list(10);

    let p1 = pair_of(
        &list,
        host("10.0.0.1", 4000, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4000, COMPONENT_RTP, "x")?,
    );
    let p2 = pair_of(
        &list,
        host("10.0.0.2", 4001, COMPONENT_RTP, "b")?,
        remote("10.0.0.9", 4001, COMPONENT_RTP, "x")?,
    );

    list.unfreeze_foundation(&p1.foundation());
    assert_eq!(p1.state(), CandidatePairState::Waiting);
    assert_eq!(p2.state(), CandidatePairState::Frozen);

    // No two pairs sharing a foundation stay Frozen once one succeeded.
    let mut set = HashSet::new();
    set.insert(p2.foundation());
    assert_eq!(list.unfreeze_foundations(&set), 1);
    assert_eq!(p2.state(), CandidatePairState::Waiting);

    Ok(())
}

#[test]
fn test_next_pair_prefers_triggered_fifo() -> Result<()> {
    let list = new_list(10);

    let ordinary = pair_of(
        &list,
        host("10.0.0.1", 4000, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4000, COMPONENT_RTP, "x")?,
    );
    let triggered = pair_of(
        &list,
        host("10.0.0.2", 4001, COMPONENT_RTP, "b")?,
        remote("10.0.0.9", 4001, COMPONENT_RTP, "x")?,
    );

    list.set_pair_state(&ordinary, CandidatePairState::Waiting);
    list.schedule_triggered(triggered.clone());
    list.schedule_triggered(triggered.clone()); // dedupe
    assert_eq!(list.triggered_len(), 1);

    let first = list.next_pair().unwrap();
    assert!(*first == *triggered, "triggered check jumps the queue");

    let second = list.next_pair().unwrap();
    assert!(*second == *ordinary);

    Ok(())
}

#[test]
fn test_next_pair_frozen_fallback_respects_busy_foundations() -> Result<()> {
    let list = new_list(10);

    let busy = pair_of(
        &list,
        host("10.0.0.1", 4000, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4000, COMPONENT_RTP, "x")?,
    );
    let frozen_same_foundation = pair_of(
        &list,
        host("10.0.0.1", 4001, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4001, COMPONENT_RTP, "x")?,
    );
    let frozen_other = pair_of(
        &list,
        host("10.0.0.2", 4002, COMPONENT_RTP, "b")?,
        remote("10.0.0.9", 4002, COMPONENT_RTP, "x")?,
    );

    list.set_pair_state(&busy, CandidatePairState::Waiting);
    list.set_pair_state(&busy, CandidatePairState::InProgress);

    let next = list.next_pair().unwrap();
    assert!(
        *next == *frozen_other,
        "frozen pair sharing a busy foundation must wait"
    );
    let _ = frozen_same_foundation;

    Ok(())
}

#[test]
fn test_all_terminated_and_state_transitions() -> Result<()> {
    let list = new_list(10);
    assert!(!list.all_terminated(), "empty list is not terminated");

    let pair = pair_of(
        &list,
        host("10.0.0.1", 4000, COMPONENT_RTP, "a")?,
        remote("10.0.0.9", 4000, COMPONENT_RTP, "x")?,
    );
    list.set_pair_state(&pair, CandidatePairState::Waiting);
    list.set_pair_state(&pair, CandidatePairState::InProgress);
    assert!(!list.all_terminated());
    list.set_pair_state(&pair, CandidatePairState::Failed);
    assert!(list.all_terminated());

    assert!(list.set_state(CheckListState::Failed));
    assert!(
        !list.set_state(CheckListState::Completed),
        "terminal list state must not change"
    );

    Ok(())
}
