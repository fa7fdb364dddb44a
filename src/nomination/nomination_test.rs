use super::*;
use crate::candidate::candidate_base::{CandidateBase, CandidateBaseConfig};
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::CandidateRelayConfig;
use crate::candidate::COMPONENT_RTP;
use crate::error::Result;

fn host(address: &str, port: u16) -> Result<CandidateBase> {
    CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: address.to_owned(),
            port,
            component_id: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host()
}

fn host_pair() -> Result<Arc<CandidatePair>> {
    Ok(Arc::new(CandidatePair::new(
        Arc::new(host("10.0.0.1", 4000)?),
        Arc::new(host("10.0.0.2", 4000)?),
        true,
    )))
}

fn relayed_pair() -> Result<Arc<CandidatePair>> {
    let relay = CandidateRelayConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "198.51.100.1".to_owned(),
            port: 50000,
            component_id: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_relay()?;

    Ok(Arc::new(CandidatePair::new(
        Arc::new(relay),
        Arc::new(host("10.0.0.2", 4000)?),
        true,
    )))
}

#[test]
fn test_first_valid_nominates_immediately() -> Result<()> {
    let pair = host_pair()?;

    assert_eq!(
        on_pair_validated(NominationStrategy::NominateFirstValid, &pair, false),
        NominationDecision::Nominate
    );
    assert_eq!(
        on_pair_validated(NominationStrategy::NominateFirstValid, &pair, true),
        NominationDecision::Ignore
    );

    Ok(())
}

#[test]
fn test_deferred_strategies_ignore_validation() -> Result<()> {
    let pair = host_pair()?;

    for strategy in [
        NominationStrategy::None,
        NominationStrategy::NominateHighestPriority,
        NominationStrategy::NominateBestRtt,
    ] {
        assert_eq!(
            on_pair_validated(strategy, &pair, false),
            NominationDecision::Ignore,
            "{} must wait",
            strategy
        );
    }

    Ok(())
}

#[test]
fn test_host_or_reflexive_debounces_relayed() -> Result<()> {
    let strategy = NominationStrategy::NominateFirstHostOrReflexiveValid;

    assert_eq!(
        on_pair_validated(strategy, &*host_pair()?, false),
        NominationDecision::Nominate
    );
    assert_eq!(
        on_pair_validated(strategy, &*relayed_pair()?, false),
        NominationDecision::ArmRelayedTimer
    );

    Ok(())
}

#[test]
fn test_exhaustion_highest_priority() -> Result<()> {
    let low = relayed_pair()?;
    let high = host_pair()?;
    let validated = vec![low, high.clone()];

    let picked = on_list_exhausted(
        NominationStrategy::NominateHighestPriority,
        &validated,
        false,
    )
    .unwrap();
    assert!(*picked == *high);

    assert!(
        on_list_exhausted(NominationStrategy::NominateHighestPriority, &validated, true).is_none(),
        "a nominated component needs nothing more"
    );
    assert!(
        on_list_exhausted(NominationStrategy::NominateHighestPriority, &[], false).is_none(),
        "nothing validated, nothing to nominate"
    );

    Ok(())
}

#[test]
fn test_exhaustion_best_rtt() -> Result<()> {
    let slow = host_pair()?;
    slow.record_round_trip_time(Duration::from_millis(80));
    let fast = relayed_pair()?;
    fast.record_round_trip_time(Duration::from_millis(11));

    let validated = vec![slow, fast.clone()];
    let picked =
        on_list_exhausted(NominationStrategy::NominateBestRtt, &validated, false).unwrap();
    assert!(*picked == *fast, "smallest round-trip wins");

    Ok(())
}

#[test]
fn test_exhaustion_relayed_fallback() -> Result<()> {
    let relayed = relayed_pair()?;
    let validated = vec![relayed.clone()];

    let picked = on_list_exhausted(
        NominationStrategy::NominateFirstHostOrReflexiveValid,
        &validated,
        false,
    )
    .unwrap();
    assert!(
        *picked == *relayed,
        "with nothing but the relayed pair left it goes out immediately"
    );

    Ok(())
}

#[tokio::test]
async fn test_relayed_debounce_cancel_fires_closed_branch() {
    let debounce = RelayedDebounce::new(Duration::from_millis(800));

    let mut rx = debounce.arm("audio", COMPONENT_RTP).unwrap();
    assert!(debounce.is_armed("audio", COMPONENT_RTP));
    assert!(
        debounce.arm("audio", COMPONENT_RTP).is_none(),
        "arming is idempotent while pending"
    );

    // Cancelling drops the sender; the receiver resolves immediately.
    debounce.cancel("audio", COMPONENT_RTP);
    let cancelled = tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("closed channel must resolve fast");
    assert!(cancelled.is_none());
    assert!(!debounce.is_armed("audio", COMPONENT_RTP));
}
