use super::*;
use crate::candidate::candidate_base::{CandidateBase, CandidateBaseConfig};
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::{CandidatePairState, COMPONENT_RTCP, COMPONENT_RTP};
use crate::checklist::DEFAULT_MAX_CHECK_LIST_SIZE;

fn host(address: &str, port: u16, component_id: u16) -> CandidateBase {
    CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: address.to_owned(),
            port,
            component_id,
            ..Default::default()
        },
    }
    .new_candidate_host()
    .unwrap()
}

fn pair(local_port: u16, component_id: u16) -> Arc<CandidatePair> {
    Arc::new(CandidatePair::new(
        Arc::new(host("10.0.0.1", local_port, component_id)),
        Arc::new(host("10.0.0.2", local_port, component_id)),
        true,
    ))
}

#[test]
fn test_component_creation_rules() {
    let stream = IceMediaStream::new("audio", DEFAULT_MAX_CHECK_LIST_SIZE, EventBus::new());

    assert!(stream.create_component(COMPONENT_RTP).is_ok());
    assert_eq!(
        stream.create_component(COMPONENT_RTP).unwrap_err(),
        Error::ErrComponentAlreadyExists
    );
    assert_eq!(
        stream.create_component(0).unwrap_err(),
        Error::ErrComponentIdOutOfRange
    );
    assert_eq!(
        stream.create_component(257).unwrap_err(),
        Error::ErrComponentIdOutOfRange
    );

    assert!(stream.get_component(COMPONENT_RTP).is_some());
    assert!(stream.get_component(COMPONENT_RTCP).is_none());
}

#[test]
fn test_valid_list_coverage() {
    let stream = IceMediaStream::new("audio", DEFAULT_MAX_CHECK_LIST_SIZE, EventBus::new());
    stream.create_component(COMPONENT_RTP).unwrap();
    stream.create_component(COMPONENT_RTCP).unwrap();

    let rtp_pair = pair(4000, COMPONENT_RTP);
    rtp_pair.local.set_component_id(COMPONENT_RTP);
    stream.add_to_valid_list(rtp_pair.clone());
    assert!(rtp_pair.validated());
    assert!(!stream.valid_list_covers_components(), "RTCP uncovered");

    let rtcp_pair = pair(4001, COMPONENT_RTCP);
    rtcp_pair.local.set_component_id(COMPONENT_RTCP);
    stream.add_to_valid_list(rtcp_pair);
    assert!(stream.valid_list_covers_components());

    // Re-adding the same pair must not duplicate the list.
    stream.add_to_valid_list(rtp_pair);
    assert_eq!(stream.valid_list().len(), 2);
}

#[test]
fn test_maybe_complete_requires_all_components_nominated() {
    let stream = IceMediaStream::new("audio", DEFAULT_MAX_CHECK_LIST_SIZE, EventBus::new());
    stream.create_component(COMPONENT_RTP).unwrap();

    let p = pair(4000, COMPONENT_RTP);
    p.local.set_component_id(COMPONENT_RTP);
    p.set_state(CandidatePairState::Waiting);
    p.set_state(CandidatePairState::InProgress);
    p.set_state(CandidatePairState::Succeeded);
    stream.add_to_valid_list(p.clone());

    assert!(!stream.maybe_complete(), "nothing nominated yet");

    p.nominated.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(stream.maybe_complete());
    assert_eq!(stream.check_list().state(), CheckListState::Completed);

    // Idempotent: the list is already terminal.
    assert!(!stream.maybe_complete());
}

#[test]
fn test_valid_foundations() {
    let stream = IceMediaStream::new("audio", DEFAULT_MAX_CHECK_LIST_SIZE, EventBus::new());
    stream.create_component(COMPONENT_RTP).unwrap();

    let p = pair(4000, COMPONENT_RTP);
    p.local.set_foundation("3");
    p.remote.set_foundation("8");
    stream.add_to_valid_list(p);

    let foundations = stream.valid_foundations();
    assert!(foundations.contains("38"));
    assert_eq!(foundations.len(), 1);
}
