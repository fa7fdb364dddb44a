use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::time::{sleep, Duration};

use super::agent_config::AgentConfig;
use super::*;
use crate::candidate::candidate_base::{CandidateBase, CandidateBaseConfig};
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::CandidateRelayConfig;
use crate::candidate::{CandidateType, COMPONENT_RTP};
use crate::nomination::NominationStrategy;

fn host_candidate(address: &str, port: u16) -> CandidateBase {
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
    .unwrap()
}

#[test]
fn test_agent_credentials() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let (ufrag, pwd) = agent.get_local_user_credentials();
    assert!((4..=256).contains(&ufrag.len()));
    assert!((22..=256).contains(&pwd.len()));

    assert_eq!(
        Agent::new(AgentConfig {
            local_ufrag: "ab".to_owned(),
            ..Default::default()
        })
        .err(),
        Some(Error::ErrLocalUfragInsufficientBits)
    );
    assert_eq!(
        Agent::new(AgentConfig {
            local_pwd: "tooshort".to_owned(),
            ..Default::default()
        })
        .err(),
        Some(Error::ErrLocalPwdInsufficientBits)
    );

    Ok(())
}

#[tokio::test]
async fn test_start_requires_remote_credentials() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;

    assert_eq!(
        agent
            .start_connectivity_establishment("", "pwd")
            .await
            .err(),
        Some(Error::ErrRemoteUfragEmpty)
    );
    assert_eq!(
        agent
            .start_connectivity_establishment("frag", "")
            .await
            .err(),
        Some(Error::ErrRemotePwdEmpty)
    );
    assert_eq!(agent.processing_state(), ProcessingState::Waiting);

    // First real call flips to Running; the second is a no-op.
    agent
        .start_connectivity_establishment("frag", "somepassword")
        .await?;
    assert_eq!(agent.processing_state(), ProcessingState::Running);
    agent
        .start_connectivity_establishment("other", "ignored")
        .await?;
    let ufrag_pwd = agent.internal.ufrag_pwd.lock();
    assert_eq!(ufrag_pwd.remote_ufrag, "frag");

    Ok(())
}

#[tokio::test]
async fn test_incoming_check_before_start_is_queued() -> Result<()> {
    let agent = Agent::new(AgentConfig {
        is_controlling: false,
        ..Default::default()
    })?;
    let stream = agent.create_media_stream("audio")?;
    let component = agent.create_component("audio", COMPONENT_RTP)?;

    let local: Arc<dyn Candidate + Send + Sync> =
        Arc::new(host_candidate("127.0.0.1", 41000));
    component.add_local_candidate(local.clone(), &agent.internal.foundations);

    // A source we never learned about via offer/answer.
    let unknown = SocketAddr::from_str("127.0.0.7:7777").unwrap();
    agent
        .internal
        .incoming_check_received(stream.clone(), local, unknown, 12345, false)
        .await;

    let remote = component
        .find_remote_candidate(unknown)
        .expect("peer-reflexive remote candidate missing");
    assert_eq!(remote.candidate_type(), CandidateType::PeerReflexive);
    assert_eq!(remote.priority(), 12345);

    // Checks have not started: the trigger waits in the replay queue.
    assert_eq!(agent.internal.pre_discovered_pairs.lock().len(), 1);
    assert_eq!(stream.check_list().triggered_len(), 0);

    Ok(())
}

#[tokio::test]
async fn test_relayed_nomination_debounce() -> Result<()> {
    let agent = Agent::new(AgentConfig {
        is_controlling: true,
        nomination_strategy: NominationStrategy::NominateFirstHostOrReflexiveValid,
        ..Default::default()
    })?;
    let stream = agent.create_media_stream("audio")?;
    stream.create_component(COMPONENT_RTP)?;

    let relay: Arc<dyn Candidate + Send + Sync> = Arc::new(
        CandidateRelayConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: "198.51.100.1".to_owned(),
                port: 50000,
                component_id: COMPONENT_RTP,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_relay()?,
    );
    let remote: Arc<dyn Candidate + Send + Sync> =
        Arc::new(host_candidate("127.0.0.2", 40000));

    let relayed_pair = Arc::new(CandidatePair::new(relay, remote.clone(), true));
    stream.add_to_valid_list(relayed_pair.clone());

    // The relayed pair validates first: a debounce window opens.
    agent
        .internal
        .pair_validated_policy(&stream, &relayed_pair)
        .await;
    assert!(agent
        .internal
        .relayed_debounce
        .is_armed("audio", COMPONENT_RTP));
    assert!(!relayed_pair.nominated());

    // A better pair validates inside the window: it wins, the timer dies.
    let better_pair = Arc::new(CandidatePair::new(
        Arc::new(host_candidate("127.0.0.1", 42000)),
        remote,
        true,
    ));
    stream.add_to_valid_list(better_pair.clone());
    agent
        .internal
        .pair_validated_policy(&stream, &better_pair)
        .await;

    assert!(!agent
        .internal
        .relayed_debounce
        .is_armed("audio", COMPONENT_RTP));
    assert!(better_pair.nominated());

    // Even after the window would have fired, the relayed pair stays out.
    sleep(Duration::from_millis(900)).await;
    assert!(!relayed_pair.nominated());

    Ok(())
}

#[tokio::test]
async fn test_nomination_confirmed_selects_at_most_once() -> Result<()> {
    let agent = Agent::new(AgentConfig::default())?;
    let stream = agent.create_media_stream("audio")?;
    let component = stream.create_component(COMPONENT_RTP)?;

    let first = Arc::new(CandidatePair::new(
        Arc::new(host_candidate("127.0.0.1", 43000)),
        Arc::new(host_candidate("127.0.0.2", 43000)),
        true,
    ));
    let second = Arc::new(CandidatePair::new(
        Arc::new(host_candidate("127.0.0.1", 43002)),
        Arc::new(host_candidate("127.0.0.2", 43002)),
        true,
    ));

    agent.internal.nomination_confirmed(&stream, &first).await;
    agent.internal.nomination_confirmed(&stream, &first).await;
    agent.internal.nomination_confirmed(&stream, &second).await;

    let selected = component.selected_pair().unwrap();
    assert!(*selected == *first, "first confirmation wins, once");
    assert!(first.nominated());

    // A nominated pair is always in the valid list.
    assert!(stream.valid_list().iter().any(|p| **p == *first));

    Ok(())
}
