use std::net::SocketAddr;
use std::str::FromStr;

use super::candidate_base::*;
use super::candidate_host::CandidateHostConfig;
use super::candidate_server_reflexive::CandidateServerReflexiveConfig;
use super::*;
use crate::error::Result;

#[test]
fn test_candidate_priority() -> Result<()> {
    let tests: Vec<(CandidateBase, u32)> = vec![
        (
            CandidateHostConfig {
                base_config: CandidateBaseConfig {
                    network: "udp".to_owned(),
                    address: "10.0.0.1".to_owned(),
                    port: 1234,
                    component_id: COMPONENT_RTP,
                    ..Default::default()
                },
            }
            .new_candidate_host()?,
            (126 << 24) + (65535 << 8) + 255,
        ),
        (
            CandidateServerReflexiveConfig {
                base_config: CandidateBaseConfig {
                    network: "udp".to_owned(),
                    address: "203.0.113.1".to_owned(),
                    port: 5678,
                    component_id: COMPONENT_RTCP,
                    ..Default::default()
                },
                ..Default::default()
            }
            .new_candidate_server_reflexive()?,
            (100 << 24) + (65535 << 8) + 254,
        ),
    ];

    for (candidate, want) in tests {
        assert_eq!(
            candidate.priority(),
            want,
            "Candidate({}).priority() mismatch",
            candidate
        );
    }

    Ok(())
}

#[test]
fn test_type_preference_ordering() {
    // Host > PeerReflexive > ServerReflexive > Relay must hold strictly.
    assert!(CandidateType::Host.preference() > CandidateType::PeerReflexive.preference());
    assert!(
        CandidateType::PeerReflexive.preference() > CandidateType::ServerReflexive.preference()
    );
    assert!(CandidateType::ServerReflexive.preference() > CandidateType::Relay.preference());
}

#[test]
fn test_default_preference_ordering() {
    let nt = NetworkType::Udp4;
    assert!(
        CandidateType::Relay.default_preference(nt)
            > CandidateType::ServerReflexive.default_preference(nt)
    );
    assert!(
        CandidateType::ServerReflexive.default_preference(nt)
            > CandidateType::Host.default_preference(nt)
    );
    assert!(
        CandidateType::Host.default_preference(NetworkType::Udp4)
            > CandidateType::Host.default_preference(NetworkType::Udp6)
    );
    assert!(
        CandidateType::Host.default_preference(NetworkType::Udp6)
            > CandidateType::PeerReflexive.default_preference(nt)
    );
}

#[test]
fn test_candidate_marshal_round_trip() -> Result<()> {
    let candidate = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.5".to_owned(),
            port: 40000,
            component_id: COMPONENT_RTP,
            foundation: "4".to_owned(),
            ..Default::default()
        },
        rel_addr: "10.0.0.5".to_owned(),
        rel_port: 41000,
        ..Default::default()
    }
    .new_candidate_server_reflexive()?;

    let line = candidate.marshal();
    let parsed = unmarshal_candidate(&line)?;

    assert_eq!(parsed.candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(parsed.address(), "203.0.113.5");
    assert_eq!(parsed.port(), 40000);
    assert_eq!(parsed.foundation(), "4");
    assert_eq!(
        parsed.related_address(),
        Some(CandidateRelatedAddress {
            address: "10.0.0.5".to_owned(),
            port: 41000,
        })
    );

    Ok(())
}

#[test]
fn test_unmarshal_rejects_tcp() {
    let result = unmarshal_candidate("1 1 tcp 2130706431 10.0.0.1 40000 typ host");
    assert!(result.is_err(), "TCP candidates are out of scope");
}

#[test]
fn test_unmarshal_rejects_short_line() {
    assert!(unmarshal_candidate("1 1 udp 123").is_err());
}

#[test]
fn test_descriptor_serde_round_trip() -> Result<()> {
    let descriptor = CandidateDescriptor {
        foundation: "2".to_owned(),
        component_id: 1,
        transport: "udp".to_owned(),
        priority: 2_130_706_431,
        address: "10.0.0.1".to_owned(),
        port: 40000,
        kind: CandidateType::Host,
        rel_addr: None,
        rel_port: None,
    };

    let json = serde_json::to_string(&descriptor).unwrap();
    let back: CandidateDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(descriptor, back);

    let remote = back.to_remote_candidate()?;
    assert_eq!(remote.priority(), 2_130_706_431);
    assert!(!remote.owns_conn(), "remote candidates never own sockets");

    Ok(())
}

#[test]
fn test_redundancy_requires_same_base() -> Result<()> {
    let host = CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "10.0.0.1".to_owned(),
            port: 40000,
            component_id: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host()?;

    let same_addr_same_base = CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "10.0.0.1".to_owned(),
            port: 40000,
            component_id: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host()?;

    let srflx_same_addr = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "10.0.0.1".to_owned(),
            port: 40000,
            component_id: COMPONENT_RTP,
            ..Default::default()
        },
        base_addr: Some(SocketAddr::from_str("10.0.0.9:40000").unwrap()),
        ..Default::default()
    }
    .new_candidate_server_reflexive()?;

    assert!(host.redundant_with(&same_addr_same_base));
    assert!(
        !host.redundant_with(&srflx_same_addr),
        "same address but different base is not redundant"
    );

    Ok(())
}

#[test]
fn test_derive_local_preference() {
    use std::net::IpAddr;

    let v6_link_local: IpAddr = "fe80::1".parse().unwrap();
    let v6_global: IpAddr = "2001:db8::1".parse().unwrap();
    let v4: IpAddr = "192.0.2.1".parse().unwrap();

    assert!(
        derive_local_preference(&v6_link_local, false) > derive_local_preference(&v6_global, false)
    );
    assert!(derive_local_preference(&v6_global, false) > derive_local_preference(&v4, false));
    assert_eq!(derive_local_preference(&v4, true), 0, "VPN flattens to zero");
}
