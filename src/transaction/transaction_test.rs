use std::net::IpAddr;

use stun::error_code::CODE_ROLE_CONFLICT;
use tokio_test::assert_ok;
use util::vnet::net::{Net, NetConfig};

use super::*;

fn spec(use_candidate: bool, role: Role) -> BindingRequestSpec {
    BindingRequestSpec {
        username: "RFrag:LFrag".to_owned(),
        integrity_key: "RPass".to_owned(),
        priority: 1_845_501_695,
        role,
        tie_breaker: 42,
        use_candidate,
    }
}

#[test]
fn test_build_binding_request_attributes() -> Result<()> {
    let config = StunConfig::default();
    let msg = build_binding_request(&config, &spec(true, Role::Controlling))?;

    assert_eq!(msg.typ, BINDING_REQUEST);
    assert!(msg.contains(ATTR_USERNAME));
    assert!(msg.contains(ATTR_PRIORITY));
    assert!(msg.contains(ATTR_USE_CANDIDATE));
    assert!(msg.contains(ATTR_ICE_CONTROLLING));
    assert!(!msg.contains(ATTR_ICE_CONTROLLED));
    assert!(msg.contains(ATTR_SOFTWARE));
    assert!(msg.contains(ATTR_MESSAGE_INTEGRITY));
    assert!(msg.contains(ATTR_FINGERPRINT));

    let mut priority = PriorityAttr::default();
    priority.get_from(&msg)?;
    assert_eq!(priority.0, 1_845_501_695);

    Ok(())
}

#[test]
fn test_build_binding_request_controlled_without_nomination() -> Result<()> {
    let config = StunConfig::default();
    let msg = build_binding_request(&config, &spec(false, Role::Controlled))?;

    assert!(!msg.contains(ATTR_USE_CANDIDATE));
    assert!(msg.contains(ATTR_ICE_CONTROLLED));
    assert!(!msg.contains(ATTR_ICE_CONTROLLING));

    Ok(())
}

#[test]
fn test_build_binding_success_echoes_username_and_source() -> Result<()> {
    let config = StunConfig::default();
    let req = build_binding_request(&config, &spec(false, Role::Controlling))?;

    let mapped: SocketAddr = "203.0.113.1:55000".parse()?;
    let resp = build_binding_success(&config, &req, mapped, "LPass")?;

    assert_eq!(resp.typ, BINDING_SUCCESS);
    assert_eq!(resp.transaction_id, req.transaction_id);

    let mut xor_addr = XorMappedAddress::default();
    xor_addr.get_from(&resp)?;
    assert_eq!(xor_addr.ip, mapped.ip());
    assert_eq!(xor_addr.port, mapped.port());

    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(&resp)?;
    assert_eq!(username.to_string(), "RFrag:LFrag");

    Ok(())
}

#[test]
fn test_build_binding_error_role_conflict() -> Result<()> {
    let config = StunConfig::default();
    let req = build_binding_request(&config, &spec(false, Role::Controlling))?;

    let resp = build_binding_error(&config, &req, CODE_ROLE_CONFLICT, Some("LPass"))?;
    assert_eq!(resp.typ, BINDING_ERROR);
    assert!(resp.contains(ATTR_MESSAGE_INTEGRITY));

    let mut code = ErrorCodeAttribute::default();
    code.get_from(&resp)?;
    assert_eq!(code.code.0, CODE_ROLE_CONFLICT.0);

    Ok(())
}

#[test]
fn test_build_binding_indication_is_credential_free() -> Result<()> {
    let config = StunConfig::default();
    let msg = build_binding_indication(&config)?;

    assert_eq!(msg.typ.method, METHOD_BINDING);
    assert_eq!(msg.typ.class, CLASS_INDICATION);
    assert!(!msg.contains(ATTR_MESSAGE_INTEGRITY));
    assert!(!msg.contains(ATTR_USERNAME));
    assert!(msg.contains(ATTR_FINGERPRINT));

    Ok(())
}

#[tokio::test]
async fn test_transaction_retransmits_until_timeout() -> Result<()> {
    // Virtual network: loopback traffic stays in memory, no OS sockets.
    let net = Net::new(Some(NetConfig::default()));
    let sender = net
        .bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0))
        .await?;
    let receiver = net
        .bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0))
        .await?;
    let to = receiver.local_addr()?;

    let transactions = StunTransactions::new(MIN_INITIAL_RTO, Duration::from_millis(200), 2);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(4);

    let config = StunConfig::default();
    let msg = build_binding_request(&config, &spec(false, Role::Controlling))?;
    transactions
        .send_request(sender, msg.transaction_id, msg.raw.clone(), to, outcome_tx)
        .await?;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions.destination(&msg.transaction_id), Some(to));

    // initial send + 2 retransmissions, then a Timeout outcome.
    let outcome = outcome_rx.recv().await.unwrap();
    match outcome {
        TransactionOutcome::Timeout { id } => assert_eq!(id, msg.transaction_id),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(transactions.len(), 0);

    let mut buf = vec![0_u8; 1500];
    let mut copies = 0;
    while let Ok(result) =
        tokio::time::timeout(Duration::from_millis(50), receiver.recv_from(&mut buf)).await
    {
        result?;
        copies += 1;
    }
    assert_eq!(copies, 3, "one initial send plus two retransmissions");

    Ok(())
}

#[tokio::test]
async fn test_transaction_completes_with_rtt() -> Result<()> {
    let net = Net::new(Some(NetConfig::default()));
    let sender = net
        .bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0))
        .await?;
    let receiver = net
        .bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0))
        .await?;
    let to = receiver.local_addr()?;
    let local = sender.local_addr()?;

    let transactions =
        StunTransactions::new(Duration::from_millis(500), Duration::from_millis(1600), 6);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(4);

    let config = StunConfig::default();
    let msg = build_binding_request(&config, &spec(false, Role::Controlling))?;
    assert_ok!(
        transactions
            .send_request(
                sender,
                msg.transaction_id,
                msg.raw.clone(),
                to,
                outcome_tx.clone(),
            )
            .await
    );

    let response = build_binding_success(&config, &msg, local, "LPass")?;
    assert!(
        transactions
            .complete(response, to, local, &outcome_tx)
            .await
    );

    match outcome_rx.recv().await.unwrap() {
        TransactionOutcome::Response { id, from, rtt, .. } => {
            assert_eq!(id, msg.transaction_id);
            assert_eq!(from, to);
            assert!(rtt < Duration::from_secs(1));
        }
        other => panic!("expected response, got {:?}", other),
    }

    // A second response for the same id is unknown by now.
    let response = build_binding_success(&config, &msg, local, "LPass")?;
    assert!(
        !transactions
            .complete(response, to, local, &outcome_tx)
            .await
    );

    Ok(())
}

#[tokio::test]
async fn test_transaction_cancel_is_silent() -> Result<()> {
    let net = Net::new(Some(NetConfig::default()));
    let sender = net
        .bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 0))
        .await?;
    let to: SocketAddr = "127.0.0.1:9".parse()?;

    let transactions = StunTransactions::new(MIN_INITIAL_RTO, Duration::from_millis(200), 2);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(4);

    let config = StunConfig::default();
    let msg = build_binding_request(&config, &spec(false, Role::Controlling))?;
    transactions
        .send_request(sender, msg.transaction_id, msg.raw.clone(), to, outcome_tx)
        .await?;

    transactions.cancel(&msg.transaction_id);
    assert_eq!(transactions.len(), 0);

    // No outcome may surface for a cancelled transaction.
    let got = tokio::time::timeout(Duration::from_millis(500), outcome_rx.recv()).await;
    assert!(got.is_err(), "cancelled transaction must stay silent");

    Ok(())
}
