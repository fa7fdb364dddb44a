#[cfg(test)]
mod transaction_test;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::error_code::{ErrorCode, ErrorCodeAttribute};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{TextAttribute, Username};
use stun::xoraddr::XorMappedAddress;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;
use util::Conn;

use crate::control::{AttrControlled, AttrControlling, Role};
use crate::error::*;
use crate::priority::PriorityAttr;
use crate::use_candidate::UseCandidateAttr;

/// Floor on the configurable initial retransmission timeout.
pub const MIN_INITIAL_RTO: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_INITIAL_RTO: Duration = Duration::from_millis(250);
pub(crate) const DEFAULT_MAX_RTO: Duration = Duration::from_millis(1600);
// 6 retransmissions = 7 requests on the wire, the Rc of RFC 5389.
pub(crate) const DEFAULT_MAX_RETRANSMISSIONS: u16 = 6;

/// Process-wide STUN flags handed to the codec at agent construction.
/// FINGERPRINT is always emitted; SOFTWARE carries this string.
#[derive(Clone, Debug)]
pub struct StunConfig {
    pub software: String,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            software: "ice4j.org".to_owned(),
        }
    }
}

/// Resolves short-term credential keys for inbound and outbound messages.
pub trait CredentialsAuthority: Send + Sync {
    /// The key to verify inbound requests addressed to `username` (our side).
    fn local_key(&self, username: &str) -> Option<String>;
    /// The key to sign requests towards the peer of `media`.
    fn remote_key(&self, username: &str, media: &str) -> Option<String>;
}

/// Receives inbound Binding requests (the check server). Authentication is
/// the listener's job; unauthenticated requests are silently dropped there.
#[async_trait]
pub trait RequestListener: Send + Sync {
    async fn on_request(self: Arc<Self>, msg: Message, from: SocketAddr, local: SocketAddr);
}

/// Everything the check client needs to assemble an outgoing Binding request.
pub(crate) struct BindingRequestSpec {
    pub(crate) username: String,
    pub(crate) integrity_key: String,
    pub(crate) priority: u32,
    pub(crate) role: Role,
    pub(crate) tie_breaker: u64,
    pub(crate) use_candidate: bool,
}

pub(crate) fn build_binding_request(
    config: &StunConfig,
    spec: &BindingRequestSpec,
) -> Result<Message> {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(ATTR_USERNAME, spec.username.clone())),
        Box::new(PriorityAttr(spec.priority)),
    ];

    if spec.use_candidate {
        setters.push(Box::<UseCandidateAttr>::default());
    }

    match spec.role {
        Role::Controlling => setters.push(Box::new(AttrControlling(spec.tie_breaker))),
        _ => setters.push(Box::new(AttrControlled(spec.tie_breaker))),
    }

    setters.push(Box::new(TextAttribute::new(
        ATTR_SOFTWARE,
        config.software.clone(),
    )));
    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        spec.integrity_key.clone(),
    )));
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok(msg)
}

/// Binding indications carry no credentials; they only refresh liveness.
pub(crate) fn build_binding_indication(config: &StunConfig) -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
        Box::new(TransactionId::new()),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, config.software.clone())),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

/// Builds the success response to `req`: XOR-MAPPED-ADDRESS echoes the
/// request source, USERNAME is echoed, MESSAGE-INTEGRITY uses the same key.
pub(crate) fn build_binding_success(
    config: &StunConfig,
    req: &Message,
    mapped: SocketAddr,
    integrity_key: &str,
) -> Result<Message> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(req)?;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(req.clone()),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
        Box::new(username),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, config.software.clone())),
        Box::new(MessageIntegrity::new_short_term_integrity(
            integrity_key.to_owned(),
        )),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

pub(crate) fn build_binding_error(
    config: &StunConfig,
    req: &Message,
    code: ErrorCode,
    integrity_key: Option<&str>,
) -> Result<Message> {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(req.clone()),
        Box::new(BINDING_ERROR),
        Box::new(ErrorCodeAttribute {
            code,
            reason: vec![],
        }),
        Box::new(TextAttribute::new(
            ATTR_SOFTWARE,
            config.software.clone(),
        )),
    ];

    if let Some(key) = integrity_key {
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            key.to_owned(),
        )));
    }
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok(msg)
}

/// Final word on one transaction, delivered to the collector channel.
#[derive(Debug)]
pub(crate) enum TransactionOutcome {
    /// A response arrived before the retransmissions ran out.
    Response {
        id: TransactionId,
        msg: Box<Message>,
        from: SocketAddr,
        local: SocketAddr,
        rtt: Duration,
    },
    /// The final retransmission went unanswered.
    Timeout { id: TransactionId },
    /// A retransmission could not even be written to the socket.
    SendFailed { id: TransactionId },
}

impl TransactionOutcome {
    pub(crate) fn transaction_id(&self) -> TransactionId {
        match self {
            Self::Response { id, .. } | Self::Timeout { id } | Self::SendFailed { id } => *id,
        }
    }
}

struct TransactionEntry {
    to: SocketAddr,
    started_at: Instant,
    // Dropping the entry tears the sender down, which stops the retransmit
    // task on its next wakeup.
    cancel_tx: mpsc::Sender<()>,
}

/// Retransmitting request side of the STUN transactional layer (RFC 5389
/// 7.2.1): doubling intervals from the initial RTO up to a cap, a bounded
/// number of retransmissions, and exactly one outcome per transaction.
pub(crate) struct StunTransactions {
    map: Arc<SyncMutex<HashMap<TransactionId, TransactionEntry>>>,
    initial_rto: Duration,
    max_rto: Duration,
    max_retransmissions: u16,
}

impl StunTransactions {
    pub(crate) fn new(
        initial_rto: Duration,
        max_rto: Duration,
        max_retransmissions: u16,
    ) -> Self {
        Self {
            map: Arc::new(SyncMutex::new(HashMap::new())),
            initial_rto: std::cmp::max(initial_rto, MIN_INITIAL_RTO),
            max_rto,
            max_retransmissions,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Sends `raw` to `to` over `conn` and keeps retransmitting until a
    /// response is collected, the schedule is exhausted, or the transaction
    /// is cancelled. The initial send failure surfaces synchronously.
    pub(crate) async fn send_request(
        &self,
        conn: Arc<dyn Conn + Send + Sync>,
        id: TransactionId,
        raw: Vec<u8>,
        to: SocketAddr,
        outcome_tx: mpsc::Sender<TransactionOutcome>,
    ) -> Result<()> {
        conn.send_to(&raw, to).await?;

        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        {
            let mut map = self.map.lock();
            map.insert(
                id,
                TransactionEntry {
                    to,
                    started_at: Instant::now(),
                    cancel_tx,
                },
            );
        }

        let map = Arc::clone(&self.map);
        let (max_rto, max_retransmissions) = (self.max_rto, self.max_retransmissions);
        let mut interval = self.initial_rto;

        tokio::spawn(async move {
            let mut n_rtx: u16 = 0;
            loop {
                let timer = tokio::time::sleep(interval);
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {
                        if map.lock().get(&id).is_none() {
                            return; // completed or cancelled
                        }

                        if n_rtx == max_retransmissions {
                            map.lock().remove(&id);
                            let _ = outcome_tx.send(TransactionOutcome::Timeout { id }).await;
                            return;
                        }

                        n_rtx += 1;
                        interval = std::cmp::min(interval * 2, max_rto);
                        log::trace!(
                            "retransmitting transaction {:?} to {} (n_rtx={})",
                            id,
                            to,
                            n_rtx
                        );

                        if conn.send_to(&raw, to).await.is_err() {
                            map.lock().remove(&id);
                            let _ = outcome_tx.send(TransactionOutcome::SendFailed { id }).await;
                            return;
                        }
                    }
                    _ = cancel_rx.recv() => return,
                }
            }
        });

        Ok(())
    }

    /// Matches a decoded response to its pending transaction. Returns false
    /// for unknown transaction ids, which the caller must discard.
    pub(crate) async fn complete(
        &self,
        msg: Message,
        from: SocketAddr,
        local: SocketAddr,
        outcome_tx: &mpsc::Sender<TransactionOutcome>,
    ) -> bool {
        let id = msg.transaction_id;
        let entry = { self.map.lock().remove(&id) };

        let entry = match entry {
            Some(entry) => entry,
            None => return false,
        };

        let rtt = entry.started_at.elapsed();
        let _ = outcome_tx
            .send(TransactionOutcome::Response {
                id,
                msg: Box::new(msg),
                from,
                local,
                rtt,
            })
            .await;
        true
    }

    /// The destination the pending transaction was addressed to.
    pub(crate) fn destination(&self, id: &TransactionId) -> Option<SocketAddr> {
        self.map.lock().get(id).map(|e| e.to)
    }

    /// Best-effort cancellation: forget the transaction; a response that
    /// still arrives is dropped as unknown.
    pub(crate) fn cancel(&self, id: &TransactionId) {
        self.map.lock().remove(id);
    }

    pub(crate) fn cancel_all(&self) {
        self.map.lock().clear();
    }
}
