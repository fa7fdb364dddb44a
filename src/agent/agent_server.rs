use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use stun::attributes::{ATTR_USERNAME, ATTR_USE_CANDIDATE};
use stun::error_code::{CODE_BAD_REQUEST, CODE_ROLE_CONFLICT};
use stun::message::{Getter, Message};
use stun::textattrs::Username;


use super::agent_internal::AgentInternal;
use crate::candidate::Candidate;
use crate::component::Component;
use crate::control::AttrControl;
use crate::control::Role;
use crate::error::*;
use crate::priority::PriorityAttr;
use crate::stream::IceMediaStream;
use crate::transaction::{build_binding_error, build_binding_success, RequestListener};
use crate::util::{assert_inbound_message_integrity, split_username};

#[async_trait]
impl RequestListener for AgentInternal {
    /// Contract entry point: resolves the receiving candidate from the
    /// arrival address and runs the request through the check server.
    async fn on_request(self: Arc<Self>, msg: Message, from: SocketAddr, local: SocketAddr) {
        let (stream, candidate) = match self.find_stream_by_local_addr(local) {
            Some(found) => found,
            None => {
                log::warn!(
                    "[{}]: request for unknown local address {}",
                    self.get_name(),
                    local
                );
                return;
            }
        };
        let component = match stream.get_component(candidate.component_id()) {
            Some(component) => component,
            None => return,
        };

        self.handle_binding_request(&stream, &component, &candidate, msg, from)
            .await;
    }
}

impl AgentInternal {
    /// Authenticates, arbitrates roles, surfaces the triggered check and
    /// answers an inbound Binding request.
    pub(crate) async fn handle_binding_request(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        component: &Arc<Component>,
        local_candidate: &Arc<dyn Candidate + Send + Sync>,
        mut msg: Message,
        src_addr: SocketAddr,
    ) {
        // USERNAME must exist and its local-ufrag half must be ours;
        // anything else is silently dropped.
        let mut username = Username::new(ATTR_USERNAME, String::new());
        if username.get_from(&msg).is_err() {
            log::warn!(
                "[{}]: discard request from {}: no USERNAME",
                self.get_name(),
                src_addr
            );
            return;
        }
        let username_text = username.to_string();
        let local_ufrag_ok = match split_username(&username_text) {
            Some((local_half, _)) => {
                let ufrag_pwd = self.ufrag_pwd.lock();
                local_half == ufrag_pwd.local_ufrag
            }
            None => false,
        };
        if !local_ufrag_ok {
            log::warn!(
                "[{}]: discard request from {}: username mismatch ({})",
                self.get_name(),
                src_addr,
                username_text
            );
            return;
        }

        let local_pwd = self.ufrag_pwd.lock().local_pwd.clone();
        if let Err(err) = assert_inbound_message_integrity(&mut msg, local_pwd.as_bytes()) {
            log::warn!(
                "[{}]: discard request from {}: {}",
                self.get_name(),
                src_addr,
                err
            );
            return;
        }

        // Role conflict detection and repair (RFC 5245 7.2.1.1): on a
        // double claim the higher tie-breaker keeps its role and answers
        // 487; the lower one silently adopts the other role.
        let mut control = AttrControl::default();
        if control.get_from(&msg).is_ok() {
            let we_are_controlling = self.is_controlling.load(Ordering::SeqCst);
            let both_controlling =
                we_are_controlling && control.role == Role::Controlling;
            let both_controlled =
                !we_are_controlling && control.role == Role::Controlled;

            if both_controlling || both_controlled {
                let self_tb = self.tie_breaker.load(Ordering::SeqCst);
                let their_tb = control.tie_breaker.0;

                // Unsigned 64-bit comparison decides who yields.
                if self_tb >= their_tb {
                    log::info!(
                        "[{}]: role conflict with {} (self_tb={}, their_tb={}), answering 487",
                        self.get_name(),
                        src_addr,
                        self_tb,
                        their_tb
                    );
                    self.send_binding_error(
                        local_candidate,
                        &msg,
                        src_addr,
                        CODE_ROLE_CONFLICT,
                        &local_pwd,
                    )
                    .await;
                    return;
                }

                log::info!(
                    "[{}]: role conflict with {} (self_tb={}, their_tb={}), toggling role",
                    self.get_name(),
                    src_addr,
                    self_tb,
                    their_tb
                );
                self.set_role(!we_are_controlling);
            }
        }

        let mut priority = PriorityAttr::default();
        if priority.get_from(&msg).is_err() {
            log::warn!(
                "[{}]: request from {} has no PRIORITY, answering 400",
                self.get_name(),
                src_addr
            );
            self.send_binding_error(
                local_candidate,
                &msg,
                src_addr,
                CODE_BAD_REQUEST,
                &local_pwd,
            )
            .await;
            return;
        }

        let use_candidate = msg.contains(ATTR_USE_CANDIDATE);
        log::trace!(
            "[{}]: inbound STUN (Request) from {} to {}",
            self.get_name(),
            src_addr,
            local_candidate
        );

        self.incoming_check_received(
            stream.clone(),
            local_candidate.clone(),
            src_addr,
            priority.0,
            use_candidate,
        )
        .await;

        // Answer with XOR-MAPPED-ADDRESS = request source.
        match build_binding_success(&self.stun_config, &msg, src_addr, &local_pwd) {
            Ok(response) => {
                self.send_stun(local_candidate, &response.raw, src_addr).await;
                if let Some(selected) = component.selected_pair() {
                    if selected.remote.addr() == src_addr {
                        selected.stamp_consent_freshness();
                    }
                }
            }
            Err(err) => {
                log::warn!(
                    "[{}]: failed to build success response for {}: {}",
                    self.get_name(),
                    src_addr,
                    err
                );
            }
        }
    }

    async fn send_binding_error(
        &self,
        local_candidate: &Arc<dyn Candidate + Send + Sync>,
        req: &Message,
        dst: SocketAddr,
        code: stun::error_code::ErrorCode,
        local_pwd: &str,
    ) {
        match build_binding_error(&self.stun_config, req, code, Some(local_pwd)) {
            Ok(response) => self.send_stun(local_candidate, &response.raw, dst).await,
            Err(err) => log::warn!(
                "[{}]: failed to build error response: {}",
                self.get_name(),
                err
            ),
        }
    }

    pub(crate) async fn send_stun(
        &self,
        local_candidate: &Arc<dyn Candidate + Send + Sync>,
        raw: &[u8],
        dst: SocketAddr,
    ) {
        let conn = match local_candidate.get_conn() {
            Some(conn) => conn,
            None => {
                log::warn!(
                    "[{}]: can't send STUN, candidate has no socket",
                    self.get_name()
                );
                return;
            }
        };

        if let Err(err) = conn.send_to(raw, dst).await {
            log::trace!(
                "[{}]: failed to send STUN message to {}: {}",
                self.get_name(),
                dst,
                err
            );
        } else {
            local_candidate.seen(true);
        }
    }
}
