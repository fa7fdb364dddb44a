use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::message::{Getter, Message, CLASS_ERROR_RESPONSE};
use stun::xoraddr::XorMappedAddress;
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::agent_internal::*;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use crate::candidate::{Candidate, CandidatePairState, CandidateType};
use crate::control::Role;
use crate::error::*;
use crate::nomination::{on_list_exhausted, on_pair_validated, NominationDecision};
use crate::state::{CheckListState, ProcessingState};
use crate::stream::IceMediaStream;
use crate::transaction::{build_binding_request, BindingRequestSpec, TransactionOutcome};

impl AgentInternal {
    /// Starts connectivity establishment. Repeated calls are a no-op.
    pub(crate) async fn start_connectivity_establishment(
        self: &Arc<Self>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }

        if self.started.swap(true, Ordering::SeqCst) {
            log::debug!("[{}]: already started", self.get_name());
            return Ok(());
        }

        {
            let mut ufrag_pwd = self.ufrag_pwd.lock();
            ufrag_pwd.remote_ufrag = remote_ufrag;
            ufrag_pwd.remote_pwd = remote_pwd;
        }

        log::debug!(
            "[{}]: starting connectivity establishment",
            self.get_name()
        );

        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let streams = self.stream_list();
        for stream in &streams {
            for component in stream.components() {
                stream.check_list().form_pairs(
                    &component.local_candidates(),
                    &component.remote_candidates(),
                    controlling,
                );
            }
        }

        self.set_processing_state(ProcessingState::Running);

        // Only the first stream starts checking; the rest stay frozen until
        // cross-stream unfreezing reaches them.
        if let Some(first) = streams.first() {
            first.check_list().compute_initial_states();
            self.start_pace_maker(first);
        }

        self.start_collector().await;

        // Replay checks that arrived before we were ready.
        let pre_discovered: Vec<PreDiscoveredPair> =
            self.pre_discovered_pairs.lock().drain(..).collect();
        for pre in pre_discovered {
            self.trigger_check(pre.stream, pre.pair, pre.use_candidate)
                .await;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Pace maker
    // ------------------------------------------------------------------

    /// Starts the periodic check task for one stream. The effective period is
    /// Ta multiplied by the number of currently active check lists.
    pub(crate) fn start_pace_maker(self: &Arc<Self>, stream: &Arc<IceMediaStream>) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        {
            let mut pace_makers = self.pace_makers.lock();
            if pace_makers.contains_key(stream.name()) {
                return;
            }
            pace_makers.insert(stream.name().to_owned(), cancel_tx);
        }

        log::debug!(
            "[{}]: starting pace maker for stream {}",
            self.get_name(),
            stream.name()
        );

        let agent = Arc::clone(self);
        let stream = stream.clone();
        tokio::spawn(async move {
            loop {
                let active = std::cmp::max(1, agent.pace_makers.lock().len() as u32);
                let interval = agent.ta * active;

                let timer = tokio::time::sleep(interval);
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {
                        if !agent.tick(&stream).await {
                            break;
                        }
                    }
                    _ = cancel_rx.recv() => return,
                }
            }
            agent.stop_pace_maker(stream.name());
        });
    }

    /// One pacing step; returns false when the pace maker should stop.
    async fn tick(self: &Arc<Self>, stream: &Arc<IceMediaStream>) -> bool {
        match self.processing_state() {
            ProcessingState::Running => {}
            // Ordinary checks may not be emitted before Running.
            ProcessingState::Waiting => return true,
            _ => return false,
        }

        if stream.check_list().state() != CheckListState::Running {
            return false;
        }

        if let Some(pair) = stream.check_list().next_pair() {
            self.start_check_for_pair(stream, pair).await;
        }
        true
    }

    /// The priority a peer-reflexive candidate discovered through this check
    /// would get; carried in the PRIORITY attribute.
    fn prflx_priority(local: &dyn Candidate) -> u32 {
        (1 << 24) * u32::from(CandidateType::PeerReflexive.preference())
            + (1 << 8) * u32::from(local.local_preference())
            + (256 - u32::from(local.component_id()))
    }

    /// Sends one Binding request for `pair`.
    pub(crate) async fn start_check_for_pair(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        pair: Arc<CandidatePair>,
    ) {
        let guard = pair.check_lock.clone().lock_owned().await;
        let check_list = stream.check_list().clone();

        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let nominating = controlling && pair.nominated();

        let state = pair.state();
        match state {
            CandidatePairState::Frozen => {
                check_list.set_pair_state(&pair, CandidatePairState::Waiting);
            }
            CandidatePairState::Waiting => {}
            // A nomination re-check rides on an already succeeded pair
            // without touching its state.
            CandidatePairState::Succeeded if nominating => {}
            _ => return,
        }

        let (username, remote_pwd) = {
            let ufrag_pwd = self.ufrag_pwd.lock();
            (
                format!("{}:{}", ufrag_pwd.remote_ufrag, ufrag_pwd.local_ufrag),
                ufrag_pwd.remote_pwd.clone(),
            )
        };

        let request_priority = Self::prflx_priority(&*pair.local);
        let spec = BindingRequestSpec {
            username,
            integrity_key: remote_pwd,
            priority: request_priority,
            role: if controlling {
                Role::Controlling
            } else {
                Role::Controlled
            },
            tie_breaker: self.tie_breaker.load(Ordering::SeqCst),
            use_candidate: nominating,
        };

        let msg = match build_binding_request(&self.stun_config, &spec) {
            Ok(msg) => msg,
            Err(err) => {
                log::error!("[{}]: failed to build request: {}", self.get_name(), err);
                return;
            }
        };

        let conn = match pair.local.get_conn() {
            Some(conn) => Arc::clone(conn),
            None => {
                log::error!(
                    "[{}]: pair local candidate has no socket: {}",
                    self.get_name(),
                    pair
                );
                check_list.set_pair_state(&pair, CandidatePairState::Failed);
                drop(guard);
                self.update_check_list_state(stream).await;
                return;
            }
        };

        pair.binding_request_count.fetch_add(1, Ordering::SeqCst);
        if nominating {
            pair.use_candidate_sent.store(true, Ordering::SeqCst);
        }

        {
            let mut in_flight = self.in_flight.lock();
            in_flight.insert(
                msg.transaction_id,
                CheckContext {
                    stream: stream.clone(),
                    pair: pair.clone(),
                    destination: pair.remote.addr(),
                    local_base: pair.local.base_addr(),
                    request_priority,
                    use_candidate: nominating,
                    sent_as_controlling: controlling,
                },
            );
        }
        pair.set_in_flight(Some(msg.transaction_id));

        if state != CandidatePairState::Succeeded {
            check_list.set_pair_state(&pair, CandidatePairState::InProgress);
        }

        log::trace!(
            "[{}]: ping STUN from {} to {}",
            self.get_name(),
            pair.local,
            pair.remote
        );

        let destination = pair.remote.addr();
        if let Err(err) = self
            .transactions
            .send_request(
                conn,
                msg.transaction_id,
                msg.raw.clone(),
                destination,
                self.outcome_tx.clone(),
            )
            .await
        {
            log::warn!(
                "[{}]: failed to send STUN message to {}: {}",
                self.get_name(),
                destination,
                err
            );
            self.in_flight.lock().remove(&msg.transaction_id);
            pair.set_in_flight(None);
            if state != CandidatePairState::Succeeded {
                check_list.set_pair_state(&pair, CandidatePairState::Failed);
                drop(guard);
                self.update_check_list_state(stream).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outcome collector
    // ------------------------------------------------------------------

    /// Consumes transaction outcomes. Holds only a weak reference so a
    /// dropped agent tears the loop down with it.
    pub(crate) async fn start_collector(self: &Arc<Self>) {
        let mut outcome_rx = match self.outcome_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                let agent = match weak.upgrade() {
                    Some(agent) => agent,
                    None => return,
                };
                agent.handle_outcome(outcome).await;
            }
        });
    }

    async fn handle_outcome(self: &Arc<Self>, outcome: TransactionOutcome) {
        let id = outcome.transaction_id();
        let ctx = match self.in_flight.lock().remove(&id) {
            Some(ctx) => ctx,
            // Cancelled check, or a transaction this agent never issued.
            None => return,
        };
        ctx.pair.set_in_flight(None);

        match outcome {
            TransactionOutcome::Response {
                msg,
                from,
                local,
                rtt,
                ..
            } => {
                if msg.typ.class == CLASS_ERROR_RESPONSE {
                    self.handle_error_response(ctx, &msg).await;
                } else {
                    self.handle_success_response(ctx, &msg, from, local, rtt)
                        .await;
                }
            }
            TransactionOutcome::Timeout { .. } => {
                log::debug!(
                    "[{}]: check timed out for pair {}",
                    self.get_name(),
                    ctx.pair
                );
                self.fail_check(ctx).await;
            }
            TransactionOutcome::SendFailed { .. } => {
                self.fail_check(ctx).await;
            }
        }
    }

    async fn fail_check(self: &Arc<Self>, ctx: CheckContext) {
        {
            let _guard = ctx.pair.check_lock.clone().lock_owned().await;
            ctx.stream
                .check_list()
                .set_pair_state(&ctx.pair, CandidatePairState::Failed);
        }
        self.update_check_list_state(&ctx.stream).await;
    }

    /// 487 inverts our role and reschedules the check; everything else fails
    /// the pair.
    async fn handle_error_response(self: &Arc<Self>, ctx: CheckContext, msg: &Message) {
        let mut code = ErrorCodeAttribute::default();
        let is_role_conflict =
            code.get_from(msg).is_ok() && code.code.0 == CODE_ROLE_CONFLICT.0;

        if !is_role_conflict {
            log::debug!(
                "[{}]: unrecoverable error response ({}) for pair {}",
                self.get_name(),
                code.code.0,
                ctx.pair
            );
            self.fail_check(ctx).await;
            return;
        }

        let controlling = self.is_controlling.load(Ordering::SeqCst);
        if controlling == ctx.sent_as_controlling {
            log::info!(
                "[{}]: role conflict reported by peer, switching to {}",
                self.get_name(),
                if controlling { "controlled" } else { "controlling" }
            );
            self.set_role(!controlling);
        }
        self.trigger_check(ctx.stream, ctx.pair, false).await;
    }

    /// Success-response handling: symmetry, peer-reflexive discovery, valid-pair
    /// construction, unfreezing and nomination.
    pub(crate) async fn handle_success_response(
        self: &Arc<Self>,
        ctx: CheckContext,
        msg: &Message,
        from: SocketAddr,
        local: SocketAddr,
        rtt: Duration,
    ) {
        let guard = ctx.pair.check_lock.clone().lock_owned().await;
        let check_list = ctx.stream.check_list().clone();

        // The response must come back over exactly the path the request took.
        if from != ctx.destination || local != ctx.local_base {
            log::warn!(
                "[{}]: asymmetric response for {}: expected({} -> {}) actual({} -> {})",
                self.get_name(),
                ctx.pair,
                ctx.destination,
                ctx.local_base,
                from,
                local
            );
            check_list.set_pair_state(&ctx.pair, CandidatePairState::Failed);
            drop(guard);
            self.update_check_list_state(&ctx.stream).await;
            return;
        }

        let mut xor_addr = XorMappedAddress::default();
        if let Err(err) = xor_addr.get_from(msg) {
            log::warn!(
                "[{}]: success response without XOR-MAPPED-ADDRESS: {}",
                self.get_name(),
                err
            );
            check_list.set_pair_state(&ctx.pair, CandidatePairState::Failed);
            drop(guard);
            self.update_check_list_state(&ctx.stream).await;
            return;
        }
        let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);

        let component = match ctx.stream.get_component(ctx.pair.local.component_id()) {
            Some(component) => component,
            None => return,
        };

        // A mapped address no local candidate covers is a peer-reflexive
        // local candidate based on the pair's local candidate, with the
        // priority the request carried.
        let valid_local = match component.find_local_candidate(mapped) {
            Some(existing) => existing,
            None => {
                let prflx = CandidatePeerReflexiveConfig {
                    base_config: CandidateBaseConfig {
                        network: "udp".to_owned(),
                        address: mapped.ip().to_string(),
                        port: mapped.port(),
                        component_id: component.id(),
                        priority: ctx.request_priority,
                        conn: ctx.pair.local.get_conn().cloned(),
                        ..CandidateBaseConfig::default()
                    },
                    rel_addr: ctx.pair.local.address(),
                    rel_port: ctx.pair.local.port(),
                    base_addr: Some(ctx.pair.local.addr()),
                };

                match prflx.new_candidate_peer_reflexive() {
                    Ok(prflx) => {
                        let prflx: Arc<dyn Candidate + Send + Sync> = Arc::new(prflx);
                        log::debug!(
                            "[{}]: discovered peer-reflexive local candidate {}",
                            self.get_name(),
                            mapped
                        );
                        component.add_local_candidate(prflx.clone(), &self.foundations);
                        prflx
                    }
                    Err(err) => {
                        log::error!(
                            "[{}]: failed to create peer-reflexive local for {}: {}",
                            self.get_name(),
                            mapped,
                            err
                        );
                        return;
                    }
                }
            }
        };

        let generated = ctx.pair.clone();
        let valid_pair = if valid_local.addr() == generated.local.addr() {
            generated.clone()
        } else {
            let constructed = Arc::new(CandidatePair::new(
                valid_local,
                generated.remote.clone(),
                self.is_controlling.load(Ordering::SeqCst),
            ));
            check_list.find_pair(&constructed).unwrap_or(constructed)
        };

        generated.record_round_trip_time(rtt);
        check_list.set_pair_state(&generated, CandidatePairState::Succeeded);
        log::trace!(
            "[{}]: found valid pair {} (generated by {})",
            self.get_name(),
            valid_pair,
            generated
        );
        ctx.stream.add_to_valid_list(valid_pair.clone());

        if let Some(selected) = component.selected_pair() {
            if *selected == *generated {
                generated.stamp_consent_freshness();
            }
        }

        // Nomination runs inside the pair critical section so a racing
        // incoming USE-CANDIDATE can't confirm the same pair twice.
        let controlling = self.is_controlling.load(Ordering::SeqCst);
        if controlling && ctx.use_candidate {
            self.nomination_confirmed(&ctx.stream, &valid_pair).await;
        } else if !controlling
            && generated.use_candidate_received()
            && !generated.nominated()
        {
            self.nomination_confirmed(&ctx.stream, &generated).await;
        }
        drop(guard);

        // Unfreezing, both in this stream and across streams.
        check_list.unfreeze_foundation(&generated.foundation());
        self.unfreeze_cross_stream(&ctx.stream).await;

        if controlling {
            self.pair_validated_policy(&ctx.stream, &valid_pair).await;
        }

        self.update_check_list_state(&ctx.stream).await;
    }

    /// Wakes frozen pairs in the other streams whose foundation already
    /// validated somewhere; a fully frozen list coming alive gets its pace
    /// maker started.
    pub(crate) async fn unfreeze_cross_stream(self: &Arc<Self>, origin: &Arc<IceMediaStream>) {
        let streams = self.stream_list();
        let mut validated: HashSet<String> = HashSet::new();
        for stream in &streams {
            validated.extend(stream.valid_foundations());
        }

        for other in streams {
            if Arc::ptr_eq(&other, origin) {
                continue;
            }

            let was_fully_frozen = other.check_list().is_fully_frozen();
            let unfrozen = other.check_list().unfreeze_foundations(&validated);
            if was_fully_frozen
                && unfrozen > 0
                && self.processing_state() == ProcessingState::Running
            {
                self.start_pace_maker(&other);
            }
        }
    }

    // ------------------------------------------------------------------
    // Nomination policy wiring
    // ------------------------------------------------------------------

    pub(crate) async fn pair_validated_policy(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        pair: &Arc<CandidatePair>,
    ) {
        let component_id = pair.local.component_id();
        let already = Self::component_has_nomination(stream, component_id);

        match on_pair_validated(self.nomination_strategy, pair, already) {
            NominationDecision::Nominate => {
                self.relayed_debounce.cancel(stream.name(), component_id);
                if let Err(err) = self.nominate(stream, pair).await {
                    log::warn!("[{}]: nomination failed: {}", self.get_name(), err);
                }
            }
            NominationDecision::ArmRelayedTimer => {
                let mut rx = match self.relayed_debounce.arm(stream.name(), component_id) {
                    Some(rx) => rx,
                    None => return,
                };

                let agent = Arc::clone(self);
                let stream = stream.clone();
                let pair = pair.clone();
                let window = self.relayed_debounce.window;
                tokio::spawn(async move {
                    let timer = tokio::time::sleep(window);
                    tokio::pin!(timer);

                    tokio::select! {
                        _ = timer.as_mut() => {
                            agent.relayed_debounce.clear(stream.name(), component_id);
                            if !Self::component_has_nomination(&stream, component_id) {
                                if let Err(err) = agent.nominate(&stream, &pair).await {
                                    log::warn!(
                                        "[{}]: relayed nomination failed: {}",
                                        agent.get_name(),
                                        err
                                    );
                                }
                            }
                        }
                        _ = rx.recv() => {}
                    }
                });
            }
            NominationDecision::Ignore => {}
        }
    }

    /// Deferred policies pick their winner once the list ran out of checks.
    pub(crate) async fn nominate_on_exhaustion(self: &Arc<Self>, stream: &Arc<IceMediaStream>) {
        if !self.is_controlling.load(Ordering::SeqCst) {
            return;
        }

        for component in stream.components() {
            let component_id = component.id();
            let already = Self::component_has_nomination(stream, component_id);
            let validated: Vec<Arc<CandidatePair>> = stream
                .valid_list()
                .into_iter()
                .filter(|p| p.local.component_id() == component_id)
                .collect();

            if let Some(pick) =
                on_list_exhausted(self.nomination_strategy, &validated, already)
            {
                self.relayed_debounce.cancel(stream.name(), component_id);
                if let Err(err) = self.nominate(stream, &pick).await {
                    log::warn!("[{}]: nomination failed: {}", self.get_name(), err);
                }
            }
        }
    }
}
