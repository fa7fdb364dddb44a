use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use stun::agent::TransactionId;
use stun::message::{
    is_message, Message, CLASS_ERROR_RESPONSE, CLASS_INDICATION, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Duration;
use util::sync::Mutex as SyncMutex;
use waitgroup::WaitGroup;

use super::agent_config::*;
use super::*;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidatePairState, RECEIVE_MTU};
use crate::component::Component;
use crate::error::*;
use crate::events::{EventBus, StreamEvent};
use crate::foundation::FoundationsRegistry;
use crate::nomination::{NominationStrategy, RelayedDebounce};
use crate::state::{CheckListState, ProcessingState};
use crate::stream::IceMediaStream;
use crate::transaction::{
    CredentialsAuthority, StunConfig, StunTransactions, TransactionOutcome,
};
use crate::util::assert_inbound_message_integrity;

// A reader task yields back to the pool after this many datagrams so queues
// sharing the worker pool cannot starve each other.
pub(crate) const YIELD_AFTER_PACKETS: u32 = 32;

#[derive(Default)]
pub(crate) struct UfragPwd {
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,
}

/// Everything the response handler needs to finish one outgoing check.
pub(crate) struct CheckContext {
    pub(crate) stream: Arc<IceMediaStream>,
    pub(crate) pair: Arc<CandidatePair>,
    pub(crate) destination: SocketAddr,
    pub(crate) local_base: SocketAddr,
    pub(crate) request_priority: u32,
    pub(crate) use_candidate: bool,
    /// The role the request was sent under; a 487 only toggles the agent
    /// when the role did not change in the meantime.
    pub(crate) sent_as_controlling: bool,
}

/// A triggered check that arrived before connectivity establishment started.
pub(crate) struct PreDiscoveredPair {
    pub(crate) stream: Arc<IceMediaStream>,
    pub(crate) pair: Arc<CandidatePair>,
    pub(crate) use_candidate: bool,
}

pub struct AgentInternal {
    // Frozen at construction.
    pub(crate) stun_config: StunConfig,
    pub(crate) ta: Duration,
    pub(crate) check_list_grace_period: Duration,
    pub(crate) termination_delay: Duration,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) keep_alive_strategy: KeepAliveStrategy,
    pub(crate) nomination_strategy: NominationStrategy,
    pub(crate) max_check_list_size: usize,
    pub(crate) use_component_socket: bool,

    pub(crate) state: AtomicU8, // ProcessingState
    pub(crate) is_controlling: AtomicBool,
    pub(crate) tie_breaker: AtomicU64,
    pub(crate) started: AtomicBool,

    pub(crate) ufrag_pwd: SyncMutex<UfragPwd>,

    pub(crate) streams: SyncMutex<Vec<Arc<IceMediaStream>>>,
    pub(crate) foundations: FoundationsRegistry,
    pub(crate) events: EventBus,

    pub(crate) transactions: StunTransactions,
    pub(crate) in_flight: SyncMutex<HashMap<TransactionId, CheckContext>>,
    pub(crate) outcome_tx: mpsc::Sender<TransactionOutcome>,
    pub(crate) outcome_rx: Mutex<Option<mpsc::Receiver<TransactionOutcome>>>,

    pub(crate) pre_discovered_pairs: SyncMutex<Vec<PreDiscoveredPair>>,

    pub(crate) relayed_debounce: RelayedDebounce,

    // Cancel handles, keyed by stream name for pace makers.
    pub(crate) pace_makers: SyncMutex<HashMap<String, mpsc::Sender<()>>>,
    pub(crate) termination_timer_tx: SyncMutex<Option<mpsc::Sender<()>>>,
    pub(crate) keep_alive_tx: SyncMutex<Option<mpsc::Sender<()>>>,

    pub(crate) done_tx: SyncMutex<Option<mpsc::Sender<()>>>,
    pub(crate) worker_wg: SyncMutex<Option<WaitGroup>>,

    pub(crate) on_processing_state_change_hdlr:
        arc_swap::ArcSwapOption<Mutex<OnProcessingStateChangeHdlrFn>>,
    pub(crate) on_selected_pair_change_hdlr:
        arc_swap::ArcSwapOption<Mutex<OnSelectedPairChangeHdlrFn>>,
}

impl AgentInternal {
    pub(super) fn new(config: &AgentConfig) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::channel(1);
        drop(done_rx);

        AgentInternal {
            stun_config: StunConfig {
                software: config.software.clone(),
            },
            ta: config.ta,
            check_list_grace_period: config.check_list_grace_period,
            termination_delay: config.termination_delay,
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_strategy: config.keep_alive_strategy,
            nomination_strategy: config.nomination_strategy,
            max_check_list_size: config.max_check_list_size,
            use_component_socket: config.use_component_socket,

            state: AtomicU8::new(ProcessingState::Waiting as u8),
            is_controlling: AtomicBool::new(config.is_controlling),
            tie_breaker: AtomicU64::new(rand::random::<u64>()),
            started: AtomicBool::new(false),

            ufrag_pwd: SyncMutex::new(UfragPwd::default()),

            streams: SyncMutex::new(vec![]),
            foundations: FoundationsRegistry::new(),
            events: EventBus::new(),

            transactions: StunTransactions::new(
                config.initial_rto,
                config.max_rto,
                config.max_retransmissions,
            ),
            in_flight: SyncMutex::new(HashMap::new()),
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),

            pre_discovered_pairs: SyncMutex::new(vec![]),

            relayed_debounce: RelayedDebounce::new(
                crate::nomination::DEFAULT_RELAYED_NOMINATION_DEBOUNCE,
            ),

            pace_makers: SyncMutex::new(HashMap::new()),
            termination_timer_tx: SyncMutex::new(None),
            keep_alive_tx: SyncMutex::new(None),

            done_tx: SyncMutex::new(Some(done_tx)),
            worker_wg: SyncMutex::new(Some(WaitGroup::new())),

            on_processing_state_change_hdlr: arc_swap::ArcSwapOption::empty(),
            on_selected_pair_change_hdlr: arc_swap::ArcSwapOption::empty(),
        }
    }

    pub(crate) fn processing_state(&self) -> ProcessingState {
        ProcessingState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_processing_state(&self, new_state: ProcessingState) -> bool {
        let current = self.processing_state();
        if current == new_state || current.is_over() {
            return false;
        }

        log::info!(
            "[{}]: processing state {} -> {}",
            self.get_name(),
            current,
            new_state
        );
        self.state.store(new_state as u8, Ordering::SeqCst);
        self.events
            .publish(StreamEvent::ProcessingStateChanged { state: new_state });

        if let Some(handler) = &*self.on_processing_state_change_hdlr.load() {
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let mut f = handler.lock().await;
                f(new_state).await;
            });
        }
        true
    }

    pub(crate) fn get_name(&self) -> &str {
        if self.is_controlling.load(Ordering::SeqCst) {
            "controlling"
        } else {
            "controlled"
        }
    }

    // ------------------------------------------------------------------
    // Streams and candidates
    // ------------------------------------------------------------------

    pub(crate) fn create_media_stream(&self, name: &str) -> Result<Arc<IceMediaStream>> {
        let mut streams = self.streams.lock();
        if streams.iter().any(|s| s.name() == name) {
            return Err(Error::ErrStreamAlreadyExists);
        }

        let stream = Arc::new(IceMediaStream::new(
            name,
            self.max_check_list_size,
            self.events.clone(),
        ));
        streams.push(stream.clone());

        // The global cap is split evenly across streams.
        let per_stream = std::cmp::max(1, self.max_check_list_size / streams.len());
        for s in streams.iter() {
            s.check_list().set_max_size(per_stream);
        }

        Ok(stream)
    }

    pub(crate) fn get_stream(&self, name: &str) -> Option<Arc<IceMediaStream>> {
        let streams = self.streams.lock();
        streams.iter().find(|s| s.name() == name).cloned()
    }

    pub(crate) fn stream_list(&self) -> Vec<Arc<IceMediaStream>> {
        self.streams.lock().clone()
    }

    pub(crate) fn find_stream_by_local_addr(
        &self,
        addr: SocketAddr,
    ) -> Option<(Arc<IceMediaStream>, Arc<dyn Candidate + Send + Sync>)> {
        let streams = self.stream_list();
        for stream in streams {
            if let Some(candidate) = stream.find_local_candidate(addr) {
                return Some((stream, candidate));
            }
        }
        None
    }

    /// Adopts a local candidate into a component and, when it carries its own
    /// socket, starts its reader task.
    pub(crate) async fn add_local_candidate(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        component: &Arc<Component>,
        candidate: Arc<dyn Candidate + Send + Sync>,
    ) -> bool {
        if !component.add_local_candidate(candidate.clone(), &self.foundations) {
            if candidate.owns_conn() {
                if let Some(conn) = candidate.get_conn() {
                    let _ = conn.close().await;
                }
            }
            return false;
        }

        if candidate.owns_conn() && candidate.get_conn().is_some() {
            self.start_candidate(stream.clone(), component.clone(), candidate)
                .await;
        }
        true
    }

    /// Runs the configured harvesters for every component of `stream`.
    pub(crate) async fn gather_candidates(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        harvesters: &[Arc<dyn crate::harvest::CandidateHarvester>],
    ) -> Result<()> {
        for component in stream.components() {
            for harvester in harvesters {
                let harvested = match harvester.harvest(component.id()).await {
                    Ok(harvested) => harvested,
                    Err(err) => {
                        log::warn!(
                            "[{}]: harvester {} failed for component {}: {}",
                            self.get_name(),
                            harvester.name(),
                            component.id(),
                            err
                        );
                        return Err(err);
                    }
                };

                for candidate in harvested {
                    self.add_local_candidate(stream, &component, candidate).await;
                }
            }
            component.select_default_candidate();
        }
        Ok(())
    }

    /// Adds peer candidates. Before the session starts they only land in the
    /// component books; afterwards (trickle) they are paired and scheduled.
    pub(crate) fn add_remote_candidate(
        &self,
        stream: &Arc<IceMediaStream>,
        candidate: Arc<dyn Candidate + Send + Sync>,
    ) -> Result<()> {
        let component = stream
            .get_component(candidate.component_id())
            .ok_or(Error::ErrUnknownComponent)?;

        if !component.add_remote_candidate(candidate.clone()) {
            return Ok(()); // trickle duplicate
        }

        if self.processing_state() != ProcessingState::Running {
            return Ok(());
        }

        // Trickle while running: the update queue feeds the check list.
        component.queue_remote_update(candidate);
        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let check_list = stream.check_list();
        for update in component.drain_remote_updates() {
            for local in component.local_candidates() {
                if local.candidate_type() == crate::candidate::CandidateType::ServerReflexive {
                    continue;
                }
                if local.network_type() != update.network_type() {
                    continue;
                }
                let pair = Arc::new(CandidatePair::new(local, update.clone(), controlling));
                if check_list.find_pair(&pair).is_none() && check_list.add_pair(pair.clone()) {
                    check_list.set_pair_state(&pair, CandidatePairState::Waiting);
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Role control
    // ------------------------------------------------------------------

    /// Sets the agent role and refreshes pair priorities, which depend on
    /// which side is controlling.
    pub(crate) fn set_role(&self, controlling: bool) {
        let was = self.is_controlling.swap(controlling, Ordering::SeqCst);
        if was == controlling {
            return;
        }

        log::info!(
            "[{}]: agent is now {}",
            self.get_name(),
            if controlling { "controlling" } else { "controlled" }
        );

        let streams = self.stream_list();
        for stream in streams {
            for pair in stream.check_list().pairs() {
                pair.ice_role_controlling.store(controlling, Ordering::SeqCst);
            }
            stream.check_list().resort();
        }
    }

    // ------------------------------------------------------------------
    // Incoming checks feeding the orchestrator
    // ------------------------------------------------------------------

    /// Handles an authenticated, role-checked incoming Binding request.
    pub(crate) async fn incoming_check_received(
        self: &Arc<Self>,
        stream: Arc<IceMediaStream>,
        local_candidate: Arc<dyn Candidate + Send + Sync>,
        remote_addr: SocketAddr,
        priority: u32,
        use_candidate: bool,
    ) {
        let component = match stream.get_component(local_candidate.component_id()) {
            Some(component) => component,
            None => return,
        };

        let remote_candidate = match component.find_remote_candidate(remote_addr) {
            Some(remote) => remote,
            None => {
                // A source we never saw in the offer/answer: a peer-reflexive
                // remote candidate with the priority the request carried.
                let prflx = CandidatePeerReflexiveConfig {
                    base_config: CandidateBaseConfig {
                        network: "udp".to_owned(),
                        address: remote_addr.ip().to_string(),
                        port: remote_addr.port(),
                        component_id: component.id(),
                        priority,
                        ..CandidateBaseConfig::default()
                    },
                    ..Default::default()
                }
                .new_candidate_peer_reflexive();

                let prflx: Arc<dyn Candidate + Send + Sync> = match prflx {
                    Ok(prflx) => Arc::new(prflx),
                    Err(err) => {
                        log::error!(
                            "[{}]: failed to create peer-reflexive remote for {}: {}",
                            self.get_name(),
                            remote_addr,
                            err
                        );
                        return;
                    }
                };

                self.foundations.assign_peer_reflexive(&*prflx);
                log::debug!(
                    "[{}]: adding a new peer-reflexive remote candidate {}",
                    self.get_name(),
                    remote_addr
                );
                component.add_remote_candidate(prflx.clone());
                prflx
            }
        };
        remote_candidate.seen(false);

        let check_list = stream.check_list();
        let pair = match check_list.find_pair_by_addrs(local_candidate.addr(), remote_addr) {
            Some(pair) => pair,
            None => Arc::new(CandidatePair::new(
                local_candidate,
                remote_candidate,
                self.is_controlling.load(Ordering::SeqCst),
            )),
        };

        if self.processing_state() == ProcessingState::Waiting {
            // Checks have not started; replay this when they do.
            if use_candidate {
                pair.use_candidate_received.store(true, Ordering::SeqCst);
            }
            self.pre_discovered_pairs.lock().push(PreDiscoveredPair {
                stream,
                pair,
                use_candidate,
            });
            return;
        }

        self.trigger_check(stream, pair, use_candidate).await;
    }

    /// Promotes a pair to the head of the queue in response to a peer check.
    pub(crate) async fn trigger_check(
        self: &Arc<Self>,
        stream: Arc<IceMediaStream>,
        pair: Arc<CandidatePair>,
        use_candidate: bool,
    ) {
        let check_list = stream.check_list();
        let _guard = pair.check_lock.clone().lock_owned().await;

        if use_candidate {
            pair.use_candidate_received.store(true, Ordering::SeqCst);
        }

        if let Some(existing) = check_list.find_pair(&pair) {
            if use_candidate {
                existing.use_candidate_received.store(true, Ordering::SeqCst);
            }

            if existing.state() == CandidatePairState::Succeeded {
                if use_candidate
                    && !self.is_controlling.load(Ordering::SeqCst)
                    && !existing.nominated()
                {
                    self.nomination_confirmed(&stream, &existing).await;
                }
                return;
            }

            if existing.state() == CandidatePairState::InProgress {
                if let Some(id) = existing.in_flight() {
                    self.transactions.cancel(&id);
                    self.in_flight.lock().remove(&id);
                    existing.set_in_flight(None);
                }
            }

            check_list.set_pair_state(&existing, CandidatePairState::Waiting);
            check_list.schedule_triggered(existing);
        } else if check_list.add_pair(pair.clone()) {
            check_list.set_pair_state(&pair, CandidatePairState::Waiting);
            check_list.schedule_triggered(pair);
        } else if let Some(existing) = check_list.find_pair(&pair) {
            // A concurrent trigger beat us to the insert.
            check_list.set_pair_state(&existing, CandidatePairState::Waiting);
            check_list.schedule_triggered(existing);
        }

        // Triggered checks may target a stream whose pace maker never ran.
        if self.processing_state() == ProcessingState::Running {
            self.start_pace_maker(&stream);
        }
    }

    // ------------------------------------------------------------------
    // Nomination plumbing
    // ------------------------------------------------------------------

    pub(crate) fn component_has_nomination(stream: &IceMediaStream, component_id: u16) -> bool {
        stream
            .valid_list()
            .iter()
            .any(|p| p.local.component_id() == component_id && p.nominated())
    }

    /// The controlling side's act of flagging one valid pair: sets the flag,
    /// guarantees valid-list membership and schedules the triggered check
    /// that actually carries USE-CANDIDATE to the peer.
    pub(crate) async fn nominate(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        pair: &Arc<CandidatePair>,
    ) -> Result<()> {
        if !self.is_controlling.load(Ordering::SeqCst) {
            return Ok(()); // the controlled side only confirms
        }
        if Self::component_has_nomination(stream, pair.local.component_id()) {
            return Ok(());
        }
        if !pair.validated() {
            return Err(Error::ErrPairNotValidated);
        }

        log::info!("[{}]: nominating pair {}", self.get_name(), pair);
        pair.nominated.store(true, Ordering::SeqCst);
        stream.add_to_valid_list(pair.clone());

        let check_list = stream.check_list();
        check_list.schedule_triggered(pair.clone());
        if self.processing_state() == ProcessingState::Running {
            self.start_pace_maker(stream);
        }

        Ok(())
    }

    /// Confirms a nomination on this side: flags the pair, records it in the
    /// valid list and makes it the component's selected pair exactly once.
    pub(crate) async fn nomination_confirmed(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        pair: &Arc<CandidatePair>,
    ) {
        pair.nominated.store(true, Ordering::SeqCst);
        stream.add_to_valid_list(pair.clone());

        if let Some(component) = stream.get_component(pair.local.component_id()) {
            if component.set_selected_pair(pair.clone()) {
                pair.stamp_consent_freshness();

                if let Some(handler) = &*self.on_selected_pair_change_hdlr.load() {
                    let handler = Arc::clone(handler);
                    let (local, remote) = (pair.local.clone(), pair.remote.clone());
                    tokio::spawn(async move {
                        let mut f = handler.lock().await;
                        f(&local, &remote).await;
                    });
                }
            }
        }

        if stream.maybe_complete() {
            self.on_check_list_state_change().await;
        }
    }

    // ------------------------------------------------------------------
    // Check-list bookkeeping
    // ------------------------------------------------------------------

    /// Evaluated after every Success, Failure and Timeout.
    pub(crate) async fn update_check_list_state(self: &Arc<Self>, stream: &Arc<IceMediaStream>) {
        let check_list = stream.check_list();
        if check_list.state() != CheckListState::Running || !check_list.all_terminated() {
            return;
        }

        if !stream.valid_list_covers_components() {
            self.arm_grace_timer(stream);
        }

        // Deferred nomination strategies act once the list ran dry.
        self.nominate_on_exhaustion(stream).await;

        // Terminating one list wakes the remaining frozen ones.
        let streams = self.stream_list();
        for other in streams {
            if Arc::ptr_eq(&other, stream) {
                continue;
            }
            if other.check_list().is_fully_frozen() {
                other.check_list().compute_initial_states();
                if self.processing_state() == ProcessingState::Running {
                    self.start_pace_maker(&other);
                }
            }
        }
    }

    /// Arms the per-list grace timer once. When it expires with the list
    /// still Running, the list fails.
    fn arm_grace_timer(self: &Arc<Self>, stream: &Arc<IceMediaStream>) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        if !stream.check_list().arm_grace_timer(cancel_tx) {
            return;
        }

        let agent = Arc::clone(self);
        let stream = stream.clone();
        let grace = self.check_list_grace_period;
        tokio::spawn(async move {
            let timer = tokio::time::sleep(grace);
            tokio::pin!(timer);

            tokio::select! {
                _ = timer.as_mut() => {
                    stream.check_list().disarm_grace_timer();
                    if stream.valid_list_covers_components() {
                        return;
                    }
                    log::info!(
                        "[{}]: check list of stream {} timed out",
                        agent.get_name(),
                        stream.name()
                    );
                    if stream.check_list().set_state(CheckListState::Failed) {
                        agent.stop_pace_maker(stream.name());
                        agent.on_check_list_state_change().await;
                    }
                }
                _ = cancel_rx.recv() => {}
            }
        });
    }

    /// Agent-level reaction to any check-list state change.
    pub(crate) async fn on_check_list_state_change(self: &Arc<Self>) {
        let streams = self.stream_list();
        if streams.is_empty() {
            return;
        }

        let mut any_running = false;
        let mut any_completed = false;
        for stream in &streams {
            match stream.check_list().state() {
                CheckListState::Running => any_running = true,
                CheckListState::Completed => any_completed = true,
                _ => {}
            }
        }

        if any_running {
            return;
        }

        if any_completed {
            if self.set_processing_state(ProcessingState::Completed) {
                self.start_termination_timer();
                self.start_keep_alives();
            }
        } else {
            self.set_processing_state(ProcessingState::Failed);
        }
    }

    // ------------------------------------------------------------------
    // Termination and keep-alives
    // ------------------------------------------------------------------

    fn start_termination_timer(self: &Arc<Self>) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        {
            let mut termination = self.termination_timer_tx.lock();
            if termination.is_some() {
                return;
            }
            *termination = Some(cancel_tx);
        }

        let agent = Arc::clone(self);
        let delay = self.termination_delay;
        tokio::spawn(async move {
            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);

            tokio::select! {
                _ = timer.as_mut() => agent.terminate().await,
                _ = cancel_rx.recv() => {}
            }
        });
    }

    /// Releases the sockets of non-selected candidates and parks the agent.
    async fn terminate(self: &Arc<Self>) {
        let streams = self.stream_list();
        for stream in &streams {
            stream.free(true).await;
        }

        self.stop_all_pace_makers();
        self.set_processing_state(ProcessingState::Terminated);
    }

    fn start_keep_alives(self: &Arc<Self>) {
        if self.keep_alive_interval.is_zero() {
            return;
        }

        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        {
            let mut keep_alive = self.keep_alive_tx.lock();
            if keep_alive.is_some() {
                return;
            }
            *keep_alive = Some(cancel_tx);
        }

        let agent = Arc::clone(self);
        let interval = self.keep_alive_interval;
        tokio::spawn(async move {
            loop {
                let timer = tokio::time::sleep(interval);
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => agent.send_keep_alives().await,
                    _ = cancel_rx.recv() => return,
                }
            }
        });
    }

    /// Emits STUN Binding indications over the pairs the strategy selects;
    /// indications never register a transaction.
    async fn send_keep_alives(&self) {
        let msg = match crate::transaction::build_binding_indication(&self.stun_config) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("[{}]: failed to build indication: {}", self.get_name(), err);
                return;
            }
        };

        let streams = self.stream_list();
        for stream in streams {
            for component in stream.components() {
                let pairs: Vec<Arc<CandidatePair>> = match self.keep_alive_strategy {
                    // SelectedAndTcp degenerates to SelectedOnly without TCP.
                    KeepAliveStrategy::SelectedOnly | KeepAliveStrategy::SelectedAndTcp => {
                        component.selected_pair().into_iter().collect()
                    }
                    KeepAliveStrategy::AllSucceeded => component
                        .valid_pairs()
                        .into_iter()
                        .filter(|p| p.state() == CandidatePairState::Succeeded)
                        .collect(),
                };

                for pair in pairs {
                    if let Err(err) = pair.write(&msg.raw).await {
                        log::trace!(
                            "[{}]: keep-alive send failed on {}: {}",
                            self.get_name(),
                            pair,
                            err
                        );
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket demultiplexing
    // ------------------------------------------------------------------

    /// Spawns the reader task for a socket-owning local candidate.
    pub(crate) async fn start_candidate(
        self: &Arc<Self>,
        stream: Arc<IceMediaStream>,
        component: Arc<Component>,
        candidate: Arc<dyn Candidate + Send + Sync>,
    ) {
        let conn = match candidate.get_conn() {
            Some(conn) => Arc::clone(conn),
            None => {
                log::error!("[{}]: can't start candidate without conn", self.get_name());
                return;
            }
        };

        let (closed_ch_tx, closed_ch_rx) = broadcast::channel(1);
        {
            let closed_ch = candidate.get_closed_ch();
            let mut closed = closed_ch.lock().await;
            *closed = Some(closed_ch_tx);
        }

        let worker = {
            let wg = self.worker_wg.lock();
            wg.as_ref().map(|wg| wg.worker())
        };

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let _worker = worker;
            let _ = agent
                .recv_loop(stream, component, candidate, closed_ch_rx, conn)
                .await;
        });
    }

    async fn recv_loop(
        self: &Arc<Self>,
        stream: Arc<IceMediaStream>,
        component: Arc<Component>,
        candidate: Arc<dyn Candidate + Send + Sync>,
        mut closed_ch_rx: broadcast::Receiver<()>,
        conn: Arc<dyn util::Conn + Send + Sync>,
    ) -> Result<()> {
        let local_addr = candidate.addr();
        let mut buffer = vec![0_u8; RECEIVE_MTU];
        let mut processed: u32 = 0;

        loop {
            let (n, src_addr) = tokio::select! {
                result = conn.recv_from(&mut buffer) => match result {
                    Ok((n, src)) => (n, src),
                    Err(err) => return Err(Error::Other(err.to_string())),
                },
                _ = closed_ch_rx.recv() => return Err(Error::ErrClosed),
            };

            self.handle_inbound(&stream, &component, &candidate, &buffer[..n], src_addr, local_addr)
                .await;

            // Cooperative yield so one busy socket can't monopolize the pool.
            processed = processed.wrapping_add(1);
            if processed % YIELD_AFTER_PACKETS == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Routes one datagram: STUN requests to the check server, responses to
    /// the transactional layer, indications to liveness, the rest to the
    /// component socket.
    pub(crate) async fn handle_inbound(
        self: &Arc<Self>,
        stream: &Arc<IceMediaStream>,
        component: &Arc<Component>,
        candidate: &Arc<dyn Candidate + Send + Sync>,
        buf: &[u8],
        src_addr: SocketAddr,
        local_addr: SocketAddr,
    ) {
        if !is_message(buf) {
            if let Err(err) = component.ingest(buf, src_addr).await {
                log::warn!("[{}]: failed to buffer packet: {}", self.get_name(), err);
            }
            return;
        }

        let mut msg = Message {
            raw: vec![],
            ..Message::default()
        };
        msg.raw.extend_from_slice(buf);
        if let Err(err) = msg.decode() {
            log::warn!(
                "[{}]: failed to decode STUN from {}: {}",
                self.get_name(),
                src_addr,
                err
            );
            return;
        }

        if msg.typ.method != METHOD_BINDING {
            log::trace!(
                "[{}]: unhandled STUN method from {}: {}",
                self.get_name(),
                src_addr,
                msg.typ
            );
            return;
        }

        candidate.seen(false);

        if msg.typ.class == CLASS_REQUEST {
            self.handle_binding_request(stream, component, candidate, msg, src_addr)
                .await;
        } else if msg.typ.class == CLASS_SUCCESS_RESPONSE || msg.typ.class == CLASS_ERROR_RESPONSE {
            if msg.typ.class == CLASS_SUCCESS_RESPONSE {
                let remote_pwd = self.ufrag_pwd.lock().remote_pwd.clone();
                if let Err(err) = assert_inbound_message_integrity(&mut msg, remote_pwd.as_bytes())
                {
                    log::warn!(
                        "[{}]: discard response from {}: {}",
                        self.get_name(),
                        src_addr,
                        err
                    );
                    return;
                }
            }

            if !self
                .transactions
                .complete(msg, src_addr, local_addr, &self.outcome_tx)
                .await
            {
                log::warn!(
                    "[{}]: discard response from {}: unknown transaction",
                    self.get_name(),
                    src_addr
                );
            }
        } else if msg.typ.class == CLASS_INDICATION {
            if let Some(remote) = component.find_remote_candidate(src_addr) {
                remote.seen(false);
            }
            if let Some(selected) = component.selected_pair() {
                if selected.remote.addr() == src_addr {
                    selected.stamp_consent_freshness();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    pub(crate) async fn close(&self) -> Result<()> {
        {
            let mut done_tx = self.done_tx.lock();
            if done_tx.is_none() {
                return Err(Error::ErrClosed);
            }
            done_tx.take();
        }

        self.stop_all_pace_makers();
        self.termination_timer_tx.lock().take();
        self.keep_alive_tx.lock().take();
        self.transactions.cancel_all();
        self.in_flight.lock().clear();

        let streams = self.stream_list();
        for stream in &streams {
            stream.check_list().disarm_grace_timer();
            stream.free(false).await;
        }

        let wg = self.worker_wg.lock().take();
        if let Some(wg) = wg {
            wg.wait().await;
        }

        self.set_processing_state(ProcessingState::Terminated);
        Ok(())
    }

    pub(crate) fn stop_all_pace_makers(&self) {
        self.pace_makers.lock().clear();
    }

    pub(crate) fn stop_pace_maker(&self, stream_name: &str) {
        self.pace_makers.lock().remove(stream_name);
    }
}

impl CredentialsAuthority for AgentInternal {
    fn local_key(&self, username: &str) -> Option<String> {
        let ufrag_pwd = self.ufrag_pwd.lock();
        let local_part = username.split(':').next()?;
        if local_part == ufrag_pwd.local_ufrag {
            Some(ufrag_pwd.local_pwd.clone())
        } else {
            None
        }
    }

    fn remote_key(&self, _username: &str, media: &str) -> Option<String> {
        if self.get_stream(media).is_none() {
            return None;
        }
        let ufrag_pwd = self.ufrag_pwd.lock();
        if ufrag_pwd.remote_pwd.is_empty() {
            None
        } else {
            Some(ufrag_pwd.remote_pwd.clone())
        }
    }
}
