#[cfg(test)]
mod agent_test;

pub mod agent_config;
pub(crate) mod agent_checker;
pub(crate) mod agent_internal;
pub(crate) mod agent_server;
pub mod agent_stats;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use util::vnet::net::Net;

use agent_config::AgentConfig;
use agent_internal::AgentInternal;

use crate::candidate::candidate_base::CandidateDescriptor;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::Candidate;
use crate::component::component_socket::ComponentSocket;
use crate::component::Component;
use crate::error::*;
use crate::events::StreamEvent;
use crate::harvest::{CandidateHarvester, HostHarvester};
use crate::rand::{generate_pwd, generate_ufrag};
use crate::state::ProcessingState;
use crate::stream::IceMediaStream;

pub type OnProcessingStateChangeHdlrFn = Box<
    dyn (FnMut(ProcessingState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnSelectedPairChangeHdlrFn = Box<
    dyn (FnMut(
            &Arc<dyn Candidate + Send + Sync>,
            &Arc<dyn Candidate + Send + Sync>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

/// Represents the ICE agent: the owner of media streams, their components and
/// check lists, and the driver of connectivity establishment.
pub struct Agent {
    pub(crate) internal: Arc<AgentInternal>,

    pub(crate) harvesters: Vec<Arc<dyn CandidateHarvester>>,
    pub(crate) net: Arc<Net>,
    pub(crate) use_component_socket: bool,
}

impl Agent {
    /// Creates a new Agent. Local credentials follow the ICE grammar: the
    /// ufrag carries at least 4 ice-chars, the password at least 22.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let mut local_ufrag = config.local_ufrag.clone();
        if local_ufrag.is_empty() {
            local_ufrag = generate_ufrag();
        }
        let mut local_pwd = config.local_pwd.clone();
        if local_pwd.is_empty() {
            local_pwd = generate_pwd();
        }

        if local_ufrag.len() < 4 || local_ufrag.len() > 256 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if local_pwd.len() < 22 || local_pwd.len() > 256 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        let net = config
            .net
            .clone()
            .unwrap_or_else(|| Arc::new(Net::new(None)));

        let mut harvesters = config.harvesters.clone();
        if config.use_dynamic_host_harvester {
            harvesters.push(Arc::new(HostHarvester::new(
                Arc::clone(&net),
                config.local_addresses.clone(),
                config.port_min,
                config.port_max,
            )));
        }

        let use_component_socket = config.use_component_socket;
        let internal = Arc::new(AgentInternal::new(&config));
        {
            let mut ufrag_pwd = internal.ufrag_pwd.lock();
            ufrag_pwd.local_ufrag = local_ufrag;
            ufrag_pwd.local_pwd = local_pwd;
        }

        Ok(Self {
            internal,
            harvesters,
            net,
            use_component_socket,
        })
    }

    /// Returns the local user credentials for the offer/answer exchange.
    pub fn get_local_user_credentials(&self) -> (String, String) {
        let ufrag_pwd = self.internal.ufrag_pwd.lock();
        (ufrag_pwd.local_ufrag.clone(), ufrag_pwd.local_pwd.clone())
    }

    pub fn create_media_stream(&self, name: &str) -> Result<Arc<IceMediaStream>> {
        self.internal.create_media_stream(name)
    }

    pub fn get_stream(&self, name: &str) -> Option<Arc<IceMediaStream>> {
        self.internal.get_stream(name)
    }

    pub fn streams(&self) -> Vec<Arc<IceMediaStream>> {
        self.internal.stream_list()
    }

    pub fn create_component(&self, stream_name: &str, component_id: u16) -> Result<Arc<Component>> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;
        stream.create_component(component_id)
    }

    /// Runs the registered harvesters over every component of the stream.
    pub async fn gather_candidates(&self, stream_name: &str) -> Result<()> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;
        self.internal
            .gather_candidates(&stream, &self.harvesters)
            .await
    }

    /// Adds one pre-built local candidate (tests and embedders).
    pub async fn add_local_candidate(
        &self,
        stream_name: &str,
        candidate: Arc<dyn Candidate + Send + Sync>,
    ) -> Result<bool> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;
        let component = stream
            .get_component(candidate.component_id())
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(self
            .internal
            .add_local_candidate(&stream, &component, candidate)
            .await)
    }

    /// The local candidates of a stream in descriptor form, for the
    /// offer/answer boundary.
    pub fn local_candidate_descriptors(&self, stream_name: &str) -> Result<Vec<CandidateDescriptor>> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;

        let mut descriptors = vec![];
        for component in stream.components() {
            for candidate in component.local_candidates() {
                descriptors.push(CandidateDescriptor::from_candidate(&*candidate));
            }
        }
        Ok(descriptors)
    }

    /// Adds peer candidates, deduplicating trickle updates by transport
    /// address and type.
    pub fn add_remote_candidates(
        &self,
        stream_name: &str,
        descriptors: &[CandidateDescriptor],
    ) -> Result<()> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;

        for descriptor in descriptors {
            let remote = descriptor.to_remote_candidate()?;
            self.internal
                .add_remote_candidate(&stream, Arc::new(remote))?;
        }
        Ok(())
    }

    /// Starts connectivity establishment with the peer's credentials.
    /// Calling it again is a no-op.
    pub async fn start_connectivity_establishment(
        &self,
        remote_ufrag: &str,
        remote_pwd: &str,
    ) -> Result<()> {
        self.internal
            .start_connectivity_establishment(remote_ufrag.to_owned(), remote_pwd.to_owned())
            .await
    }

    pub fn set_controlling(&self, controlling: bool) {
        self.internal.set_role(controlling);
    }

    pub fn is_controlling(&self) -> bool {
        self.internal.is_controlling.load(Ordering::SeqCst)
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.internal.processing_state()
    }

    /// Application-driven nomination (`NominationStrategy::None`): nominates
    /// the valid pair with the given addresses.
    pub async fn nominate(
        &self,
        stream_name: &str,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;

        let pair = stream
            .valid_list()
            .into_iter()
            .find(|p| p.local.addr() == local && p.remote.addr() == remote)
            .ok_or(Error::ErrPairNotValidated)?;

        self.internal.nominate(&stream, &pair).await
    }

    /// The selected pair of a component, if nomination confirmed one.
    pub fn get_selected_pair(
        &self,
        stream_name: &str,
        component_id: u16,
    ) -> Option<Arc<CandidatePair>> {
        let stream = self.internal.get_stream(stream_name)?;
        let component = stream.get_component(component_id)?;
        component.selected_pair()
    }

    /// A demultiplexing socket over all pairs of the component.
    pub fn component_socket(
        &self,
        stream_name: &str,
        component_id: u16,
    ) -> Result<Arc<ComponentSocket>> {
        if !self.use_component_socket {
            return Err(Error::Other("component socket disabled".to_owned()));
        }

        let stream = self
            .internal
            .get_stream(stream_name)
            .ok_or(Error::ErrUnknownStream)?;
        let component = stream
            .get_component(component_id)
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(Arc::new(ComponentSocket::new(component)))
    }

    /// Subscribes to the typed property-change bus.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.internal.events.subscribe()
    }

    /// Sets a handler that is fired when the processing state changes.
    pub fn on_processing_state_change(&self, f: OnProcessingStateChangeHdlrFn) {
        self.internal
            .on_processing_state_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired when a component's selected pair is set.
    pub fn on_selected_candidate_pair_change(&self, f: OnSelectedPairChangeHdlrFn) {
        self.internal
            .on_selected_pair_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Cleans up the Agent.
    pub async fn close(&self) -> Result<()> {
        self.internal.close().await
    }
}
