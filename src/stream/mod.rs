#[cfg(test)]
mod stream_test;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use util::sync::Mutex as SyncMutex;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, MAX_COMPONENT_ID};
use crate::checklist::CheckList;
use crate::component::Component;
use crate::error::*;
use crate::events::EventBus;
use crate::state::CheckListState;

/// A named group of components sharing one pair of local/remote ICE
/// credentials: usually one media description of the session.
pub struct IceMediaStream {
    name: String,
    components: SyncMutex<Vec<Arc<Component>>>,
    check_list: Arc<CheckList>,
    valid_list: SyncMutex<Vec<Arc<CandidatePair>>>,
    events: EventBus,
}

impl IceMediaStream {
    /// Streams share the owning agent's event bus so that one subscription
    /// observes the whole session.
    #[must_use]
    pub fn new(name: &str, max_check_list_size: usize, events: EventBus) -> Self {
        Self {
            name: name.to_owned(),
            components: SyncMutex::new(vec![]),
            check_list: Arc::new(CheckList::new(name, max_check_list_size, events.clone())),
            valid_list: SyncMutex::new(vec![]),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn check_list(&self) -> &Arc<CheckList> {
        &self.check_list
    }

    /// Creates the component with the given id (1 = RTP, 2 = RTCP).
    pub fn create_component(&self, component_id: u16) -> Result<Arc<Component>> {
        if component_id == 0 || component_id > MAX_COMPONENT_ID {
            return Err(Error::ErrComponentIdOutOfRange);
        }

        let mut components = self.components.lock();
        if components.iter().any(|c| c.id() == component_id) {
            return Err(Error::ErrComponentAlreadyExists);
        }

        let component = Arc::new(Component::new(component_id, &self.name, self.events.clone()));
        components.push(component.clone());
        Ok(component)
    }

    pub fn get_component(&self, component_id: u16) -> Option<Arc<Component>> {
        let components = self.components.lock();
        components.iter().find(|c| c.id() == component_id).cloned()
    }

    /// Components in creation order.
    pub fn components(&self) -> Vec<Arc<Component>> {
        self.components.lock().clone()
    }

    /// Finds the local candidate a datagram arrived on, across components.
    pub fn find_local_candidate(&self, addr: SocketAddr) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let components = self.components.lock();
        components.iter().find_map(|c| c.find_local_candidate(addr))
    }

    /// Adds a pair confirmed by a symmetric Binding round-trip. A Succeeded
    /// pair always has an entry here.
    pub fn add_to_valid_list(&self, pair: Arc<CandidatePair>) {
        pair.validated
            .store(true, std::sync::atomic::Ordering::SeqCst);

        {
            let mut valid = self.valid_list.lock();
            if !valid.iter().any(|p| **p == *pair) {
                valid.push(pair.clone());
            }
        }

        if let Some(component) = self.get_component(pair.local.component_id()) {
            component.add_valid_pair(pair);
        }
    }

    pub fn valid_list(&self) -> Vec<Arc<CandidatePair>> {
        self.valid_list.lock().clone()
    }

    /// True when every component is covered by at least one valid pair.
    pub fn valid_list_covers_components(&self) -> bool {
        let components = self.components.lock();
        let valid = self.valid_list.lock();

        components.iter().all(|component| {
            valid
                .iter()
                .any(|p| p.local.component_id() == component.id())
        })
    }

    /// The foundations present in the valid list; feeds cross-stream
    /// unfreezing.
    pub fn valid_foundations(&self) -> HashSet<String> {
        let valid = self.valid_list.lock();
        valid.iter().map(|p| p.foundation()).collect()
    }

    /// True when every component has a nominated pair in the valid list.
    pub fn all_components_nominated(&self) -> bool {
        let components = self.components.lock();
        let valid = self.valid_list.lock();

        !components.is_empty()
            && components.iter().all(|component| {
                valid
                    .iter()
                    .any(|p| p.local.component_id() == component.id() && p.nominated())
            })
    }

    /// Completes the check list once every component has a nominated valid
    /// pair. Returns true when the transition happened here.
    pub fn maybe_complete(&self) -> bool {
        if self.check_list.state() != CheckListState::Running {
            return false;
        }
        if !self.all_components_nominated() {
            return false;
        }

        self.check_list.set_state(CheckListState::Completed)
    }

    /// Releases every component's candidates, keeping the selected pairs'
    /// sockets alive when `keep_selected` is set.
    pub async fn free(&self, keep_selected: bool) {
        let components = self.components();
        for component in components {
            let keep = if keep_selected {
                component.selected_pair()
            } else {
                None
            };
            component.free(keep.as_deref()).await;
        }
    }
}
