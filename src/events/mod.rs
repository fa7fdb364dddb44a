
use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::candidate::CandidatePairState;
use crate::state::{CheckListState, ProcessingState};

const EVENT_BUS_CAPACITY: usize = 64;

/// A property change somewhere in the agent, delivered synchronously to
/// in-process subscribers. Subscribers hold only a receiver, never the
/// source, so tearing a stream down cannot leave reference cycles behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A pair moved through its five-state machine.
    PairStateChanged {
        stream: String,
        local: SocketAddr,
        remote: SocketAddr,
        state: CandidatePairState,
    },

    /// A check list changed state.
    CheckListStateChanged {
        stream: String,
        state: CheckListState,
    },

    /// The agent's global processing state changed.
    ProcessingStateChanged { state: ProcessingState },

    /// A component's selected pair was set.
    SelectedPairChanged {
        stream: String,
        component_id: u16,
        local: SocketAddr,
        remote: SocketAddr,
    },

    /// A local candidate was adopted by a component.
    CandidateAdded {
        stream: String,
        component_id: u16,
        addr: SocketAddr,
    },
}

/// Typed broadcast channel for [`StreamEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
