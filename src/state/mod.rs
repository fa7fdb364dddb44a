
use std::fmt;

use serde::{Deserialize, Serialize};

/// Global processing state of an ICE agent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Unspecified,

    /// The agent holds candidates but connectivity establishment has not started.
    Waiting,

    /// Connectivity checks are being exchanged.
    Running,

    /// Every stream has a nominated valid pair for every component.
    Completed,

    /// All check lists terminated and none completed.
    Failed,

    /// The termination delay elapsed; non-selected candidates are released.
    Terminated,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl From<u8> for ProcessingState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Failed,
            5 => Self::Terminated,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
            Self::Unspecified => "Unspecified",
        };
        write!(f, "{}", s)
    }
}

impl ProcessingState {
    /// Returns true once the agent reached Completed or a later state.
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    /// Returns true for the states an agent can never leave.
    #[must_use]
    pub fn is_over(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// State of a single check list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckListState {
    Unspecified,

    /// The list is active and checks may still be sent.
    Running,

    /// Every component of the stream has a nominated valid pair.
    Completed,

    /// The grace period expired without the valid list covering all components.
    Failed,
}

impl Default for CheckListState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl From<u8> for CheckListState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for CheckListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Unspecified => "Unspecified",
        };
        write!(f, "{}", s)
    }
}
