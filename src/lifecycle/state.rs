//! Event loop lifecycle states.

use std::fmt;

/// Where the network thread is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// No thread has been started.
    #[default]
    NotStarted,
    /// The thread is iterating.
    Running,
    /// The thread has left its loop.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::NotStarted => "not started",
            LoopState::Running => "running",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
