//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     start_thread → LoopState::Running → bring_up opens the selector
//!
//! Shutdown (shutdown.rs):
//!     stop_thread → bring_down (tear down channels) → signal → join
//! ```
//!
//! # Design Decisions
//! - Bring-up and bring-down are idempotent and callable from any thread
//! - Stopping never waits on a blocked poll: the selector is woken first

pub mod shutdown;
pub mod state;

pub use shutdown::Shutdown;
pub use state::LoopState;
