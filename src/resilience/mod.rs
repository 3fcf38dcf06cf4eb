//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Event loop iteration fails:
//!     → backoff.rs (spend the error budget, then pause linearly longer)
//! Iteration succeeds:
//!     → budget restored
//! ```
//!
//! # Design Decisions
//! - A persistently failing descriptor must not spin the loop thread
//! - The pause is interruptible so stopping the engine stays prompt

pub mod backoff;

pub use backoff::ErrorThrottle;
