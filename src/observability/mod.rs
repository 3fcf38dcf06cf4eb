//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Event loop, listeners, connections produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges)
//!     → diagnostics.rs (per-channel key state changes, buffer gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape, when enabled)
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until a recorder is installed
//! - Diagnostics only log when a channel's state actually changes

pub mod diagnostics;
pub mod logging;
pub mod metrics;
