//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetworkConfig (validated, immutable)
//!     → handed to Network::new and the netloop binary
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::BufferConfig;
pub use schema::EventLoopConfig;
pub use schema::NetworkConfig;
pub use schema::ObservabilityConfig;
pub use schema::TlsConfig;
