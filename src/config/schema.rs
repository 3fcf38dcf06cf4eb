//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine
//! and the `netloop` binary. All types derive Serde traits for
//! deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Where the `serve` command listens.
    pub listener: ListenerConfig,

    /// Where the `send` command connects.
    pub client: ClientConfig,

    /// Buffer sizing.
    pub buffers: BufferConfig,

    /// Event loop tuning.
    pub event_loop: EventLoopConfig,

    /// Optional TLS material.
    pub tls: Option<TlsConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7070").
    pub bind_address: String,

    /// Encrypt accepted connections with the `[tls]` section.
    pub tls: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7070".to_string(),
            tls: false,
        }
    }
}

/// Outbound connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote address (e.g., "127.0.0.1:7070").
    pub connect_address: String,

    /// Encrypt the connection with the `[tls]` section.
    pub tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_address: "127.0.0.1:7070".to_string(),
            tls: false,
        }
    }
}

/// Per-channel buffer sizing.
///
/// Buffers start at these sizes and grow by the same amount whenever they
/// fill up.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Read buffer and application data buffer increment, in bytes.
    pub read_increment: usize,

    /// Network write buffer increment, in bytes.
    pub write_increment: usize,

    /// Application write-queue increment, in bytes.
    pub write_queue_increment: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_increment: 1024,
            write_increment: 1024,
            write_queue_increment: 10 * 1024,
        }
    }
}

/// Event loop tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Upper bound on one selector wait, in milliseconds. 0 waits until an
    /// event or a wake-up arrives.
    pub poll_timeout_ms: u64,

    /// Readiness events fetched per selector wait.
    pub event_capacity: usize,

    /// Consecutive failed iterations tolerated before backing off.
    pub error_budget: u32,

    /// Backoff added per failure beyond the budget, in milliseconds.
    pub backoff_step_ms: u64,

    /// Maximum backoff, in milliseconds.
    pub max_backoff_ms: u64,

    /// Maximum concurrently running handshake task threads.
    pub handshake_task_limit: usize,

    /// How long one wait for the selector to open may block, in milliseconds.
    pub bring_up_wait_ms: u64,
}

impl EventLoopConfig {
    /// The selector wait bound, `None` for unbounded.
    pub fn poll_timeout(&self) -> Option<Duration> {
        match self.poll_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            event_capacity: 1024,
            error_budget: 10,
            backoff_step_ms: 1000,
            max_backoff_ms: 30_000,
            handshake_task_limit: 4,
            bring_up_wait_ms: 10_000,
        }
    }
}

/// TLS material, loaded from PEM files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Certificate chain presented by servers (PEM).
    pub cert_path: Option<String>,

    /// Private key matching `cert_path` (PEM).
    pub key_path: Option<String>,

    /// CA bundle trusted by clients (PEM).
    pub ca_cert_path: Option<String>,

    /// Name clients expect in the server certificate.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log readiness and handshake state changes per channel.
    pub key_state_diagnostics: bool,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            key_state_diagnostics: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
