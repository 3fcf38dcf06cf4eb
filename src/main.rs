//! netloop command-line front end.
//!
//! ```text
//! netloop serve [--config FILE] [--bind ADDR] [--tls]
//!     → echo every received byte back to its sender
//!
//! netloop send [--config FILE] --connect ADDR [--tls] MESSAGE
//!     → send MESSAGE, print the reply, close
//! ```

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use netloop::config::loader::load_config;
use netloop::net::resolve;
use netloop::observability::{logging, metrics};
use netloop::{
    ChannelId, ConnectionStateListener, DataListener, Encryption, Network, NetworkConfig,
    ServerStateListener, TlsSettings,
};

#[derive(Parser)]
#[command(name = "netloop")]
#[command(about = "Single-threaded non-blocking TCP engine with optional TLS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides listener.bind_address
        #[arg(short, long)]
        bind: Option<String>,

        /// Encrypt accepted connections with the configured certificate
        #[arg(long)]
        tls: bool,
    },
    /// Send one message and print the reply
    Send {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides client.connect_address
        #[arg(long)]
        connect: Option<String>,

        /// Verify the server against the configured CA bundle
        #[arg(long)]
        tls: bool,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        message: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind, tls } => {
            let mut config = read_config(config)?;
            if let Some(bind) = bind {
                config.listener.bind_address = bind;
            }
            config.listener.tls |= tls;
            serve(config)
        }
        Commands::Send {
            config,
            connect,
            tls,
            timeout,
            message,
        } => {
            let mut config = read_config(config)?;
            if let Some(connect) = connect {
                config.client.connect_address = connect;
            }
            config.client.tls |= tls;
            send(config, message.as_bytes(), Duration::from_secs(timeout))
        }
    }
}

fn read_config(path: Option<PathBuf>) -> Result<NetworkConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => load_config(&path)?,
        None => NetworkConfig::default(),
    };
    if let Err(e) = logging::init_logging(&config.observability.log_level) {
        eprintln!("Logging already initialized: {e}");
    }
    metrics::init_metrics(&config.observability);
    Ok(config)
}

fn encryption(
    config: &NetworkConfig,
    enabled: bool,
) -> Result<Option<Encryption>, Box<dyn std::error::Error>> {
    if !enabled {
        return Ok(None);
    }
    let tls = config
        .tls
        .as_ref()
        .ok_or("TLS requested but the configuration has no [tls] section")?;
    Ok(Some(TlsSettings::from_config(tls)?.encryption()))
}

/// Queues every received chunk back onto the channel it came from.
struct Echo {
    network: Network,
}

impl DataListener for Echo {
    fn received(&self, data: &[u8], channel: ChannelId) {
        if let Err(e) = self.network.queue(data, channel) {
            tracing::warn!(channel = %channel, error = %e, "Echo failed");
        }
    }
}

impl ServerStateListener for Echo {
    fn bound(&self, listener: ChannelId) {
        if let Ok(addr) = self.network.local_addr(listener) {
            println!("listening on {addr}");
        }
    }

    fn accepted(&self, _listener: ChannelId, _connection: ChannelId) {}
}

fn serve(config: NetworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = resolve(&config.listener.bind_address)?;
    let encryption = encryption(&config, config.listener.tls)?;

    let network = Network::new(config)?;
    let echo = Arc::new(Echo {
        network: network.clone(),
    });
    network.register_data_listener(echo.clone());
    network.register_server_state_listener(echo);

    network.bring_up()?;
    network.bind(addr, encryption)?;
    while network.is_thread_alive() {
        std::thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}

/// Forwards replies and closure of one channel to the waiting main thread.
struct Reply {
    channel: parking_lot::Mutex<Option<ChannelId>>,
    tx: mpsc::Sender<Option<Vec<u8>>>,
}

impl Reply {
    fn concerns(&self, channel: ChannelId) -> bool {
        self.channel.lock().map_or(true, |expected| expected == channel)
    }
}

impl DataListener for Reply {
    fn received(&self, data: &[u8], channel: ChannelId) {
        if self.concerns(channel) {
            let _ = self.tx.send(Some(data.to_vec()));
        }
    }
}

impl ConnectionStateListener for Reply {
    fn connected(&self, _channel: ChannelId) {}

    fn closed(&self, channel: ChannelId, _reset_by_peer: bool) {
        if self.concerns(channel) {
            let _ = self.tx.send(None);
        }
    }
}

fn send(
    config: NetworkConfig,
    message: &[u8],
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = resolve(&config.client.connect_address)?;
    let encryption = encryption(&config, config.client.tls)?;

    let network = Network::new(config)?;
    let (tx, rx) = mpsc::channel();
    let reply = Arc::new(Reply {
        channel: parking_lot::Mutex::new(None),
        tx,
    });
    network.register_data_listener(reply.clone());
    network.register_connection_state_listener(reply.clone());

    network.bring_up()?;
    let channel = network.connect(addr, encryption)?;
    *reply.channel.lock() = Some(channel);
    network.queue(message, channel)?;

    let mut received = Vec::new();
    while received.len() < message.len() {
        match rx.recv_timeout(timeout) {
            Ok(Some(data)) => received.extend_from_slice(&data),
            Ok(None) => break,
            Err(_) => {
                eprintln!("no reply within {}s", timeout.as_secs());
                break;
            }
        }
    }
    println!("{}", String::from_utf8_lossy(&received));

    network.close(channel)?;
    std::thread::sleep(Duration::from_millis(100));
    network.stop_thread();
    Ok(())
}
