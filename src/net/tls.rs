//! TLS engine and certificate loading.
//!
//! # Responsibilities
//! - Adapt a rustls connection to the wrap/unwrap [`CryptoEngine`] contract
//! - Build server and client configurations from PEM material
//! - Hand out a fresh engine per channel through [`TlsSettings`]

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};

use crate::config::TlsConfig;
use crate::error::CryptoError;
use crate::net::crypto::{
    CryptoEngine, Encryption, EngineFactory, EngineResult, HandshakeStatus, Status,
};

/// A rustls client or server connection driven through caller buffers.
pub struct TlsEngine {
    conn: Connection,
    /// Plaintext rustls has decrypted but we have not handed out yet.
    pending_plaintext: usize,
    peer_closed: bool,
    inbound_closed: bool,
    outbound_closing: bool,
    close_notify_sent: bool,
    finished_reported: bool,
}

impl TlsEngine {
    pub fn new(conn: impl Into<Connection>) -> Self {
        Self {
            conn: conn.into(),
            pending_plaintext: 0,
            peer_closed: false,
            inbound_closed: false,
            outbound_closing: false,
            close_notify_sent: false,
            finished_reported: false,
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, CryptoError> {
        Ok(Self::new(ServerConnection::new(config)?))
    }

    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, CryptoError> {
        Ok(Self::new(ClientConnection::new(config, server_name)?))
    }

    fn drain_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, CryptoError> {
        let mut produced = 0;
        while self.pending_plaintext > 0 && produced < dst.len() {
            match self.conn.reader().read(&mut dst[produced..]) {
                Ok(0) => break,
                Ok(n) => {
                    produced += n;
                    self.pending_plaintext = self.pending_plaintext.saturating_sub(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending_plaintext = 0;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(produced)
    }
}

impl CryptoEngine for TlsEngine {
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            produced += self.drain_plaintext(&mut dst[produced..])?;
            if self.pending_plaintext > 0 {
                return Ok(EngineResult::new(Status::BufferOverflow, consumed, produced));
            }
            if consumed == src.len() || self.inbound_closed || self.peer_closed {
                break;
            }

            // read_tls treats a zero-length read as end of stream.
            let mut records = &src[consumed..];
            let n = self.conn.read_tls(&mut records)?;
            if n == 0 {
                break;
            }
            consumed += n;

            let state = self.conn.process_new_packets()?;
            self.pending_plaintext = state.plaintext_bytes_to_read();
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }

        let status = if self.peer_closed || self.inbound_closed {
            Status::Closed
        } else if consumed == 0 && produced == 0 {
            Status::BufferUnderflow
        } else {
            Status::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
        // A handshake may never complete, so closing during one alerts the
        // peer at once. Plaintext buffered behind the handshake is dropped.
        if self.outbound_closing && !self.close_notify_sent && self.conn.is_handshaking() {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }

        let mut consumed = 0;
        if !src.is_empty() && !self.close_notify_sent {
            consumed = self.conn.writer().write(src)?;
        }
        if self.outbound_closing && !self.close_notify_sent && consumed == src.len() {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }

        let mut produced = 0;
        while self.conn.wants_write() {
            if produced == dst.len() {
                return Ok(EngineResult::new(Status::BufferOverflow, consumed, produced));
            }
            let mut out = &mut dst[produced..];
            let n = self.conn.write_tls(&mut out)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        let status = if self.close_notify_sent && !self.conn.wants_write() {
            Status::Closed
        } else {
            Status::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.finished_reported {
            self.finished_reported = true;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn close_inbound(&mut self) {
        self.inbound_closed = true;
    }

    fn close_outbound(&mut self) {
        self.outbound_closing = true;
    }
}

impl fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match &self.conn {
            Connection::Client(_) => "client",
            Connection::Server(_) => "server",
        };
        f.debug_struct("TlsEngine")
            .field("side", &side)
            .field("handshaking", &self.conn.is_handshaking())
            .field("peer_closed", &self.peer_closed)
            .field("close_notify_sent", &self.close_notify_sent)
            .finish()
    }
}

/// TLS configuration for `bind` (server side) and `connect` (client side).
#[derive(Clone, Default)]
pub struct TlsSettings {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl TlsSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for accepted connections.
    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Use `config` for outbound connections, expecting `server_name` in
    /// the peer's certificate.
    pub fn with_client_config(
        mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, CryptoError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| CryptoError::Config(format!("invalid server name '{server_name}'")))?;
        self.client = Some((config, name));
        Ok(self)
    }

    /// Load whatever material `config` names.
    pub fn from_config(config: &TlsConfig) -> Result<Self, CryptoError> {
        let mut settings = Self::new();
        if let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) {
            let server = load_server_config(Path::new(cert_path), Path::new(key_path))?;
            settings = settings.with_server_config(server);
        }
        if let Some(ca_path) = &config.ca_cert_path {
            let client = load_client_config(Path::new(ca_path))?;
            settings = settings.with_client_config(client, &config.server_name)?;
        }
        tracing::debug!(
            server = settings.server.is_some(),
            client = settings.client.is_some(),
            "TLS settings loaded"
        );
        Ok(settings)
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Share these settings as the encryption of a `bind` or `connect`.
    pub fn encryption(self) -> Encryption {
        Arc::new(self)
    }
}

impl EngineFactory for TlsSettings {
    fn server_engine(&self) -> Result<Box<dyn CryptoEngine>, CryptoError> {
        let config = self.server.clone().ok_or(CryptoError::MissingConfig("server"))?;
        Ok(Box::new(TlsEngine::server(config)?))
    }

    fn client_engine(&self) -> Result<Box<dyn CryptoEngine>, CryptoError> {
        let (config, name) = self.client.clone().ok_or(CryptoError::MissingConfig("client"))?;
        Ok(Box::new(TlsEngine::client(config, name)?))
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server", &self.server.is_some())
            .field("client", &self.client.as_ref().map(|(_, name)| name))
            .finish()
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a server configuration from a PEM certificate chain and private key.
pub fn server_config_from_pem(
    cert_pem: &mut dyn io::BufRead,
    key_pem: &mut dyn io::BufRead,
) -> Result<Arc<ServerConfig>, CryptoError> {
    let certs = rustls_pemfile::certs(cert_pem)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if certs.is_empty() {
        return Err(CryptoError::Config("no certificates found".to_string()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(key_pem)?
        .ok_or_else(|| CryptoError::Config("no private key found".to_string()))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build a client configuration trusting the certificates in a PEM bundle.
pub fn client_config_from_pem(
    ca_pem: &mut dyn io::BufRead,
) -> Result<Arc<ClientConfig>, CryptoError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(ca_pem) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        return Err(CryptoError::Config("no CA certificates found".to_string()));
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Load a server configuration from certificate and key files.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, CryptoError> {
    let mut certs = open_pem(cert_path, "Certificate")?;
    let mut key = open_pem(key_path, "Private key")?;
    server_config_from_pem(&mut certs, &mut key)
}

/// Load a client configuration from a CA bundle file.
pub fn load_client_config(ca_path: &Path) -> Result<Arc<ClientConfig>, CryptoError> {
    let mut ca = open_pem(ca_path, "CA certificate")?;
    client_config_from_pem(&mut ca)
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>, CryptoError> {
    if !path.exists() {
        return Err(CryptoError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{what} file not found: {path:?}"),
        )));
    }
    Ok(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TlsSettings {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        let server =
            server_config_from_pem(&mut cert_pem.as_bytes(), &mut key_pem.as_bytes()).unwrap();
        let client = client_config_from_pem(&mut cert_pem.as_bytes()).unwrap();
        TlsSettings::new()
            .with_server_config(server)
            .with_client_config(client, "localhost")
            .unwrap()
    }

    /// Move everything `from` wants to send into `to`, returning the plaintext `to` decoded.
    fn pump(from: &mut dyn CryptoEngine, to: &mut dyn CryptoEngine) -> (Vec<u8>, Status) {
        let mut wire = vec![0u8; 64 * 1024];
        let wrapped = from.wrap(&[], &mut wire).unwrap();
        let mut plain = vec![0u8; 64 * 1024];
        let unwrapped = to.unwrap(&wire[..wrapped.produced], &mut plain).unwrap();
        assert_eq!(unwrapped.consumed, wrapped.produced);
        (plain[..unwrapped.produced].to_vec(), unwrapped.status)
    }

    fn handshake(client: &mut dyn CryptoEngine, server: &mut dyn CryptoEngine) {
        for _ in 0..10 {
            pump(client, server);
            pump(server, client);
        }
    }

    #[test]
    fn client_starts_by_wrapping() {
        let mut client = settings().client_engine().unwrap();
        assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
        let mut server = settings().server_engine().unwrap();
        assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);
    }

    #[test]
    fn handshake_then_application_data() {
        let settings = settings();
        let mut client = settings.client_engine().unwrap();
        let mut server = settings.server_engine().unwrap();
        handshake(client.as_mut(), server.as_mut());

        assert_eq!(client.handshake_status(), HandshakeStatus::Finished);
        assert_eq!(client.handshake_status(), HandshakeStatus::NotHandshaking);
        assert_eq!(server.handshake_status(), HandshakeStatus::Finished);

        let mut wire = vec![0u8; 4096];
        let wrapped = client.wrap(b"hello", &mut wire).unwrap();
        assert_eq!(wrapped.consumed, 5);
        assert_eq!(wrapped.status, Status::Ok);

        let mut plain = vec![0u8; 4096];
        let unwrapped = server.unwrap(&wire[..wrapped.produced], &mut plain).unwrap();
        assert_eq!(&plain[..unwrapped.produced], b"hello");
    }

    #[test]
    fn small_destination_overflows() {
        let settings = settings();
        let mut client = settings.client_engine().unwrap();
        let mut server = settings.server_engine().unwrap();
        handshake(client.as_mut(), server.as_mut());

        let mut wire = vec![0u8; 4096];
        let wrapped = client.wrap(&[7u8; 100], &mut wire).unwrap();

        let mut plain = vec![0u8; 10];
        let first = server.unwrap(&wire[..wrapped.produced], &mut plain).unwrap();
        assert_eq!(first.status, Status::BufferOverflow);
        assert_eq!(first.produced, 10);

        let mut rest = vec![0u8; 200];
        let second = server
            .unwrap(&wire[first.consumed..wrapped.produced], &mut rest)
            .unwrap();
        assert_eq!(first.produced + second.produced, 100);
    }

    #[test]
    fn empty_input_underflows() {
        let mut server = settings().server_engine().unwrap();
        let mut plain = [0u8; 16];
        let result = server.unwrap(&[], &mut plain).unwrap();
        assert_eq!(result.status, Status::BufferUnderflow);
    }

    #[test]
    fn close_outbound_reaches_peer() {
        let settings = settings();
        let mut client = settings.client_engine().unwrap();
        let mut server = settings.server_engine().unwrap();
        handshake(client.as_mut(), server.as_mut());

        client.close_outbound();
        let mut wire = vec![0u8; 4096];
        let wrapped = client.wrap(&[], &mut wire).unwrap();
        assert_eq!(wrapped.status, Status::Closed);

        let mut plain = vec![0u8; 4096];
        let unwrapped = server.unwrap(&wire[..wrapped.produced], &mut plain).unwrap();
        assert_eq!(unwrapped.status, Status::Closed);
    }

    #[test]
    fn close_during_handshake_alerts_immediately() {
        let mut client = settings().client_engine().unwrap();
        client.close_outbound();

        let mut wire = vec![0u8; 4096];
        let wrapped = client.wrap(b"never sent", &mut wire).unwrap();
        assert_eq!(wrapped.status, Status::Closed);
        assert_eq!(wrapped.consumed, 0);
        assert!(wrapped.produced > 0);
    }

    #[test]
    fn missing_side_is_reported() {
        let err = TlsSettings::new().client_engine().err().unwrap();
        assert!(matches!(err, CryptoError::MissingConfig("client")));
    }

    #[test]
    fn missing_pem_file_is_not_found() {
        let err = load_client_config(Path::new("/no/such/ca.pem")).unwrap_err();
        assert!(err.to_string().contains("CA certificate file not found"));
    }
}
