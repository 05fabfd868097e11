//! TLS/SSL support for MySQL connections.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends initial handshake with `CLIENT_SSL` capability
//! 2. If SSL is requested, client sends short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client performs TLS handshake on the same socket
//! 4. Client sends full handshake response over TLS, continuing the
//!    packet sequence numbering
//!
//! The TLS session is driven by rustls over the non-blocking
//! [`Socket`](crate::transport::Socket), so record I/O obeys the same
//! readiness waits and timeouts as plaintext I/O.

use std::path::{Path, PathBuf};

use mywire_core::Result;

use crate::config::{ClientConfig, SslMode};
use crate::error::{config_error, tls_error};
use crate::protocol::{PacketWriter, capabilities};
use crate::transport::{Socket, Transport};

/// TLS protocol versions that can bound the negotiation.
///
/// Only TLS 1.2 and 1.3 are ever offered; older bounds narrow the range
/// without enabling anything below 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        };
        f.write_str(s)
    }
}

/// TLS options: trust roots, revocation lists, client identity and the
/// negotiation bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file with trusted CA certificates
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files with trusted CA certificates
    pub ca_path: Option<PathBuf>,
    /// PEM file with certificate revocation lists
    pub crl_file: Option<PathBuf>,
    /// Directory of PEM files with certificate revocation lists
    pub crl_path: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    /// Allowed cipher suites by IANA name; empty allows the backend defaults
    pub ciphersuites: Vec<String>,
    /// Overrides the hostname used for SNI and identity verification
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn crl_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.crl_file = Some(path.into());
        self
    }

    pub fn crl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.crl_path = Some(path.into());
        self
    }

    /// Client certificate and private key for mutual TLS.
    pub fn identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    pub fn cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert = Some(path.into());
        self
    }

    pub fn key(mut self, path: impl Into<PathBuf>) -> Self {
        self.key = Some(path.into());
        self
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn ciphersuites<I, S>(mut self, suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphersuites = suites.into_iter().map(Into::into).collect();
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Reject inconsistent option combinations.
    pub fn validate(&self) -> Result<()> {
        match (&self.cert, &self.key) {
            (Some(_), None) => Err(config_error(
                "client certificate provided without a private key",
            )),
            (None, Some(_)) => Err(config_error(
                "client private key provided without a certificate",
            )),
            _ => Ok(()),
        }
    }

    /// Protocol versions to offer, intersected with what the backend supports.
    pub fn offered_versions(&self) -> Result<Vec<TlsVersion>> {
        let min = self.min_version.unwrap_or(TlsVersion::Tls12);
        let max = self.max_version.unwrap_or(TlsVersion::Tls13);
        let offered: Vec<TlsVersion> = [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| *v >= min && *v <= max)
            .collect();
        if offered.is_empty() {
            return Err(config_error(format!(
                "no supported TLS version between {} and {}",
                min, max
            )));
        }
        Ok(offered)
    }
}

/// Append the SSL request payload.
///
/// The packet is a prefix of the handshake response: capabilities (with
/// `CLIENT_SSL`), max packet size, charset and 23 reserved bytes.
pub fn write_ssl_request(
    writer: &mut PacketWriter,
    client_caps: u32,
    max_packet_size: u32,
    character_set: u8,
) {
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
}

/// Check if the server supports SSL/TLS.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
///
/// - `Ok(true)` if SSL should be used
/// - `Ok(false)` if SSL should not be used
/// - `Err(_)` if SSL is required but not supported by server
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(tls_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Read every PEM file in `dir` (or just `file`), in a stable order.
fn pem_sources(file: Option<&Path>, dir: Option<&Path>) -> Result<Vec<PathBuf>> {
    let mut sources: Vec<PathBuf> = file.map(Path::to_path_buf).into_iter().collect();
    if let Some(dir) = dir {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| tls_error(format!("failed to read '{}': {}", dir.display(), e)))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| tls_error(format!("failed to read '{}': {}", dir.display(), e)))?;
            let path = entry.path();
            if path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        sources.extend(found);
    }
    Ok(sources)
}

// ============================================================================
// TLS Stream Implementation (feature-gated)
// ============================================================================

#[cfg(feature = "tls")]
pub use stream::TlsStream;

#[cfg(feature = "tls")]
mod stream {
    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    use mywire_core::error::ConnectionErrorKind;
    use mywire_core::{Error, Result};
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
    use rustls::{
        CertificateError, DigitallySignedStruct, Error as RustlsError, RootCertStore,
        SignatureScheme,
    };

    use super::{TlsConfig, TlsVersion, pem_sources};
    use crate::config::SslMode;
    use crate::error::{connection_error, io_connection_error, tls_error};
    use crate::transport::Socket;

    /// A rustls client session over a non-blocking socket.
    pub struct TlsStream {
        conn: rustls::ClientConnection,
        socket: Socket,
    }

    impl std::fmt::Debug for TlsStream {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TlsStream")
                .field("protocol_version", &self.conn.protocol_version())
                .field("is_handshaking", &self.conn.is_handshaking())
                .field("socket", &self.socket)
                .finish()
        }
    }

    impl TlsStream {
        /// Wrap `socket` and run the TLS handshake to completion.
        pub fn connect(
            socket: Socket,
            tls_config: &TlsConfig,
            ssl_mode: SslMode,
            server_name: &str,
        ) -> Result<Self> {
            let config = build_client_config(tls_config, ssl_mode)?;

            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| tls_error(format!("invalid server name '{}': {}", server_name, e)))?;

            let conn = rustls::ClientConnection::new(Arc::new(config), name)
                .map_err(|e| tls_error(format!("failed to create TLS connection: {}", e)))?;

            let mut stream = TlsStream { conn, socket };
            stream.handshake().map_err(|e| match e {
                Error::Timeout => Error::Timeout,
                e if e.is_tls_error() => e,
                e => tls_error(format!("TLS handshake failed: {}", e)),
            })?;

            tracing::debug!(
                version = ?stream.conn.protocol_version(),
                cipher = ?stream.conn.negotiated_cipher_suite().map(|s| s.suite()),
                "TLS established"
            );
            Ok(stream)
        }

        fn handshake(&mut self) -> Result<()> {
            let read_deadline = self.socket.read_deadline();
            let write_deadline = self.socket.write_deadline();
            while self.conn.is_handshaking() {
                self.flush_tls(write_deadline)?;
                if self.conn.is_handshaking() && self.conn.wants_read() {
                    self.fill_tls(read_deadline)?;
                }
            }
            self.flush_tls(write_deadline)
        }

        pub(crate) fn socket(&self) -> &Socket {
            &self.socket
        }

        pub(crate) fn socket_mut(&mut self) -> &mut Socket {
            &mut self.socket
        }

        /// Send all pending TLS records.
        fn flush_tls(&mut self, deadline: Option<Instant>) -> Result<()> {
            while self.conn.wants_write() {
                match self.conn.write_tls(self.socket.stream_mut()) {
                    Ok(0) => {
                        return Err(connection_error(
                            ConnectionErrorKind::Disconnected,
                            "connection closed while writing",
                        ));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.socket.wait_writable(deadline)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(io_connection_error(
                            ConnectionErrorKind::Disconnected,
                            "TLS write failed",
                            e,
                        ));
                    }
                }
            }
            Ok(())
        }

        /// Receive at least one chunk of TLS records and process it.
        fn fill_tls(&mut self, deadline: Option<Instant>) -> Result<()> {
            loop {
                match self.conn.read_tls(self.socket.stream_mut()) {
                    Ok(0) => {
                        return Err(connection_error(
                            ConnectionErrorKind::Disconnected,
                            "connection closed by server",
                        ));
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.socket.wait_readable(deadline)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(io_connection_error(
                            ConnectionErrorKind::Disconnected,
                            "TLS read failed",
                            e,
                        ));
                    }
                }
            }

            if let Err(e) = self.conn.process_new_packets() {
                // Deliver the alert rustls queued, if the socket still takes it.
                let _ = self.flush_tls(self.socket.write_deadline());
                return Err(tls_error(format!("TLS error: {}", e)));
            }
            Ok(())
        }

        /// Read decrypted bytes. One deadline covers every record needed.
        pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let read_deadline = self.socket.read_deadline();
            let write_deadline = self.socket.write_deadline();
            loop {
                match self.conn.reader().read(buf) {
                    Ok(0) if !buf.is_empty() => {
                        return Err(connection_error(
                            ConnectionErrorKind::Disconnected,
                            "connection closed by server",
                        ));
                    }
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        return Err(io_connection_error(
                            ConnectionErrorKind::Disconnected,
                            "TLS read failed",
                            e,
                        ));
                    }
                }
                self.flush_tls(write_deadline)?;
                self.fill_tls(read_deadline)?;
            }
        }

        pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let n = self
                .conn
                .writer()
                .write(buf)
                .map_err(|e| tls_error(format!("TLS write failed: {}", e)))?;
            self.flush_tls(self.socket.write_deadline())?;
            Ok(n)
        }

        pub fn close(&mut self) {
            self.conn.send_close_notify();
            let _ = self.flush_tls(self.socket.write_deadline());
            self.socket.close();
        }
    }

    fn crypto_provider(tls_config: &TlsConfig) -> Result<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !tls_config.ciphersuites.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                tls_config
                    .ciphersuites
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(&name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(tls_error(format!(
                    "none of the configured cipher suites are supported: {}",
                    tls_config.ciphersuites.join(", ")
                )));
            }
        }
        Ok(provider)
    }

    /// Build a rustls ClientConfig based on TLS configuration and SSL mode.
    pub(super) fn build_client_config(
        tls_config: &TlsConfig,
        ssl_mode: SslMode,
    ) -> Result<rustls::ClientConfig> {
        if ssl_mode == SslMode::Disable {
            return Err(tls_error("TLS requested with SslMode::Disable"));
        }
        tls_config.validate()?;

        let provider = Arc::new(crypto_provider(tls_config)?);
        let versions: Vec<&'static rustls::SupportedProtocolVersion> = tls_config
            .offered_versions()?
            .into_iter()
            .map(|v| match v {
                TlsVersion::Tls13 => &rustls::version::TLS13,
                _ => &rustls::version::TLS12,
            })
            .collect();

        let verifier: Arc<dyn ServerCertVerifier> = if ssl_mode.verifies_chain() {
            let roots = load_roots(tls_config)?;
            let crls = load_crls(tls_config)?;
            let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .with_crls(crls)
                .build()
                .map_err(|e| tls_error(format!("failed to build certificate verifier: {}", e)))?;
            if ssl_mode.verifies_hostname() {
                webpki
            } else {
                Arc::new(ChainOnlyVerifier { inner: webpki })
            }
        } else {
            Arc::new(NoVerifier {
                schemes: provider
                    .signature_verification_algorithms
                    .supported_schemes(),
            })
        };

        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(|e| tls_error(format!("failed to set TLS versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        add_client_auth(builder, tls_config)
    }

    fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>> {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| tls_error(format!("failed to open {} '{}': {}", what, path.display(), e)))
    }

    fn load_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = open_pem(path, what)?;
        rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| tls_error(format!("failed to parse {} '{}': {}", what, path.display(), e)))
    }

    /// Trust roots from the CA file/directory, or the bundled webpki roots.
    fn load_roots(tls_config: &TlsConfig) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        let sources = pem_sources(tls_config.ca_file.as_deref(), tls_config.ca_path.as_deref())?;

        if sources.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(roots);
        }

        for path in &sources {
            for cert in load_certs(path, "CA certificate")? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error(format!("failed to add CA certificate: {}", e)))?;
            }
        }

        if roots.is_empty() {
            return Err(tls_error("no CA certificates found"));
        }
        Ok(roots)
    }

    fn load_crls(tls_config: &TlsConfig) -> Result<Vec<CertificateRevocationListDer<'static>>> {
        let mut crls = Vec::new();
        for path in pem_sources(tls_config.crl_file.as_deref(), tls_config.crl_path.as_deref())? {
            let mut reader = open_pem(&path, "CRL")?;
            for crl in rustls_pemfile::crls(&mut reader) {
                crls.push(crl.map_err(|e| {
                    tls_error(format!("failed to parse CRL '{}': {}", path.display(), e))
                })?);
            }
        }
        Ok(crls)
    }

    /// Add client authentication if configured.
    fn add_client_auth(
        builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
        tls_config: &TlsConfig,
    ) -> Result<rustls::ClientConfig> {
        let (Some(cert_path), Some(key_path)) = (&tls_config.cert, &tls_config.key) else {
            return Ok(builder.with_no_client_auth());
        };

        let certs = load_certs(cert_path, "client certificate")?;
        if certs.is_empty() {
            return Err(tls_error(format!(
                "no certificates found in client cert file '{}'",
                cert_path.display()
            )));
        }

        let mut key_reader = open_pem(key_path, "client key")?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| tls_error(format!("failed to parse client key: {}", e)))?
            .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error(format!("failed to configure client auth: {}", e)))
    }

    /// Accepts any server certificate. Used by the unverified modes.
    #[derive(Debug)]
    struct NoVerifier {
        schemes: Vec<SignatureScheme>,
    }

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.schemes.clone()
        }
    }

    /// Verifies the chain against the trust roots but not the hostname.
    #[derive(Debug)]
    struct ChainOnlyVerifier {
        inner: Arc<WebPkiServerVerifier>,
    }

    fn is_name_mismatch(err: &CertificateError) -> bool {
        matches!(
            err,
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    }

    impl ServerCertVerifier for ChainOnlyVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(RustlsError::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
                    Ok(ServerCertVerified::assertion())
                }
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }

}

/// Upgrade a plaintext socket to TLS using the connection's settings.
#[cfg(feature = "tls")]
pub(crate) fn upgrade(socket: Socket, config: &ClientConfig) -> Result<Transport> {
    let stream = TlsStream::connect(
        socket,
        &config.tls,
        config.ssl_mode,
        config.tls_server_name(),
    )?;
    Ok(Transport::Tls(Box::new(stream)))
}

#[cfg(not(feature = "tls"))]
pub(crate) fn upgrade(mut socket: Socket, config: &ClientConfig) -> Result<Transport> {
    let _ = config;
    socket.close();
    Err(tls_error(
        "TLS support requires the 'tls' feature of mywire",
    ))
}
