//! Client configuration.
//!
//! Provides connection parameters (target, credentials, timeouts, TLS and
//! capability toggles) and the query flags that control result casting.

use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{capabilities, charset};
use crate::tls::TlsConfig;

/// Default unix socket path when neither a host nor a socket is configured.
pub const DEFAULT_SOCKET: &str = "/tmp/mysql.sock";

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 3306;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Use SSL when the server offers it, without certificate checks
    Preferred,
    /// Require SSL, without certificate checks
    Required,
    /// Require SSL and verify the certificate chain
    VerifyCa,
    /// Require SSL and verify the chain and the server hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    /// Whether the certificate chain is checked against trusted roots.
    pub const fn verifies_chain(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyIdentity)
    }

    /// Whether the certificate must match the server hostname.
    pub const fn verifies_hostname(self) -> bool {
        matches!(self, SslMode::VerifyIdentity)
    }
}

/// Bitmask controlling how result cells are cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Cast cells to typed values; without it every cell is raw bytes.
    pub const CAST: QueryFlags = QueryFlags(1);
    /// BIT(1) and TINYINT(1) become booleans.
    pub const CAST_BOOLEANS: QueryFlags = QueryFlags(2);
    /// Interpret DATETIME/TIMESTAMP/TIME in the local time zone instead of UTC.
    pub const LOCAL_TIMEZONE: QueryFlags = QueryFlags(4);
    /// Append all cells to one flat list instead of one list per row.
    pub const FLATTEN_ROWS: QueryFlags = QueryFlags(8);
    /// Keep DECIMAL columns with zero scale as decimals instead of integers.
    pub const CAST_ALL_DECIMALS: QueryFlags = QueryFlags(16);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for QueryFlags {
    fn default() -> Self {
        QueryFlags::CAST
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryFlags {
    fn bitor_assign(&mut self, rhs: QueryFlags) {
        self.0 |= rhs.0;
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// Client connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Hostname or IP address; TCP is used when set and no socket is given
    pub host: Option<String>,
    /// Port number (default: 3306)
    pub port: u16,
    /// Unix socket path; wins over host/port
    pub socket: Option<PathBuf>,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database to select during the handshake
    pub database: Option<String>,
    /// Character set id sent in the handshake (default: utf8mb4_general_ci)
    pub charset: u8,
    /// Limit for establishing the connection and reading the greeting
    pub connect_timeout: Option<Duration>,
    /// Limit for each readiness wait while reading
    pub read_timeout: Option<Duration>,
    /// Limit for each readiness wait while writing
    pub write_timeout: Option<Duration>,
    /// SSL mode
    pub ssl_mode: SslMode,
    /// TLS settings used when SSL is negotiated
    pub tls: TlsConfig,
    /// Report matched rather than changed rows (CLIENT_FOUND_ROWS)
    pub found_rows: bool,
    /// Allow several statements per query (CLIENT_MULTI_STATEMENTS)
    pub multi_statements: bool,
    /// Accept several result sets per query (CLIENT_MULTI_RESULTS)
    pub multi_results: bool,
    /// Largest payload this client will send; `None` means unlimited
    pub max_allowed_packet: Option<usize>,
    /// Allow the mysql_clear_password plugin
    pub enable_cleartext_plugin: bool,
    /// Casting flags for query results
    pub query_flags: QueryFlags,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            found_rows: false,
            multi_statements: false,
            multi_results: true,
            max_allowed_packet: None,
            enable_cleartext_plugin: false,
            query_flags: QueryFlags::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("ssl_mode", &self.ssl_mode)
            .field("tls", &self.tls)
            .field("found_rows", &self.found_rows)
            .field("multi_statements", &self.multi_statements)
            .field("multi_results", &self.multi_results)
            .field("max_allowed_packet", &self.max_allowed_packet)
            .field("enable_cleartext_plugin", &self.enable_cleartext_plugin)
            .field("query_flags", &self.query_flags)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the unix socket path.
    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket = Some(path.into());
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set.
    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Set the TLS options.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn found_rows(mut self, enabled: bool) -> Self {
        self.found_rows = enabled;
        self
    }

    pub fn multi_statements(mut self, enabled: bool) -> Self {
        self.multi_statements = enabled;
        self
    }

    pub fn multi_results(mut self, enabled: bool) -> Self {
        self.multi_results = enabled;
        self
    }

    /// Set the max allowed packet size.
    pub fn max_allowed_packet(mut self, size: usize) -> Self {
        self.max_allowed_packet = Some(size);
        self
    }

    /// Allow sending the password in clear text when the server asks for it.
    ///
    /// Only safe over TLS or a unix socket.
    pub fn enable_cleartext_plugin(mut self, enabled: bool) -> Self {
        self.enable_cleartext_plugin = enabled;
        self
    }

    pub fn query_flags(mut self, flags: QueryFlags) -> Self {
        self.query_flags = flags;
        self
    }

    /// Resolve the connection target.
    pub fn target(&self) -> Target {
        match (&self.socket, &self.host) {
            (Some(path), _) => Target::Unix(path.clone()),
            (None, Some(host)) => Target::Tcp {
                host: host.clone(),
                port: self.port,
            },
            (None, None) => Target::Unix(PathBuf::from(DEFAULT_SOCKET)),
        }
    }

    /// Hostname used for TLS server name indication and verification.
    pub fn tls_server_name(&self) -> &str {
        self.tls
            .server_name
            .as_deref()
            .or(self.host.as_deref())
            .unwrap_or("localhost")
    }

    /// Timeout for establishing the connection and reading the greeting.
    pub fn effective_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.or(self.write_timeout)
    }

    /// Build capability flags based on configuration.
    ///
    /// The result still has to be intersected with the server's flags.
    pub fn capability_flags(&self) -> u32 {
        use capabilities::{
            BASE_CLIENT_FLAGS, CLIENT_CONNECT_WITH_DB, CLIENT_FOUND_ROWS, CLIENT_MULTI_RESULTS,
            CLIENT_MULTI_STATEMENTS, CLIENT_SSL,
        };

        let mut flags = BASE_CLIENT_FLAGS;

        if self.found_rows {
            flags |= CLIENT_FOUND_ROWS;
        }

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        if self.multi_statements {
            flags |= CLIENT_MULTI_STATEMENTS;
        }

        if !self.multi_results {
            flags &= !CLIENT_MULTI_RESULTS;
        }

        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }

        flags
    }
}
