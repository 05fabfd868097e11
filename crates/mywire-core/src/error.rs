//! Error types for mywire operations.

use std::fmt;

/// The primary error type for all mywire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, handshake, TLS, closed connections)
    Connection(ConnectionError),
    /// Server-reported command errors and oversized packets
    Query(QueryError),
    /// Cell casting errors
    Type(TypeError),
    /// Protocol errors (wire-level invariant violations)
    Protocol(ProtocolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors not attributable to a specific connection phase
    Io(std::io::Error),
    /// A read or write readiness wait exceeded its timeout
    Timeout,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    /// Server error code, when the failure was reported by the server
    pub code: Option<u16>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish or continue the connection
    Connect,
    /// Connection refused by the peer
    Refused,
    /// Authentication failed
    Authentication,
    /// Unknown or disallowed authentication plugin
    AuthPlugin,
    /// Connection lost during operation
    Disconnected,
    /// Operation attempted on a closed connection
    Closed,
    /// SSL/TLS negotiation or configuration failed
    Ssl,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Server error code (absent for client-side failures)
    pub code: Option<u16>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key)
    Constraint,
    /// Database, table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Lock wait timeout
    Timeout,
    /// Payload exceeds the configured maximum packet size
    PacketTooLarge,
    /// Server requested something this client does not implement
    Unsupported,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a MySQL server error code.
    pub fn from_server_code(code: u16) -> Self {
        match code {
            1062 | 1451 | 1452 => QueryErrorKind::Constraint,
            1064 => QueryErrorKind::Syntax,
            1049 | 1054 | 1146 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 => QueryErrorKind::Permission,
            1213 => QueryErrorKind::Deadlock,
            1205 => QueryErrorKind::Timeout,
            _ => QueryErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a connection error that requires reconnecting?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) | Error::Timeout
        )
    }

    /// Did a readiness wait time out?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Is this a TLS negotiation or configuration failure?
    pub fn is_tls_error(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::Ssl)
    }

    /// Is this an unknown or disallowed authentication plugin?
    pub fn is_auth_plugin_error(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::AuthPlugin)
    }

    /// Was the operation attempted on a closed connection?
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::Closed)
    }

    /// Server error code, if the server reported this error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Connection(c) => c.code,
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(1062)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{}: {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{}: ", code)?;
        }
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for mywire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_query_error(code: u16) -> QueryError {
        QueryError {
            kind: QueryErrorKind::from_server_code(code),
            code: Some(code),
            sqlstate: Some("23000".to_string()),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
            sql: Some("INSERT INTO t VALUES (1)".to_string()),
            source: None,
        }
    }

    #[test]
    fn test_server_code_classification() {
        assert_eq!(
            QueryErrorKind::from_server_code(1062),
            QueryErrorKind::Constraint
        );
        assert_eq!(QueryErrorKind::from_server_code(1064), QueryErrorKind::Syntax);
        assert_eq!(
            QueryErrorKind::from_server_code(1146),
            QueryErrorKind::NotFound
        );
        assert_eq!(
            QueryErrorKind::from_server_code(1213),
            QueryErrorKind::Deadlock
        );
        assert_eq!(
            QueryErrorKind::from_server_code(9999),
            QueryErrorKind::Database
        );
    }

    #[test]
    fn test_query_error_helpers() {
        let query = server_query_error(1062);
        assert!(query.is_duplicate_key());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert!(!err.is_connection_error());
        assert_eq!(
            err.to_string(),
            "Query error: 1062: Duplicate entry '1' for key 'PRIMARY' (SQLSTATE 23000)"
        );
    }

    #[test]
    fn test_connection_error_kinds() {
        let tls = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Ssl,
            code: None,
            message: "handshake failed".to_string(),
            source: None,
        });
        assert!(tls.is_tls_error());
        assert!(tls.is_connection_error());
        assert!(!tls.is_closed());

        let closed = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            code: None,
            message: "connection closed".to_string(),
            source: None,
        });
        assert!(closed.is_closed());
        assert!(!closed.is_auth_plugin_error());

        let denied = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Authentication,
            code: Some(1045),
            message: "Access denied".to_string(),
            source: None,
        });
        assert_eq!(denied.server_code(), Some(1045));
        assert_eq!(denied.to_string(), "Connection error: 1045: Access denied");
    }

    #[test]
    fn test_timeout_and_io() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Timeout.is_connection_error());

        let io: Error = std::io::Error::other("boom").into();
        assert!(matches!(io, Error::Io(_)));
        assert!(std::error::Error::source(&io).is_some());
    }
}
