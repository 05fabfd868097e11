//! Helper constructors for the errors raised inside the protocol layer.

use mywire_core::Error;
use mywire_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
};

use crate::protocol::ErrPacket;

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

pub(crate) fn protocol_error_with_data(msg: impl Into<String>, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(data.to_vec()),
        source: None,
    })
}

pub(crate) fn connection_error(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        code: None,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn io_connection_error(
    kind: ConnectionErrorKind,
    msg: impl Into<String>,
    err: std::io::Error,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        code: None,
        message: format!("{}: {}", msg.into(), err),
        source: Some(Box::new(err)),
    })
}

pub(crate) fn closed_error() -> Error {
    connection_error(ConnectionErrorKind::Closed, "connection closed")
}

pub(crate) fn tls_error(msg: impl Into<String>) -> Error {
    connection_error(ConnectionErrorKind::Ssl, msg)
}

/// Options that contradict each other, caught before any I/O.
pub(crate) fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn auth_plugin_error(msg: impl Into<String>) -> Error {
    connection_error(ConnectionErrorKind::AuthPlugin, msg)
}

/// An ERR packet received while authenticating.
pub(crate) fn auth_failed(err: &ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code: Some(err.error_code),
        message: err.error_message.clone(),
        source: None,
    })
}

/// An ERR packet sent instead of the greeting (host blocked, too many connections).
pub(crate) fn greeting_rejected(err: &ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        code: Some(err.error_code),
        message: err.error_message.clone(),
        source: None,
    })
}

/// An ERR packet received in reply to a command.
pub(crate) fn server_error(err: &ErrPacket, sql: Option<&str>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::from_server_code(err.error_code),
        code: Some(err.error_code),
        sqlstate: (!err.sql_state.is_empty()).then(|| err.sql_state.clone()),
        message: err.error_message.clone(),
        sql: sql.map(str::to_string),
        source: None,
    })
}

pub(crate) fn client_query_error(kind: QueryErrorKind, msg: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        code: None,
        sqlstate: None,
        message: msg.into(),
        sql: None,
        source: None,
    })
}
