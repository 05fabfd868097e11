//! MySQL/MariaDB wire-protocol client.
//!
//! This crate speaks the MySQL client/server protocol directly over
//! non-blocking sockets. It provides:
//!
//! - Packet framing with sequence numbers and 16MB continuation frames
//! - The connection handshake, including the TLS upgrade
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   mysql_clear_password)
//! - Text-protocol queries with result casting and multiple result sets
//!
//! # Protocol overview
//!
//! - 3-byte payload length + 1-byte sequence number header
//! - Payloads of 0xFFFFFF bytes or more are split across frames
//! - Half duplex: every command restarts the sequence at zero
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{Client, ClientConfig};
//!
//! let config = ClientConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut client = Client::connect(config)?;
//! let rows = client.query("SELECT id, name FROM users")?;
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod escape;
pub mod handshake;
pub mod protocol;
pub mod query;
pub mod tls;
pub mod transport;
pub mod types;

pub use client::{Client, ServerInfo};
pub use config::{ClientConfig, QueryFlags, SslMode};
pub use connection::{Connection, Session};
pub use protocol::{ServerOption, StatusFlags};
pub use tls::{TlsConfig, TlsVersion};
pub use transport::Transport;

pub use mywire_core::{
    ColumnInfo, ConnectionErrorKind, Error, QueryErrorKind, Result, ResultSet, Row, Value,
};
