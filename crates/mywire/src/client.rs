//! High-level client.
//!
//! [`Client`] owns one authenticated [`Connection`] and exposes queries,
//! the simple commands (`INIT_DB`, `PING`, `SET_OPTION`, `QUIT`) and the
//! session accessors.

use std::time::Duration;

use mywire_core::{Result, ResultSet};

use crate::config::{ClientConfig, QueryFlags};
use crate::connection::{Connection, Session};
use crate::escape;
use crate::handshake;
use crate::protocol::{Command, ServerOption};
use crate::query::{self, read_status};
use crate::transport::Transport;

/// Server version string and its numeric form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    /// `major * 10000 + minor * 100 + patch`, when the version parses
    pub id: Option<u32>,
}

fn leading_number(part: &str) -> Option<u32> {
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    part[..end].parse().ok()
}

/// Numeric version id. MariaDB's `5.5.5-` replication prefix is skipped.
fn version_id(version: &str) -> Option<u32> {
    let version = version.strip_prefix("5.5.5-").unwrap_or(version);
    let mut parts = version.splitn(3, '.');
    let major = leading_number(parts.next()?)?;
    let minor = leading_number(parts.next()?)?;
    let patch = leading_number(parts.next()?)?;
    Some(major * 10_000 + minor * 100 + patch)
}

/// A connected, authenticated MySQL session.
#[derive(Debug)]
pub struct Client {
    conn: Connection,
    config: ClientConfig,
    query_flags: QueryFlags,
}

impl Client {
    /// Open a transport to the configured server and authenticate.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.tls.validate()?;
        let transport = Transport::connect(&config)?;
        Self::from_transport(transport, config)
    }

    /// Authenticate over an already connected transport.
    pub fn from_transport(transport: Transport, config: ClientConfig) -> Result<Self> {
        let mut conn = Connection::new(transport, &config);
        handshake::perform(&mut conn, &config)?;
        tracing::debug!(
            server_version = %conn.session().server_version,
            connection_id = conn.session().connection_id,
            tls = conn.is_tls(),
            "Connected"
        );
        Ok(Self {
            conn,
            query_flags: config.query_flags,
            config,
        })
    }

    /// Run a query with the client's current flags.
    pub fn query(&mut self, sql: &str) -> Result<ResultSet> {
        query::query(&mut self.conn, sql, self.query_flags)
    }

    /// Run a query with `flags` in place of the client's flags for this call only.
    pub fn query_with_flags(&mut self, sql: &str, flags: QueryFlags) -> Result<ResultSet> {
        query::query(&mut self.conn, sql, flags)
    }

    /// Read the next result of a multi-statement query, if any.
    pub fn next_result(&mut self) -> Result<Option<ResultSet>> {
        query::next_result(&mut self.conn, self.query_flags)
    }

    /// Switch the default database (`COM_INIT_DB`).
    pub fn change_db(&mut self, database: &str) -> Result<()> {
        self.simple_command(Command::InitDb, database.as_bytes())?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Check that the server is alive (`COM_PING`).
    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(Command::Ping, &[])
    }

    /// Toggle a server option (`COM_SET_OPTION`).
    pub fn set_server_option(&mut self, option: ServerOption) -> Result<()> {
        self.simple_command(Command::SetOption, &(option as u16).to_le_bytes())
    }

    fn simple_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        self.conn.begin_command()?;
        tracing::trace!(command = ?command, "Sending command");
        self.conn.write_packet(|w| {
            w.write_u8(command as u8);
            w.write_bytes(body);
        })?;
        read_status(&mut self.conn)
    }

    /// Send `COM_QUIT` and close the transport.
    ///
    /// Does nothing on a closed connection.
    pub fn close(&mut self) -> Result<()> {
        if self.conn.is_closed() {
            return Ok(());
        }
        let sent = self
            .conn
            .begin_command()
            .and_then(|()| self.conn.write_packet(|w| w.write_u8(Command::Quit as u8)));
        self.conn.close();
        tracing::debug!("Connection closed");
        sent
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Escape `s` for a single-quoted literal under the session's SQL mode.
    pub fn escape(&self, s: &str) -> String {
        escape::escape(s, self.session().status_flags.no_backslash_escapes())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn session(&self) -> &Session {
        self.conn.session()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn affected_rows(&self) -> u64 {
        self.session().affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.session().last_insert_id
    }

    pub fn last_gtid(&self) -> Option<&str> {
        self.session().last_gtid.as_deref()
    }

    pub fn warning_count(&self) -> u16 {
        self.session().warnings
    }

    pub fn more_results_exist(&self) -> bool {
        self.session().status_flags.more_results_exist()
    }

    pub fn in_transaction(&self) -> bool {
        self.session().status_flags.in_transaction()
    }

    pub fn server_version(&self) -> &str {
        &self.session().server_version
    }

    pub fn server_info(&self) -> ServerInfo {
        let version = self.server_version().to_string();
        ServerInfo {
            id: version_id(&version),
            version,
        }
    }

    pub fn query_flags(&self) -> QueryFlags {
        self.query_flags
    }

    pub fn set_query_flags(&mut self, flags: QueryFlags) {
        self.query_flags = flags;
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        self.conn.read_timeout()
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_read_timeout(timeout)
    }

    pub fn write_timeout(&self) -> Result<Option<Duration>> {
        self.conn.write_timeout()
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_write_timeout(timeout)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "Error while closing on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketWriter, StatusFlags, capabilities};
    use mywire_core::Error;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    fn greeting(status: u16) -> Vec<u8> {
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_TRANSACTIONS;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36-log");
        w.write_u32_le(7);
        w.write_bytes(&[1; 8]);
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(45);
        w.write_u16_le(status);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&[2; 12]);
        w.write_u8(0);
        w.write_null_string("mysql_native_password");
        w.into_bytes()
    }

    fn ok(status: u16) -> Vec<u8> {
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&status.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload
    }

    /// A client whose handshake has already been answered.
    fn connected(status: u16) -> (Client, UnixStream) {
        let (local, mut server) = UnixStream::pair().unwrap();
        let mut script = frame(0, &greeting(status));
        script.extend(frame(2, &ok(status)));
        server.write_all(&script).unwrap();

        let transport = Transport::from_unix(local).unwrap();
        let client = Client::from_transport(transport, ClientConfig::new().user("app")).unwrap();

        // Drain the handshake response so later reads see only commands.
        let mut header = [0u8; 4];
        server.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut body = vec![0u8; len];
        server.read_exact(&mut body).unwrap();
        (client, server)
    }

    #[test]
    fn test_version_id() {
        assert_eq!(version_id("8.0.36"), Some(80036));
        assert_eq!(version_id("5.7.44-log"), Some(50744));
        assert_eq!(version_id("5.5.5-10.11.6-MariaDB"), Some(101106));
        assert_eq!(version_id("garbage"), None);
    }

    #[test]
    fn test_connect_rejects_inconsistent_tls_options() {
        let config = ClientConfig::new()
            .socket("/nonexistent/mysqld.sock")
            .tls(crate::tls::TlsConfig::new().cert("client.pem"));
        let err = Client::connect(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_connect_populates_session() {
        let (client, _server) = connected(StatusFlags::AUTOCOMMIT);
        assert_eq!(client.server_version(), "8.0.36-log");
        assert_eq!(client.server_info().id, Some(80036));
        assert_eq!(client.session().connection_id, 7);
        assert!(!client.in_transaction());
        assert!(!client.is_closed());
    }

    #[test]
    fn test_ping_and_change_db() {
        let (mut client, mut server) = connected(StatusFlags::AUTOCOMMIT);
        server.write_all(&frame(1, &ok(StatusFlags::AUTOCOMMIT))).unwrap();
        client.ping().unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x00, 0x00, 0x00, 0x0e]);

        server.write_all(&frame(1, &ok(StatusFlags::AUTOCOMMIT))).unwrap();
        client.change_db("shop").unwrap();
        assert_eq!(client.config().database.as_deref(), Some("shop"));

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[4..], b"\x02shop");
    }

    #[test]
    fn test_command_error_is_query_error() {
        let (mut client, mut server) = connected(StatusFlags::AUTOCOMMIT);
        let mut err = vec![0xFF, 0x19, 0x04, b'#'];
        err.extend_from_slice(b"42000Unknown database 'nope'");
        server.write_all(&frame(1, &err)).unwrap();

        let e = client.change_db("nope").unwrap_err();
        assert!(matches!(e, Error::Query(_)));
        assert_eq!(e.server_code(), Some(1049));
        assert!(!client.is_closed());
        assert_eq!(client.config().database, None);
    }

    #[test]
    fn test_set_server_option() {
        let (mut client, mut server) = connected(StatusFlags::AUTOCOMMIT);
        server
            .write_all(&frame(1, &[0xFE, 0x00, 0x00, 0x02, 0x00]))
            .unwrap();
        client
            .set_server_option(ServerOption::MultiStatementsOn)
            .unwrap();

        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[4..], &[0x1b, 0x00, 0x00]);
    }

    #[test]
    fn test_close_sends_quit() {
        let (mut client, mut server) = connected(StatusFlags::AUTOCOMMIT);
        client.close().unwrap();
        assert!(client.is_closed());
        client.close().unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x00, 0x00, 0x00, 0x01]);

        assert!(client.ping().unwrap_err().is_closed());
        assert!(client.read_timeout().unwrap_err().is_closed());
        assert!(client.set_write_timeout(None).unwrap_err().is_closed());
    }

    #[test]
    fn test_escape_follows_sql_mode() {
        let (client, _server) = connected(StatusFlags::AUTOCOMMIT);
        assert_eq!(client.escape("a'b"), "a\\'b");

        let (client, _server) =
            connected(StatusFlags::AUTOCOMMIT | StatusFlags::NO_BACKSLASH_ESCAPES);
        assert_eq!(client.escape("a'b\\"), "a''b\\");
    }

    #[test]
    fn test_query_flags() {
        let (mut client, _server) = connected(StatusFlags::AUTOCOMMIT);
        assert_eq!(client.query_flags(), QueryFlags::CAST);
        client.set_query_flags(QueryFlags::CAST | QueryFlags::FLATTEN_ROWS);
        assert!(client.query_flags().contains(QueryFlags::FLATTEN_ROWS));
    }
}
