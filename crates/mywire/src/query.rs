//! Text-protocol queries and result-set reading.
//!
//! A response is one of: an OK packet (no result set), an ERR packet, a
//! LOCAL INFILE request, or a result set:
//!
//! ```text
//! column count, column definitions, [EOF], rows..., EOF | OK(0xFE)
//! ```
//!
//! When the terminator carries the more-results flag, the next result is
//! read with [`next_result`].

use std::sync::Arc;

use mywire_core::error::QueryErrorKind;
use mywire_core::{ColumnInfo, Error, Result, ResultSet, Value};

use crate::config::QueryFlags;
use crate::connection::Connection;
use crate::error::{client_query_error, protocol_error, protocol_error_with_data, server_error};
use crate::protocol::{Command, ErrPacket, PacketReader, PacketType, StatusFlags, is_terminator};
use crate::types::{ColumnDef, cast};

/// Run `sql` and read its first result.
///
/// Results left unread by a previous multi-statement query are discarded
/// first.
#[tracing::instrument(level = "debug", skip(conn, sql), fields(sql_len = sql.len()))]
pub fn query(conn: &mut Connection, sql: &str, flags: QueryFlags) -> Result<ResultSet> {
    discard_pending_results(conn)?;
    conn.begin_command()?;
    conn.write_packet(|w| {
        w.write_u8(Command::Query as u8);
        w.write_bytes(sql.as_bytes());
    })?;
    read_result(conn, flags, Some(sql))
}

/// Read the next result of a multi-result response.
///
/// Returns `None` when the last terminator did not announce more results.
pub fn next_result(conn: &mut Connection, flags: QueryFlags) -> Result<Option<ResultSet>> {
    if !conn.session().status_flags.more_results_exist() {
        return Ok(None);
    }
    read_result(conn, flags, None).map(Some)
}

fn discard_pending_results(conn: &mut Connection) -> Result<()> {
    while !conn.is_closed() && conn.session().status_flags.more_results_exist() {
        tracing::debug!("Discarding unread result");
        match read_result(conn, QueryFlags::NONE, None) {
            Ok(_) | Err(Error::Query(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_result(conn: &mut Connection, flags: QueryFlags, sql: Option<&str>) -> Result<ResultSet> {
    let payload = conn.read_payload()?;
    match PacketType::of(&payload) {
        PacketType::Ok => {
            conn.apply_ok(&payload)?;
            Ok(ResultSet::empty())
        }
        PacketType::Error => reply_error(conn, &payload, sql),
        PacketType::LocalInfile => refuse_local_infile(conn, &payload),
        PacketType::Eof | PacketType::Data if payload.is_empty() => {
            conn.guard(Err(protocol_error("empty response packet")))
        }
        PacketType::Eof | PacketType::Data => read_result_set(conn, &payload, flags, sql),
    }
}

/// Turn an ERR payload into the server's query error.
///
/// The server sends nothing after an ERR, so any announced follow-up
/// results are cancelled.
pub(crate) fn reply_error<T>(conn: &mut Connection, payload: &[u8], sql: Option<&str>) -> Result<T> {
    let err = conn.guard(ErrPacket::parse(payload))?;
    let session = conn.session_mut();
    session.status_flags = StatusFlags::from_bits(
        session.status_flags.bits() & !StatusFlags::MORE_RESULTS_EXISTS,
    );
    tracing::debug!(code = err.error_code, sqlstate = %err.sql_state, "Server returned error");
    Err(server_error(&err, sql))
}

/// Read the OK (or EOF) reply to a command that returns no rows.
pub(crate) fn read_status(conn: &mut Connection) -> Result<()> {
    let payload = conn.read_payload()?;
    match PacketType::of(&payload) {
        PacketType::Ok => conn.apply_ok(&payload).map(drop),
        PacketType::Eof if conn.session().deprecate_eof() => conn.apply_ok(&payload).map(drop),
        PacketType::Eof => conn.apply_eof(&payload).map(drop),
        PacketType::Error => reply_error(conn, &payload, None),
        PacketType::LocalInfile | PacketType::Data => conn.guard(Err(protocol_error_with_data(
            "unexpected reply to command",
            &payload,
        ))),
    }
}

/// Answer a LOCAL INFILE request with an empty file and fail the query.
fn refuse_local_infile(conn: &mut Connection, payload: &[u8]) -> Result<ResultSet> {
    let file = String::from_utf8_lossy(&payload[1..]);
    tracing::warn!(file = %file, "Refusing LOCAL INFILE request");
    conn.write_packet(|_| {})?;
    read_status(conn)?;
    Err(client_query_error(
        QueryErrorKind::Unsupported,
        "LOCAL INFILE requests are not supported",
    ))
}

fn read_column_count(payload: &[u8]) -> Result<usize> {
    let count = PacketReader::new(payload).read_lenenc_int()?;
    usize::try_from(count).map_err(|_| protocol_error("column count overflows usize"))
}

/// Split a row payload into its cells (`None` for NULL).
fn split_row(payload: &[u8], count: usize) -> Result<Vec<Option<&[u8]>>> {
    let mut reader = PacketReader::new(payload);
    let cells = (0..count)
        .map(|_| reader.read_lenenc_bytes_or_null())
        .collect::<Result<Vec<_>>>()?;
    if !reader.is_empty() {
        return Err(protocol_error_with_data("trailing bytes after row", payload));
    }
    Ok(cells)
}

fn cast_row(columns: &[ColumnDef], cells: &[Option<&[u8]>], flags: QueryFlags) -> Result<Vec<Value>> {
    columns
        .iter()
        .zip(cells)
        .map(|(column, cell)| cast(column, *cell, flags))
        .collect()
}

fn read_result_set(
    conn: &mut Connection,
    first: &[u8],
    flags: QueryFlags,
    sql: Option<&str>,
) -> Result<ResultSet> {
    let count = conn.guard(read_column_count(first))?;

    let mut columns = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let column = conn.read_packet(ColumnDef::parse);
        columns.push(conn.guard(column)?);
    }

    let deprecate_eof = conn.session().deprecate_eof();
    if !deprecate_eof {
        let payload = conn.read_payload()?;
        if PacketType::of(&payload) != PacketType::Eof {
            return conn.guard(Err(protocol_error_with_data(
                "expected EOF after column definitions",
                &payload,
            )));
        }
        conn.apply_eof(&payload)?;
    }

    let info = Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ));
    let flatten = flags.contains(QueryFlags::FLATTEN_ROWS);
    let mut rows = Vec::new();
    let mut flat = Vec::new();
    // A cell that fails to cast does not desynchronize the stream; the
    // remaining rows are drained so the connection stays usable.
    let mut cast_failure = None;

    loop {
        let payload = conn.read_payload()?;
        if is_terminator(&payload, deprecate_eof) {
            if deprecate_eof {
                conn.apply_ok(&payload)?;
            } else {
                conn.apply_eof(&payload)?;
            }
            break;
        }
        if PacketType::of(&payload) == PacketType::Error {
            return reply_error(conn, &payload, sql);
        }

        let cells = conn.guard(split_row(&payload, count))?;
        if cast_failure.is_some() {
            continue;
        }
        match cast_row(&columns, &cells, flags) {
            Ok(values) if flatten => flat.extend(values),
            Ok(values) => rows.push(values),
            Err(e) => cast_failure = Some(e),
        }
    }

    if let Some(e) = cast_failure {
        return Err(e);
    }

    tracing::debug!(
        columns = count,
        rows = if flatten { flat.len() / count.max(1) } else { rows.len() },
        more_results = conn.session().status_flags.more_results_exist(),
        "Read result set"
    );

    Ok(if flatten {
        ResultSet::from_flat(info, flat)
    } else {
        ResultSet::from_rows(info, rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::{PacketWriter, capabilities, charset};
    use crate::transport::Transport;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    fn connection(caps: u32) -> (Connection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        let transport = Transport::from_unix(client).unwrap();
        let mut conn = Connection::new(transport, &ClientConfig::new());
        conn.session_mut().capabilities = caps;
        (conn, server)
    }

    fn column_def(name: &str, field_type: u8, length: u32, charset_id: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for part in ["def", "db", "t", "t"] {
            w.write_lenenc_string(part);
        }
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(charset_id);
        w.write_u32_le(length);
        w.write_u8(field_type);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    fn row(cells: &[Option<&str>]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            match cell {
                Some(text) => w.write_lenenc_string(text),
                None => w.write_u8(0xFB),
            }
        }
        w.into_bytes()
    }

    const EOF: [u8; 5] = [0xFE, 0x00, 0x00, 0x02, 0x00];
    const EOF_MORE: [u8; 5] = [0xFE, 0x00, 0x00, 0x0A, 0x00];

    /// Two columns (`id` INT, `name` VARCHAR), EOF-terminated.
    fn two_column_result(first_seq: u8, rows: &[Vec<u8>], terminator: &[u8]) -> Vec<u8> {
        let mut seq = first_seq;
        let mut out = Vec::new();
        let mut push = |payload: &[u8]| {
            out.extend(frame(seq, payload));
            seq = seq.wrapping_add(1);
        };
        push(&[0x02]);
        push(&column_def("id", 0x03, 11, charset::BINARY));
        push(&column_def("name", 0xFD, 255, charset::UTF8MB4_GENERAL_CI));
        push(&EOF);
        for r in rows {
            push(r);
        }
        push(terminator);
        out
    }

    #[test]
    fn test_query_sends_command() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        server
            .write_all(&frame(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]))
            .unwrap();
        query(&mut conn, "DO 1", QueryFlags::CAST).unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), frame(0, b"\x03DO 1"));
    }

    #[test]
    fn test_ok_only_response() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        server
            .write_all(&frame(1, &[0x00, 0x03, 0x09, 0x02, 0x00, 0x00, 0x00]))
            .unwrap();

        let rs = query(&mut conn, "UPDATE t SET a = 1", QueryFlags::CAST).unwrap();
        assert!(rs.columns().is_empty());
        assert!(rs.rows().is_empty());
        assert_eq!(conn.session().affected_rows, 3);
        assert_eq!(conn.session().last_insert_id, 9);
    }

    #[test]
    fn test_result_set_with_eof() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let rows = [row(&[Some("1"), Some("ann")]), row(&[Some("2"), None])];
        server
            .write_all(&two_column_result(1, &rows, &EOF))
            .unwrap();

        let rs = query(&mut conn, "SELECT id, name FROM t", QueryFlags::CAST).unwrap();
        assert_eq!(rs.columns(), &["id".to_string(), "name".to_string()]);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.rows()[0].values(), &[Value::Int(1), Value::Text("ann".into())]);
        assert_eq!(rs.rows()[1].values(), &[Value::Int(2), Value::Null]);
        assert!(!conn.is_closed());
        conn.begin_command().unwrap();
    }

    #[test]
    fn test_uncast_cells_are_bytes() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let rows = [row(&[Some("7"), None])];
        server
            .write_all(&two_column_result(1, &rows, &EOF))
            .unwrap();

        let rs = query(&mut conn, "SELECT 7, NULL", QueryFlags::NONE).unwrap();
        assert_eq!(rs.rows()[0].values(), &[Value::Bytes(b"7".to_vec()), Value::Null]);
    }

    #[test]
    fn test_deprecate_eof_result_set() {
        let caps = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_DEPRECATE_EOF;
        let (mut conn, mut server) = connection(caps);
        let mut bytes = frame(1, &[0x01]);
        bytes.extend(frame(2, &column_def("n", 0x08, 20, charset::BINARY)));
        bytes.extend(frame(3, &row(&[Some("42")])));
        bytes.extend(frame(4, &[0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]));
        server.write_all(&bytes).unwrap();

        let rs = query(&mut conn, "SELECT 42", QueryFlags::CAST).unwrap();
        assert_eq!(rs.rows()[0].values(), &[Value::Int(42)]);
        assert_eq!(conn.session().warnings, 1);
        assert!(conn.session().status_flags.autocommit());
    }

    #[test]
    fn test_flattened_rows() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let rows = [row(&[Some("1"), Some("a")]), row(&[Some("2"), Some("b")])];
        server
            .write_all(&two_column_result(1, &rows, &EOF))
            .unwrap();

        let flags = QueryFlags::CAST | QueryFlags::FLATTEN_ROWS;
        let rs = query(&mut conn, "SELECT id, name FROM t", flags).unwrap();
        assert!(rs.is_flattened());
        assert_eq!(
            rs.values(),
            &[
                Value::Int(1),
                Value::Text("a".into()),
                Value::Int(2),
                Value::Text("b".into())
            ]
        );
        assert_eq!(rs.iter_maps().count(), 2);
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let mut err = vec![0xFF, 0x7A, 0x04, b'#'];
        err.extend_from_slice(b"42S02Table 'db.nope' doesn't exist");
        server.write_all(&frame(1, &err)).unwrap();

        let e = query(&mut conn, "SELECT * FROM nope", QueryFlags::CAST).unwrap_err();
        match e {
            Error::Query(q) => {
                assert_eq!(q.code, Some(1146));
                assert_eq!(q.kind, QueryErrorKind::NotFound);
                assert_eq!(q.sql.as_deref(), Some("SELECT * FROM nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_error_row_aborts_result() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let mut err = vec![0xFF, 0x0D, 0x05, b'#'];
        err.extend_from_slice(b"HY000Query execution was interrupted");
        let rows = [row(&[Some("1"), Some("a")])];
        server
            .write_all(&two_column_result(1, &rows, &err))
            .unwrap();

        let e = query(&mut conn, "SELECT id, name FROM t", QueryFlags::CAST).unwrap_err();
        assert_eq!(e.server_code(), Some(1293));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_multiple_results() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let mut bytes = two_column_result(1, &[row(&[Some("1"), Some("a")])], &EOF_MORE);
        bytes.extend(frame(7, &[0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]));
        server.write_all(&bytes).unwrap();

        let first = query(&mut conn, "SELECT 1, 'a'; DELETE FROM t", QueryFlags::CAST).unwrap();
        assert_eq!(first.len(), 1);
        assert!(conn.session().status_flags.more_results_exist());

        let second = next_result(&mut conn, QueryFlags::CAST).unwrap().unwrap();
        assert!(second.columns().is_empty());
        assert_eq!(conn.session().affected_rows, 1);
        assert!(next_result(&mut conn, QueryFlags::CAST).unwrap().is_none());
    }

    #[test]
    fn test_next_result_without_pending() {
        let (mut conn, _server) = connection(capabilities::CLIENT_PROTOCOL_41);
        assert!(next_result(&mut conn, QueryFlags::CAST).unwrap().is_none());
    }

    #[test]
    fn test_query_discards_pending_results() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let mut bytes = two_column_result(1, &[], &EOF_MORE);
        bytes.extend(frame(6, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        server.write_all(&bytes).unwrap();
        query(&mut conn, "SELECT 1, 'a'; DO 1", QueryFlags::CAST).unwrap();

        server
            .write_all(&frame(1, &[0x00, 0x05, 0x00, 0x02, 0x00, 0x00, 0x00]))
            .unwrap();
        query(&mut conn, "DELETE FROM t", QueryFlags::CAST).unwrap();
        assert_eq!(conn.session().affected_rows, 5);
    }

    #[test]
    fn test_cast_failure_drains_rows() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let rows = [row(&[Some("x"), Some("a")]), row(&[Some("2"), Some("b")])];
        server
            .write_all(&two_column_result(1, &rows, &EOF))
            .unwrap();

        let e = query(&mut conn, "SELECT id, name FROM t", QueryFlags::CAST).unwrap_err();
        assert!(matches!(e, Error::Type(_)));
        assert!(!conn.is_closed());
        conn.begin_command().unwrap();
    }

    #[test]
    fn test_truncated_row_poisons() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let rows = [row(&[Some("1")])];
        server
            .write_all(&two_column_result(1, &rows, &EOF))
            .unwrap();

        let e = query(&mut conn, "SELECT id, name FROM t", QueryFlags::CAST).unwrap_err();
        assert!(matches!(e, Error::Protocol(_)));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_local_infile_refused() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        let mut bytes = frame(1, b"\xFB/etc/passwd");
        bytes.extend(frame(3, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        server.write_all(&bytes).unwrap();

        let e = query(&mut conn, "LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t", QueryFlags::CAST)
            .unwrap_err();
        assert!(matches!(e, Error::Query(ref q) if q.kind == QueryErrorKind::Unsupported));
        assert!(!conn.is_closed());

        // command packet, then the empty file packet at sequence 2
        let sql_len = "LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t".len();
        let mut buf = vec![0u8; 4 + 1 + sql_len + 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[buf.len() - 4..], &[0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_read_status_accepts_eof() {
        let (mut conn, mut server) = connection(capabilities::CLIENT_PROTOCOL_41);
        server.write_all(&frame(1, &EOF)).unwrap();
        conn.begin_command().unwrap();
        conn.write_packet(|w| w.write_bytes(&[0x1B, 0x00, 0x00])).unwrap();
        read_status(&mut conn).unwrap();
        assert!(conn.session().status_flags.autocommit());
    }
}
