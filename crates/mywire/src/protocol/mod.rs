//! MySQL wire protocol building blocks.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! A payload of `MAX_PACKET_SIZE` bytes or more is split across frames;
//! a frame of exactly `MAX_PACKET_SIZE` bytes means another one follows.

pub mod frame;
pub mod reader;
pub mod writer;

use mywire_core::Result;

use crate::error::protocol_error_with_data;

pub use frame::FrameDecoder;
pub use reader::PacketReader;
pub use writer::{PacketWriter, encode_frames};

/// Maximum payload size for a single MySQL frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities every handshake asks for.
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;
}

/// MySQL command codes (COM_xxx) used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Set option
    SetOption = 0x1b,
}

/// Options for `COM_SET_OPTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServerOption {
    MultiStatementsOn = 0,
    MultiStatementsOff = 1,
}

/// Server status flags carried by OK and EOF packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusFlags(u16);

impl StatusFlags {
    pub const IN_TRANS: u16 = 0x0001;
    pub const AUTOCOMMIT: u16 = 0x0002;
    pub const MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const NO_INDEX_USED: u16 = 0x0020;
    pub const CURSOR_EXISTS: u16 = 0x0040;
    pub const LAST_ROW_SENT: u16 = 0x0080;
    pub const DB_DROPPED: u16 = 0x0100;
    pub const NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const METADATA_CHANGED: u16 = 0x0400;
    pub const QUERY_WAS_SLOW: u16 = 0x0800;
    pub const PS_OUT_PARAMS: u16 = 0x1000;
    pub const IN_TRANS_READONLY: u16 = 0x2000;
    pub const SESSION_STATE_CHANGED: u16 = 0x4000;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `flag` is set.
    pub const fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub const fn in_transaction(self) -> bool {
        self.contains(Self::IN_TRANS)
    }

    pub const fn autocommit(self) -> bool {
        self.contains(Self::AUTOCOMMIT)
    }

    pub const fn more_results_exist(self) -> bool {
        self.contains(Self::MORE_RESULTS_EXISTS)
    }

    pub const fn no_backslash_escapes(self) -> bool {
        self.contains(Self::NO_BACKSLASH_ESCAPES)
    }

    pub const fn session_state_changed(self) -> bool {
        self.contains(Self::SESSION_STATE_CHANGED)
    }
}

/// MySQL character set codes.
pub mod charset {
    pub const ASCII_GENERAL_CI: u16 = 11;
    pub const UTF8_GENERAL_CI: u16 = 33;
    pub const UTF8MB4_GENERAL_CI: u16 = 45;
    pub const UTF8MB4_BIN: u16 = 46;
    pub const BINARY: u16 = 63;
    pub const ASCII_BIN: u16 = 65;
    pub const UTF8_BIN: u16 = 83;
    pub const UTF8MB4_0900_AI_CI: u16 = 255;

    /// Charset sent in the handshake unless configured otherwise.
    pub const DEFAULT_CHARSET: u8 = 45;

    /// Collations whose bytes are valid UTF-8 text (utf8mb3, utf8mb4, ascii).
    pub fn is_utf8(id: u16) -> bool {
        matches!(
            id,
            ASCII_GENERAL_CI
                | UTF8_GENERAL_CI
                | UTF8MB4_GENERAL_CI
                | UTF8MB4_BIN
                | ASCII_BIN
                | 76
                | UTF8_BIN
                | 192..=215
                | 223..=247
                | 255..=323
        )
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE, under 9 bytes)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Anything else: column counts, definitions, rows
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    pub fn of(payload: &[u8]) -> Self {
        match payload.first() {
            Some(&b) => Self::from_first_byte(b, payload.len()),
            None => PacketType::Data,
        }
    }
}

/// Is this row-stream payload the end-of-rows marker?
///
/// An EOF-shaped payload always is. With `CLIENT_DEPRECATE_EOF` the server
/// ends the rows with an OK packet tagged 0xFE, which can be longer.
pub fn is_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    match payload.first() {
        Some(0xFE) => payload.len() < 9 || (deprecate_eof && payload.len() < MAX_PACKET_SIZE),
        _ => false,
    }
}

/// Session-state tracker entry type for GTIDs.
pub const SESSION_TRACK_GTIDS: u8 = 0x03;

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: StatusFlags,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
    /// GTID reported through session-state tracking
    pub gtid: Option<String>,
}

impl OkPacket {
    /// Parse an OK payload (leading 0x00 or 0xFE tag byte included).
    ///
    /// `session_track` is whether `CLIENT_SESSION_TRACK` was negotiated.
    pub fn parse(payload: &[u8], session_track: bool) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        reader.skip(1)?;
        let affected_rows = reader.read_lenenc_int()?;
        let last_insert_id = reader.read_lenenc_int()?;
        let status_flags = StatusFlags::from_bits(reader.read_u16_le()?);
        let warnings = reader.read_u16_le()?;

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: String::new(),
            gtid: None,
        };

        if !session_track {
            ok.info = reader.read_rest_string();
            return Ok(ok);
        }

        if reader.is_empty() {
            return Ok(ok);
        }
        ok.info = reader.read_lenenc_string()?;
        if status_flags.session_state_changed() && !reader.is_empty() {
            let block = reader.read_lenenc_bytes()?;
            ok.gtid = parse_session_gtid(block)?;
        }
        Ok(ok)
    }
}

/// Walk `(type, lenenc data)` entries, returning the GTID entry's value.
fn parse_session_gtid(block: &[u8]) -> Result<Option<String>> {
    let mut reader = PacketReader::new(block);
    let mut gtid = None;
    while !reader.is_empty() {
        let kind = reader.read_u8()?;
        let data = reader.read_lenenc_bytes()?;
        if kind == SESSION_TRACK_GTIDS {
            let mut entry = PacketReader::new(data);
            // encoding specification byte
            entry.skip(1)?;
            gtid = Some(entry.read_lenenc_string()?);
        }
    }
    Ok(gtid)
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters, empty when the server sent none)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Parse an ERR payload (leading 0xFF included).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let tag = reader.read_u8()?;
        if tag != 0xFF {
            return Err(protocol_error_with_data(
                format!("expected ERR packet, got tag {:#04x}", tag),
                payload,
            ));
        }
        let error_code = reader.read_u16_le()?;
        let sql_state = if reader.peek() == Some(b'#') {
            reader.skip(1)?;
            String::from_utf8_lossy(reader.read_bytes(5)?).into_owned()
        } else {
            String::new()
        };
        let error_message = reader.read_rest_string();
        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: StatusFlags,
}

impl EofPacket {
    /// Parse an EOF payload (leading 0xFE included).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        reader.skip(1)?;
        let warnings = reader.read_u16_le()?;
        let status_flags = StatusFlags::from_bits(reader.read_u16_le()?);
        Ok(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_bytes() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x56, 0x34, 0x12, 7]);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(
            PacketType::from_first_byte(0xFB, 10),
            PacketType::LocalInfile
        );
        assert_eq!(PacketType::of(&[0x42]), PacketType::Data);
    }

    #[test]
    fn test_terminator_rule() {
        assert!(is_terminator(&[0xFE, 0, 0, 2, 0], false));
        assert!(!is_terminator(&[0xFE; 9], false));
        assert!(is_terminator(&[0xFE; 9], true));
        assert!(!is_terminator(&[0x01, b'1'], true));
        assert!(!is_terminator(&[], true));
    }

    #[test]
    fn test_status_flags() {
        let flags = StatusFlags::from_bits(0x020A);
        assert!(flags.autocommit());
        assert!(flags.more_results_exist());
        assert!(flags.no_backslash_escapes());
        assert!(!flags.in_transaction());
        assert!(!flags.session_state_changed());
        assert_eq!(flags.bits(), 0x020A);
    }

    #[test]
    fn test_parse_ok_without_session_track() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x03, 0x00, b'h', b'i'];
        let ok = OkPacket::parse(&data, false).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert!(ok.status_flags.autocommit());
        assert_eq!(ok.warnings, 3);
        assert_eq!(ok.info, "hi");
        assert_eq!(ok.gtid, None);
    }

    #[test]
    fn test_parse_ok_with_gtid() {
        let gtid = b"3E11FA47-71CA-11E1-9E33-C80AA9429562:23";
        let mut entry = vec![0x00, gtid.len() as u8];
        entry.extend_from_slice(gtid);

        let mut block = vec![0x01, 0x03, 0x00, 0x00, 0x00];
        block.push(SESSION_TRACK_GTIDS);
        block.push(entry.len() as u8);
        block.extend_from_slice(&entry);

        let mut data = vec![0x00, 0x00, 0x00, 0x02, 0x40, 0x00, 0x00, 0x00];
        data.push(block.len() as u8);
        data.extend_from_slice(&block);

        let ok = OkPacket::parse(&data, true).unwrap();
        assert!(ok.status_flags.session_state_changed());
        assert_eq!(ok.info, "");
        assert_eq!(
            ok.gtid.as_deref(),
            Some("3E11FA47-71CA-11E1-9E33-C80AA9429562:23")
        );
    }

    #[test]
    fn test_parse_ok_minimal_with_session_track() {
        let ok = OkPacket::parse(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00], true).unwrap();
        assert_eq!(ok.info, "");
        assert_eq!(ok.gtid, None);
    }

    #[test]
    fn test_parse_ok_truncated() {
        assert!(OkPacket::parse(&[0x00, 0x01], false).is_err());
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = ErrPacket::parse(&data).unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");

        let err = ErrPacket::parse(&[0xFF, 0x10, 0x04, b'T', b'o', b'o']).unwrap();
        assert_eq!(err.error_code, 1040);
        assert_eq!(err.sql_state, "");
        assert_eq!(err.error_message, "Too");
    }

    #[test]
    fn test_parse_eof_packet() {
        let eof = EofPacket::parse(&[0xFE, 0x01, 0x00, 0x22, 0x00]).unwrap();
        assert_eq!(eof.warnings, 1);
        assert!(eof.status_flags.autocommit());
        assert!(eof.status_flags.contains(0x0020));
    }

    #[test]
    fn test_utf8_charsets() {
        assert!(charset::is_utf8(charset::UTF8MB4_0900_AI_CI));
        assert!(charset::is_utf8(charset::UTF8MB4_GENERAL_CI));
        assert!(charset::is_utf8(224));
        assert!(!charset::is_utf8(charset::BINARY));
        assert!(!charset::is_utf8(8));
    }
}
