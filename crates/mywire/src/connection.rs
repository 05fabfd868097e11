//! Session-level packet exchange.
//!
//! [`Connection`] owns the transport, the frame decoder and the write
//! buffer. It enforces the half-duplex command turn, tracks sequence
//! numbers across frames and keeps the session state that OK and EOF
//! packets update.

// MySQL protocol uses well-defined packet sizes that fit in u32 (max 16MB)
#![allow(clippy::cast_possible_truncation)]

use std::time::Duration;

use mywire_core::{Error, Result};

use crate::config::ClientConfig;
use crate::error::{closed_error, protocol_error};
use crate::protocol::{
    EofPacket, FrameDecoder, OkPacket, PacketWriter, StatusFlags, capabilities,
};
use crate::transport::{MAX_READ, Transport};

/// State carried across packets: the greeting's server facts, the
/// negotiated capabilities and whatever the last OK/EOF reported.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Server status flags
    pub status_flags: StatusFlags,
    /// Number of warnings
    pub warnings: u16,
    /// Affected rows from last statement
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// GTID reported by the last OK packet, if any
    pub last_gtid: Option<String>,
    /// Server version string
    pub server_version: String,
    /// Connection ID
    pub connection_id: u32,
    /// Authentication plugin currently in use
    pub auth_plugin: String,
    /// Challenge data for the current plugin
    pub auth_data: Vec<u8>,
    pub charset: u8,
    /// Capabilities both sides agreed on
    pub capabilities: u32,
}

impl Session {
    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn deprecate_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }

    pub fn session_track(&self) -> bool {
        self.has_capability(capabilities::CLIENT_SESSION_TRACK)
    }
}

/// One MySQL session over a [`Transport`].
///
/// A transport failure or a protocol violation poisons the connection:
/// the transport is dropped and every later operation fails with a
/// "connection closed" error.
pub struct Connection {
    transport: Option<Transport>,
    decoder: FrameDecoder,
    read_buf: Box<[u8]>,
    read_pos: usize,
    read_len: usize,
    writer: PacketWriter,
    next_seq: u8,
    max_allowed_packet: Option<usize>,
    session: Session,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("next_seq", &self.next_seq)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a connected transport, applying the configured timeouts.
    pub fn new(mut transport: Transport, config: &ClientConfig) -> Self {
        transport.set_read_timeout(config.read_timeout);
        transport.set_write_timeout(config.write_timeout);
        Self {
            transport: Some(transport),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; MAX_READ].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
            writer: PacketWriter::new(),
            next_seq: 0,
            max_allowed_packet: config.max_allowed_packet,
            session: Session {
                charset: config.charset,
                ..Session::default()
            },
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    pub fn is_unix(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_unix)
    }

    /// Sequence number the next packet (in either direction) must carry.
    pub fn next_sequence(&self) -> u8 {
        self.next_seq
    }

    fn transport_ref(&self) -> Result<&Transport> {
        self.transport.as_ref().ok_or_else(closed_error)
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or_else(closed_error)
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.transport_ref()?.read_timeout())
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport_mut()?.set_read_timeout(timeout);
        Ok(())
    }

    pub fn write_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.transport_ref()?.write_timeout())
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport_mut()?.set_write_timeout(timeout);
        Ok(())
    }

    /// Run `f` with the read timeout replaced, restoring it afterward.
    pub fn with_read_timeout<T, F>(&mut self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let previous = self.read_timeout()?;
        self.set_read_timeout(timeout)?;
        let result = f(self);
        if let Some(transport) = self.transport.as_mut() {
            transport.set_read_timeout(previous);
        }
        result
    }

    /// Start a new command: the write sequence restarts at zero.
    ///
    /// Fails if the previous exchange left bytes unread or unwritten.
    pub fn begin_command(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return Err(closed_error());
        }
        if self.read_pos < self.read_len || self.decoder.in_progress() {
            let err = protocol_error("unread data left over from the previous command");
            return self.guard(Err(err));
        }
        if !self.writer.is_empty() {
            let err = protocol_error("unwritten data left over from the previous command");
            return self.guard(Err(err));
        }
        self.next_seq = 0;
        Ok(())
    }

    /// Send one logical packet whose payload is produced by `build`.
    ///
    /// The payload may be split across several frames; afterward the next
    /// expected sequence is one past the last frame sent.
    pub fn write_packet<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&mut PacketWriter),
    {
        if self.transport.is_none() {
            return Err(closed_error());
        }
        self.writer.reset_framed();
        build(&mut self.writer);
        let result = self.flush_writer();
        self.writer.clear();
        result
    }

    fn flush_writer(&mut self) -> Result<()> {
        // Too-large payloads are rejected before anything is sent.
        let last = self
            .writer
            .finish_frames(self.next_seq, self.max_allowed_packet)?;

        let sent = match self.transport.as_mut() {
            Some(transport) => transport.write_all(self.writer.as_bytes()),
            None => Err(closed_error()),
        };
        self.guard(sent)?;
        self.next_seq = last.wrapping_add(1);
        Ok(())
    }

    /// Read one logical packet and hand its payload to `consumer`.
    pub fn read_packet<T, F>(&mut self, consumer: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        let payload = self.read_payload()?;
        consumer(&payload)
    }

    /// Read one logical packet, joining continuation frames.
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        let result = self.read_frames();
        self.guard(result)
    }

    fn read_frames(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.read_pos == self.read_len {
                let transport = self.transport.as_mut().ok_or_else(closed_error)?;
                self.read_len = transport.read(&mut self.read_buf)?;
                self.read_pos = 0;
            }

            self.read_pos += self
                .decoder
                .parse_fragment(&self.read_buf, self.read_len, self.read_pos);

            if !self.decoder.is_complete() {
                continue;
            }

            let sequence = self.decoder.sequence();
            if sequence != self.next_seq {
                return Err(protocol_error(format!(
                    "packet sequence out of order: expected {}, got {}",
                    self.next_seq, sequence
                )));
            }
            self.next_seq = sequence.wrapping_add(1);

            if self.decoder.continues() {
                self.decoder.next_frame();
                continue;
            }

            let payload = self.decoder.take_payload();
            tracing::trace!(len = payload.len(), sequence, "Received packet");
            return Ok(payload);
        }
    }

    /// Apply an OK payload (tag 0x00 or 0xFE) to the session state.
    pub fn apply_ok(&mut self, payload: &[u8]) -> Result<OkPacket> {
        let ok = OkPacket::parse(payload, self.session.session_track());
        let ok = self.guard(ok)?;
        self.session.affected_rows = ok.affected_rows;
        self.session.last_insert_id = ok.last_insert_id;
        self.session.status_flags = ok.status_flags;
        self.session.warnings = ok.warnings;
        self.session.last_gtid = ok.gtid.clone();
        Ok(ok)
    }

    /// Apply an EOF payload to the session state.
    pub fn apply_eof(&mut self, payload: &[u8]) -> Result<EofPacket> {
        let eof = EofPacket::parse(payload);
        let eof = self.guard(eof)?;
        self.session.warnings = eof.warnings;
        self.session.status_flags = eof.status_flags;
        Ok(eof)
    }

    /// Replace the transport with its TLS-wrapped counterpart.
    ///
    /// Sequence numbering continues across the switch.
    pub fn upgrade(&mut self, config: &ClientConfig) -> Result<()> {
        let transport = self.transport.take().ok_or_else(closed_error)?;
        tracing::debug!(server_name = config.tls_server_name(), "Upgrading connection to TLS");
        match transport.upgrade(config) {
            Ok(upgraded) => {
                self.transport = Some(upgraded);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "TLS upgrade failed, connection closed");
                self.reset_buffers();
                Err(e)
            }
        }
    }

    /// Close the transport. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.reset_buffers();
    }

    fn reset_buffers(&mut self) {
        self.decoder.reset();
        self.read_pos = 0;
        self.read_len = 0;
        self.writer.clear();
    }

    /// Poison the connection when `result` carries anything other than a
    /// server-reported or client-side query error.
    pub(crate) fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if !matches!(e, Error::Query(_)) && self.transport.is_some() {
                tracing::warn!(error = %e, "Connection poisoned");
                self.close();
            }
        }
        result
    }
}
