//! Payload encoding and frame splitting.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::Result;
use mywire_core::error::QueryErrorKind;

use crate::error::client_query_error;
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// A writer for MySQL protocol data.
///
/// In framed mode the buffer starts with a 4-byte header placeholder that
/// [`finish_frames`](Self::finish_frames) back-fills once the payload is
/// complete.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
    payload_start: usize,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            payload_start: 0,
        }
    }

    /// Clear the buffer and reserve room for a frame header.
    pub fn reset_framed(&mut self) {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[0; PacketHeader::SIZE]);
        self.payload_start = PacketHeader::SIZE;
    }

    /// Clear the buffer entirely, dropping any header placeholder.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.payload_start = 0;
    }

    /// Length of the payload written so far.
    pub fn len(&self) -> usize {
        self.buffer.len() - self.payload_start
    }

    /// True when nothing (not even a header placeholder) is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The payload bytes, excluding any header placeholder.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_start..]
    }

    /// The whole buffer: framed bytes after `finish_frames`, payload otherwise.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a u16 (little-endian).
    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u24 (little-endian, 3 bytes).
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    /// Write a u32 (little-endian).
    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u64 (little-endian).
    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC + 2 bytes: values up to 2^16
    /// - 0xFD + 3 bytes: values up to 2^24
    /// - 0xFE + 8 bytes: everything else
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x10000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    /// Write a length-encoded string.
    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a null-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (padding).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    /// Turn the buffered payload into wire frames starting at `sequence_id`.
    ///
    /// Fails with `PacketTooLarge` before anything is framed when the payload
    /// exceeds `max_payload`. Returns the sequence number of the last frame.
    pub fn finish_frames(&mut self, sequence_id: u8, max_payload: Option<usize>) -> Result<u8> {
        let len = self.len();
        if let Some(max) = max_payload {
            if len > max {
                return Err(client_query_error(
                    QueryErrorKind::PacketTooLarge,
                    format!(
                        "packet of {} bytes exceeds max_allowed_packet ({} bytes)",
                        len, max
                    ),
                ));
            }
        }

        if len < MAX_PACKET_SIZE && self.payload_start == PacketHeader::SIZE {
            let header = PacketHeader {
                payload_length: len as u32,
                sequence_id,
            };
            self.buffer[..PacketHeader::SIZE].copy_from_slice(&header.to_bytes());
            return Ok(sequence_id);
        }

        let payload = self.buffer.split_off(self.payload_start);
        let (framed, last) = encode_frames(&payload, sequence_id);
        self.buffer = framed;
        self.payload_start = 0;
        Ok(last)
    }
}

/// Split a payload into frames of at most `MAX_PACKET_SIZE` bytes.
///
/// A payload that is an exact multiple of the frame size (including a
/// zero-length one) is terminated by an empty frame. Returns the framed
/// bytes and the sequence number of the last frame.
pub fn encode_frames(payload: &[u8], mut sequence_id: u8) -> (Vec<u8>, u8) {
    let full = payload.len() / MAX_PACKET_SIZE;
    let mut out = Vec::with_capacity(payload.len() + (full + 1) * PacketHeader::SIZE);
    let mut chunks = payload.chunks_exact(MAX_PACKET_SIZE);

    for chunk in chunks.by_ref() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
    }

    let rest = chunks.remainder();
    let header = PacketHeader {
        payload_length: rest.len() as u32,
        sequence_id,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(rest);
    (out, sequence_id)
}
