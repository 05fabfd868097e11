//! Payload decoding.
//!
//! A [`PacketReader`] is a cursor over one logical payload. Every read is
//! bounds-checked; running off the end is a protocol error, never a panic.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::Result;

use crate::error::protocol_error;

/// Lead byte marking a NULL cell in text rows.
pub const NULL_MARKER: u8 = 0xFB;

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(protocol_error(format!(
                "truncated payload reading {}: need {} bytes, {} left",
                what,
                len,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.take_array("u16").map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let b = self.take(3, "u24")?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.take_array("u32").map(u32::from_le_bytes)
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.take_array("u64").map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    ///
    /// 0xFB (NULL) and 0xFF are rejected; callers that accept NULL use
    /// [`read_lenenc_bytes_or_null`](Self::read_lenenc_bytes_or_null).
    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Ok(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB => Err(protocol_error("unexpected NULL length-encoded integer")),
            0xFF => Err(protocol_error("unexpected length-encoded integer 0xFF")),
        }
    }

    fn lenenc_len(&mut self) -> Result<usize> {
        let len = self.read_lenenc_int()?;
        usize::try_from(len).map_err(|_| protocol_error("length-encoded length overflows usize"))
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_len()?;
        self.take(len, "length-encoded string")
    }

    /// Read a length-encoded byte slice, `None` for the NULL marker.
    pub fn read_lenenc_bytes_or_null(&mut self) -> Result<Option<&'a [u8]>> {
        if self.peek() == Some(NULL_MARKER) {
            self.pos += 1;
            return Ok(None);
        }
        self.read_lenenc_bytes().map(Some)
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self) -> Result<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a null-terminated byte string; the terminator is consumed.
    pub fn read_null_bytes(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| protocol_error("unterminated null-terminated string"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// Read a null-terminated string (lossy UTF-8).
    pub fn read_null_string(&mut self) -> Result<String> {
        self.read_null_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read up to a NUL or the end of the payload, whichever comes first.
    ///
    /// Some servers omit the terminator after the last string of a packet.
    pub fn read_null_string_lenient(&mut self) -> String {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0);
        let s = String::from_utf8_lossy(&rest[..end.unwrap_or(rest.len())]).into_owned();
        self.pos += end.map_or(rest.len(), |e| e + 1);
        s
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len, "fixed-length string")
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Read remaining data as a string (lossy UTF-8).
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n, "skipped bytes").map(|_| ())
    }
}
