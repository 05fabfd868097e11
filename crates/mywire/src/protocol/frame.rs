//! Incremental frame decoding.
//!
//! Bytes arrive from the transport in arbitrary chunks. [`FrameDecoder`]
//! consumes whatever is available, remembers where it stopped inside the
//! 4-byte header or the payload, and resumes on the next call.

use crate::protocol::MAX_PACKET_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingLength0,
    ReadingLength1,
    ReadingLength2,
    ReadingSequence,
    ReadingPayload,
}

/// Reassembles one frame's header and payload across reads.
///
/// Payload bytes of consecutive frames are appended to the same buffer, so
/// a continuation chain yields the concatenated logical payload once the
/// last frame (length below `MAX_PACKET_SIZE`) is complete.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    payload_len: usize,
    payload_read: usize,
    sequence: u8,
    payload: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::ReadingLength0,
            payload_len: 0,
            payload_read: 0,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Feed `buf[offset..len]`; returns how many bytes were consumed.
    ///
    /// Consumption stops at the end of the current frame so the caller can
    /// validate its sequence number before the next header is read.
    pub fn parse_fragment(&mut self, buf: &[u8], len: usize, offset: usize) -> usize {
        let end = len.min(buf.len());
        let mut pos = offset.min(end);

        while pos < end && !self.is_complete() {
            match self.state {
                State::ReadingLength0 => {
                    self.payload_len = usize::from(buf[pos]);
                    self.state = State::ReadingLength1;
                    pos += 1;
                }
                State::ReadingLength1 => {
                    self.payload_len |= usize::from(buf[pos]) << 8;
                    self.state = State::ReadingLength2;
                    pos += 1;
                }
                State::ReadingLength2 => {
                    self.payload_len |= usize::from(buf[pos]) << 16;
                    self.state = State::ReadingSequence;
                    pos += 1;
                }
                State::ReadingSequence => {
                    self.sequence = buf[pos];
                    self.payload_read = 0;
                    self.payload.reserve(self.payload_len);
                    self.state = State::ReadingPayload;
                    pos += 1;
                }
                State::ReadingPayload => {
                    let take = (self.payload_len - self.payload_read).min(end - pos);
                    self.payload.extend_from_slice(&buf[pos..pos + take]);
                    self.payload_read += take;
                    pos += take;
                }
            }
        }

        pos - offset.min(end)
    }

    /// The header and all payload bytes of the current frame have arrived.
    pub fn is_complete(&self) -> bool {
        self.state == State::ReadingPayload && self.payload_read == self.payload_len
    }

    /// The current frame is full-size, so another frame continues the payload.
    pub fn continues(&self) -> bool {
        self.payload_len == MAX_PACKET_SIZE
    }

    /// Sequence number of the current frame (valid once its header is read).
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Whether any header or payload bytes are pending.
    pub fn in_progress(&self) -> bool {
        self.state != State::ReadingLength0 || !self.payload.is_empty()
    }

    /// Prepare for the next frame of a continuation chain, keeping the payload.
    pub fn next_frame(&mut self) {
        self.state = State::ReadingLength0;
        self.payload_len = 0;
        self.payload_read = 0;
    }

    /// Take the assembled payload and reset for a new logical packet.
    pub fn take_payload(&mut self) -> Vec<u8> {
        self.next_frame();
        std::mem::take(&mut self.payload)
    }

    /// Drop any partial state.
    pub fn reset(&mut self) {
        self.next_frame();
        self.payload.clear();
    }
}
