//! Byte-at-a-time stream decoder. Strips stuffing, accumulates bytes into
//! a frame buffer, and maintains a running CRC over everything but the
//! trailing two (CRC) bytes.

use crate::constants::{ESCAPE, RAW_FRAME_MAX, SOT};
use crate::crc::crc_update;

/// What happened as a result of feeding one byte to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderEvent {
    /// Byte consumed, no frame boundary reached yet.
    Nothing,
    /// A delimiter byte was seen. Call [`Decoder::frame`] before
    /// [`Decoder::reset`] to inspect whatever was accumulated (it may be
    /// empty, e.g. for the delimiter that opens the very first frame).
    Boundary,
    /// The accumulation buffer would have overflowed; the decoder has
    /// already reset itself and the in-flight frame is dropped.
    Overflow,
}

pub struct Decoder {
    buf: [u8; RAW_FRAME_MAX],
    len: usize,
    running_crc: u16,
    escape_pending: bool,
}

impl Decoder {
    pub const fn new() -> Self {
        Decoder {
            buf: [0u8; RAW_FRAME_MAX],
            len: 0,
            running_crc: 0,
            escape_pending: false,
        }
    }

    /// Feeds one raw (still-stuffed) byte from the wire into the decoder.
    pub fn push_byte(&mut self, byte: u8) -> DecoderEvent {
        if byte == SOT {
            return DecoderEvent::Boundary;
        }

        if !self.escape_pending && byte == ESCAPE {
            self.escape_pending = true;
            return DecoderEvent::Nothing;
        }

        let actual = if self.escape_pending {
            self.escape_pending = false;
            byte ^ ESCAPE
        } else {
            byte
        };

        if self.len >= self.buf.len() {
            self.reset();
            return DecoderEvent::Overflow;
        }

        self.buf[self.len] = actual;
        self.len += 1;

        if self.len >= 3 {
            self.running_crc = crc_update(self.running_crc, self.buf[self.len - 3]);
        }

        DecoderEvent::Nothing
    }

    /// The bytes accumulated since the last reset, and the running CRC
    /// computed over all but the last two of them. `None` if nothing has
    /// been accumulated (e.g. two delimiters back to back).
    pub fn frame(&self) -> Option<(&[u8], u16)> {
        if self.len == 0 {
            None
        } else {
            Some((&self.buf[..self.len], self.running_crc))
        }
    }

    /// Clears accumulated state. Must be called after every
    /// [`DecoderEvent::Boundary`], whether or not a frame was dispatched.
    pub fn reset(&mut self) {
        self.escape_pending = false;
        self.running_crc = 0;
        self.len = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
