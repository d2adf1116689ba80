//! Typed error surface for the pieces of the engine that can fail in more
//! than one way. Every public, boolean-returning entry point in `engine`
//! is a thin wrapper around one of these that logs the `Err` and reports
//! success/failure as a `bool`, so the public API stays bit-compatible
//! with the source while richer detail is available to callers (host
//! tooling, tests) that want it.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DlpError {
    /// Decoded buffer shorter than 4 bytes or longer than the wire maximum.
    Framing,
    /// Control byte's tag bits don't match I, S or U.
    UnknownControlClass,
    /// U-frame's combined 5-bit type isn't one of the seven defined values.
    UnknownUFrameType,
    /// Address byte's `is_8bit` bit was set; the source never produces
    /// this and its meaning is unspecified.
    InvalidAddressBit,
    /// Reported CRC didn't match the CRC recomputed over the frame.
    CrcMismatch,
    /// The decoder's internal buffer would have overflowed.
    BufferOverflow,
    /// A caller tried to write more bytes into one fragment than the
    /// I-frame data field can hold.
    FragmentTooLarge,
    /// `put_buffer` was called while the link isn't CONNECTED.
    NotConnected,
    /// `put_buffer` was called while a previous call was still in flight.
    PutBufferBusy,
    /// The underlying bus rejected a transfer (it was still busy sending
    /// the previous one).
    TransferFailed,
}

impl fmt::Display for DlpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DlpError::Framing => "malformed frame length",
            DlpError::UnknownControlClass => "unknown control-field tag",
            DlpError::UnknownUFrameType => "unknown U-frame type",
            DlpError::InvalidAddressBit => "is_8bit bit set on received address",
            DlpError::CrcMismatch => "CRC mismatch",
            DlpError::BufferOverflow => "buffer overflow",
            DlpError::FragmentTooLarge => "fragment exceeds I-frame data capacity",
            DlpError::NotConnected => "link not connected",
            DlpError::PutBufferBusy => "put_buffer already in progress",
            DlpError::TransferFailed => "bus rejected the transfer",
        };
        f.write_str(msg)
    }
}
