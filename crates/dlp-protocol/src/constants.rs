//! Wire-level and timing constants fixed by compatibility with the source
//! firmware.

/// Start-of-transmission / end-of-transmission delimiter. The same byte
/// value closes a frame as opens the next one.
pub const SOT: u8 = 0x7D;
/// Escape byte used by the stuffing rule.
pub const ESCAPE: u8 = 0x7C;

/// Maximum de-stuffed frame length between two delimiters.
pub const RAW_FRAME_MAX: usize = 510;
/// I-frame data field capacity: `RAW_FRAME_MAX - addr(1) - control(1) - crc(2)`.
pub const I_FRAME_DATA_MAX: usize = RAW_FRAME_MAX - 1 - 1 - 2;
/// Worst case on-wire length of one frame: every raw byte needs stuffing,
/// plus the two delimiter bytes.
pub const MAX_ENCODED_FRAME_LEN: usize = 2 + 2 * RAW_FRAME_MAX;

/// Capacity of the S/U control-frame outbound queue.
pub const CONTROL_QUEUE_CAPACITY: usize = 15;
/// Capacity of the delivered-byte queue: 3x the I-frame data capacity.
pub const DELIVERED_QUEUE_CAPACITY: usize = I_FRAME_DATA_MAX * 3;

/// Default I-frame retransmission timeout.
pub const DEFAULT_RETRY_TIMEOUT_MS: u32 = 500;
/// Consecutive TX or RX errors that force a disconnect.
pub const ERROR_THRESHOLD: u8 = 10;
/// Slave connect-request beacon period.
pub const SLAVE_BEACON_PERIOD_MS: u32 = 100;
/// Grace period `master_listen(false)`/`slave_disconnect` wait for the
/// peer's DISCONNECT_ACK before forcing the teardown through anyway.
pub const DISCONNECT_GRACE_MS: u32 = 500;
/// Per-fragment safety timeout inside `put_buffer`, independent of the
/// caller-supplied overall timeout.
pub const FRAGMENT_SAFETY_TIMEOUT_MS: u32 = 3000;
/// Number of best-effort repeats for DISCONNECT / DISCONNECT_ACK frames.
pub const DISCONNECT_REPEAT_COUNT: u8 = 3;
