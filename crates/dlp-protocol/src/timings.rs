//! Compile-time timing configuration. Parameterizing these as trait
//! constants (rather than hardcoding them, as the source does) lets a host
//! test harness shrink every timeout without touching engine code.

use core::time::Duration;

use crate::constants::{
    DEFAULT_RETRY_TIMEOUT_MS, DISCONNECT_GRACE_MS, FRAGMENT_SAFETY_TIMEOUT_MS, SLAVE_BEACON_PERIOD_MS,
};

pub trait DlpTimings {
    /// How long the engine waits for an S:ACK/S:NACK before retrying the
    /// outstanding I-frame.
    const RETRY_TIMEOUT: Duration;
    /// How often a CONNECTING slave repeats its U:CONNECT beacon.
    const SLAVE_BEACON_PERIOD: Duration;
    /// How long `slave_disconnect` waits for the peer's DISCONNECT_ACK
    /// before forcing the teardown anyway.
    const DISCONNECT_GRACE: Duration;
    /// Per-fragment safety timeout inside `put_buffer`, independent of the
    /// caller-supplied overall timeout.
    const FRAGMENT_SAFETY_TIMEOUT: Duration;
}

/// The timing values observed in the source firmware.
pub struct DefaultDlpTimings;

impl DlpTimings for DefaultDlpTimings {
    const RETRY_TIMEOUT: Duration = Duration::from_millis(DEFAULT_RETRY_TIMEOUT_MS as u64);
    const SLAVE_BEACON_PERIOD: Duration = Duration::from_millis(SLAVE_BEACON_PERIOD_MS as u64);
    const DISCONNECT_GRACE: Duration = Duration::from_millis(DISCONNECT_GRACE_MS as u64);
    const FRAGMENT_SAFETY_TIMEOUT: Duration = Duration::from_millis(FRAGMENT_SAFETY_TIMEOUT_MS as u64);
}
