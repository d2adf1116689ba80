//! Runtime-configurable surface of a [`crate::engine::DlpEngine`].
//!
//! The source's per-port `set_data_port`/`set_debug_port` calls become, in
//! this crate, a choice of which `BusRead + BusWrite` implementor the
//! engine is constructed over; only the flags the source actually flips at
//! runtime without touching the bus wiring remain here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DlpConfig {
    /// Mirrors the source's `gfProtocolIsUsingPort`: when `false`,
    /// `update()` skips bus I/O entirely, leaving timers and queued state
    /// untouched.
    pub use_port: bool,
    /// Mirrors the source's `gfProtocolDebugEnable`: gates this engine
    /// instance's own `dev_trace!` call sites (the optional debug/trace
    /// sink) at runtime, on top of the `dev-log-level-*` feature on
    /// `dlp-common` that gates them at compile time. `dev_info!`/`dev_warn!`
    /// call sites for state transitions and errors are unconditional.
    pub debug_enabled: bool,
    /// Whether a CRC mismatch while CONNECTED queues a U:GENERIC_ERROR
    /// reply. The source always does this behind a permanently-enabled
    /// debug switch; kept on by default here too, but made toggleable.
    pub emit_generic_error_on_crc_mismatch: bool,
}

impl Default for DlpConfig {
    fn default() -> Self {
        DlpConfig {
            use_port: true,
            debug_enabled: false,
            emit_generic_error_on_crc_mismatch: true,
        }
    }
}
