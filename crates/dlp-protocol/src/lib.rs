//! The data-link protocol engine: a byte-stuffed, CRC-16-protected,
//! connection-oriented, stop-and-wait reliable delivery protocol running
//! over a raw UART-style byte stream.
#![no_std]

pub mod config;
pub mod constants;
pub mod crc;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod fragmenter;
pub mod timings;
pub mod wire;

pub use config::DlpConfig;
pub use engine::{DlpEngine, Role};
pub use error::DlpError;
pub use timings::{DefaultDlpTimings, DlpTimings};
pub use wire::{Address, Control, SKind, UKind};
