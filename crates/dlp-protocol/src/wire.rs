//! The on-wire bit layout: address and control field bit-packing, frame
//! classification, and the stuffing-aware encoder/parser. The C source
//! implemented each of these as a pair of `*SeparateParts`/`*MergeParts`
//! shift-and-mask functions operating on a mutable bitfield struct; here
//! the same layout is expressed as tagged-sum types with `from_wire`/
//! `to_wire` conversions.

use crate::constants::{ESCAPE, I_FRAME_DATA_MAX, RAW_FRAME_MAX, SOT};
use crate::crc::crc_update;
use crate::error::DlpError;

/// A 7-bit peer address. Only two values are meaningful to the core:
/// [`Address::MASTER`] (0) and [`Address::SLAVE`] (1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address(u8);

impl Address {
    pub const MASTER: Address = Address(0);
    pub const SLAVE: Address = Address(1);

    pub const fn new(addr: u8) -> Self {
        Address(addr & 0x7f)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Unpacks an address byte. Bit 0 is `is_8bit`, in inverted sense: the
    /// source always transmits 0 there. A received 1 has unspecified
    /// meaning and is rejected rather than guessed at.
    pub fn from_wire(byte: u8) -> Result<Address, DlpError> {
        if byte & 0x01 != 0 {
            return Err(DlpError::InvalidAddressBit);
        }
        Ok(Address(byte >> 1))
    }

    pub const fn to_wire(self) -> u8 {
        self.0 << 1
    }
}

/// S-frame supervisory type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SKind {
    Ack,
    Nack,
}

impl SKind {
    const fn value(self) -> u8 {
        match self {
            SKind::Ack => 0,
            SKind::Nack => 2,
        }
    }

    const fn from_value(v: u8) -> Option<SKind> {
        match v {
            0 => Some(SKind::Ack),
            2 => Some(SKind::Nack),
            _ => None,
        }
    }
}

/// U-frame unnumbered-control type. Values 0, 4 and 7 are never produced
/// by the source and are rejected on receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UKind {
    Connect,
    ConnectAck,
    ConnectNack,
    Disconnect,
    DisconnectAck,
    GenericError,
    SeqReset,
}

impl UKind {
    const fn value(self) -> u8 {
        match self {
            UKind::Connect => 1,
            UKind::ConnectAck => 2,
            UKind::ConnectNack => 3,
            UKind::Disconnect => 5,
            UKind::DisconnectAck => 6,
            UKind::GenericError => 8,
            UKind::SeqReset => 9,
        }
    }

    const fn from_value(v: u8) -> Option<UKind> {
        match v {
            1 => Some(UKind::Connect),
            2 => Some(UKind::ConnectAck),
            3 => Some(UKind::ConnectNack),
            5 => Some(UKind::Disconnect),
            6 => Some(UKind::DisconnectAck),
            8 => Some(UKind::GenericError),
            9 => Some(UKind::SeqReset),
            _ => None,
        }
    }
}

/// The packed control byte, already classified into its I/S/U variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    I { tx_seq: u8, rx_seq: u8 },
    S { kind: SKind, rx_seq: u8 },
    U { kind: UKind },
}

impl Control {
    pub fn from_wire(byte: u8) -> Result<Control, DlpError> {
        if byte & 0x01 == 0 {
            let tx_seq = (byte >> 1) & 0x07;
            let rx_seq = (byte >> 5) & 0x07;
            return Ok(Control::I { tx_seq, rx_seq });
        }

        if (byte >> 1) & 0x01 == 0 {
            let rx_seq = (byte >> 5) & 0x07;
            let type_val = (byte >> 1) & 0x07;
            let kind = SKind::from_value(type_val).ok_or(DlpError::UnknownControlClass)?;
            Ok(Control::S { kind, rx_seq })
        } else {
            let type_lsb = (byte >> 2) & 0x03;
            let type_msb = (byte >> 5) & 0x07;
            let type_val = type_lsb | (type_msb << 2);
            let kind = UKind::from_value(type_val).ok_or(DlpError::UnknownUFrameType)?;
            Ok(Control::U { kind })
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Control::I { tx_seq, rx_seq } => ((rx_seq & 0x07) << 5) | ((tx_seq & 0x07) << 1),
            Control::S { kind, rx_seq } => {
                0x01 | ((kind.value() & 0x07) << 1) | ((rx_seq & 0x07) << 5)
            }
            Control::U { kind } => {
                let type_val = kind.value();
                let lsb = type_val & 0x03;
                let msb = (type_val >> 2) & 0x07;
                0x03 | (lsb << 2) | (msb << 5)
            }
        }
    }
}

/// Reads the two CRC bytes embedded at the tail of a de-stuffed frame
/// buffer, as the big-endian 16-bit value the source compares against.
pub fn reported_crc(buf: &[u8]) -> u16 {
    debug_assert!(buf.len() >= 2);
    let len = buf.len();
    (buf[len - 2] as u16) << 8 | buf[len - 1] as u16
}

/// Splits a de-stuffed frame buffer (length already validated as `4..=510`)
/// into its address, control and data parts. CRC is *not* checked here —
/// the receiver already maintains the running CRC incrementally and
/// compares it to `reported_crc` itself.
pub fn parse_frame(buf: &[u8]) -> Result<(Address, Control, &[u8]), DlpError> {
    if buf.len() < 4 || buf.len() > RAW_FRAME_MAX {
        return Err(DlpError::Framing);
    }

    let address = Address::from_wire(buf[0])?;
    let control = Control::from_wire(buf[1])?;
    let data: &[u8] = match control {
        Control::I { .. } => &buf[2..buf.len() - 2],
        _ => &[],
    };

    Ok((address, control, data))
}

fn push(out: &mut [u8], n: &mut usize, byte: u8) -> Result<(), DlpError> {
    if *n >= out.len() {
        return Err(DlpError::BufferOverflow);
    }
    out[*n] = byte;
    *n += 1;
    Ok(())
}

fn push_stuffed(out: &mut [u8], n: &mut usize, byte: u8) -> Result<(), DlpError> {
    if byte == ESCAPE || byte == SOT {
        push(out, n, ESCAPE)?;
        push(out, n, byte ^ ESCAPE)?;
    } else {
        push(out, n, byte)?;
    }
    Ok(())
}

/// Serializes a frame onto the wire: `SOT <stuffed(addr ctrl data crcHi
/// crcLo)> EOT`. Returns the number of bytes written into `out`, which
/// must be at least [`crate::constants::MAX_ENCODED_FRAME_LEN`] long to be
/// guaranteed to fit the worst case.
pub fn encode_frame(
    address: Address,
    control: Control,
    data: &[u8],
    out: &mut [u8],
) -> Result<usize, DlpError> {
    if data.len() > I_FRAME_DATA_MAX {
        return Err(DlpError::FragmentTooLarge);
    }

    let addr_byte = address.to_wire();
    let ctrl_byte = control.to_wire();

    let mut crc = 0u16;
    crc = crc_update(crc, addr_byte);
    crc = crc_update(crc, ctrl_byte);
    for &b in data {
        crc = crc_update(crc, b);
    }

    let mut n = 0usize;
    push(out, &mut n, SOT)?;
    push_stuffed(out, &mut n, addr_byte)?;
    push_stuffed(out, &mut n, ctrl_byte)?;
    for &b in data {
        push_stuffed(out, &mut n, b)?;
    }
    push_stuffed(out, &mut n, (crc >> 8) as u8)?;
    push_stuffed(out, &mut n, (crc & 0xff) as u8)?;
    push(out, &mut n, SOT)?;

    Ok(n)
}
