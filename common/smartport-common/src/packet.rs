//! Packet format, as sent by the device:
//! ```txt
//! | sync                | PBEGIN | header                                       | body          | checksum  | PEND | 0 |
//! | FF 3F CF F3 FC FF   | C3     | DEST SRC TYPE AUX STAT ODDCNT GRP7CNT        | see below     | even odd  | C8   | 0 |
//!   +0:6                  +6       +7:7                                           +14:(n)         +(14+n):2   ...
//! ```
//! The body carries `ODDCNT & 0x7f` odd bytes and `GRP7CNT & 0x7f` groups of seven:
//! ```txt
//! | ODDMSB | odd bytes ... | GRPMSB b0 b1 b2 b3 b4 b5 b6 | GRPMSB b0 ... |
//! ```
//! The odd section is absent when there are no odd bytes. Every body byte has bit 7 set; the
//! stripped bit 7 of byte `k` travels as bit `6 - k` of the preceding MSB byte.
//!
//! The checksum is the XOR of DEST..GRP7CNT and all payload bytes, split into its even bits
//! (first byte) and odd bits shifted down (second byte), both OR'd with `0xAA`.
//!
//! On the receive side the first sync byte is consumed by the framing, so every offset is one
//! lower; decoding locates PBEGIN instead of assuming a fixed position.

use crate::{CHECKSUM_MARKER, PBEGIN, SYNC_BYTES};
use core::fmt;
use thiserror::Error;

mod decode;
pub use decode::{
    decode_data_packet, decode_packet, decode_payload, verify_checksum, verify_command_checksum,
    DecodedPacket,
};

mod encode;
pub use encode::{
    encode_command_packet, encode_data_packet, encode_error_reply_packet,
    encode_extended_data_packet, encode_init_reply_packet, encode_packet,
    encode_write_status_packet, Envelope,
};

/// Offsets of the header fields, relative to PBEGIN.
pub mod offset {
    pub const DEST: usize = 1;
    pub const SRC: usize = 2;
    pub const TYPE: usize = 3;
    pub const AUX: usize = 4;
    pub const STAT: usize = 5;
    pub const ODDCNT: usize = 6;
    pub const GRP7CNT: usize = 7;
    pub const BODY: usize = 8;
    /// First payload byte of a command packet: its first (and only) odd-section data byte
    /// comes right after the odd MSB byte.
    pub const COMMAND: usize = BODY + 1;
}

/// Number of bytes preceding PBEGIN on the transmit side.
pub const TX_SYNC_LEN: usize = SYNC_BYTES.len();

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum PacketError {
    #[error("packet needs {needed} bytes, buffer holds {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("payload of {0} bytes does not fit in 127 groups")]
    PayloadTooLong(usize),
    #[error("no packet begin mark within the sync window")]
    MissingBegin,
    #[error("expected packet end mark at offset {at}, found {found:02x}")]
    MissingEnd { at: usize, found: u8 },
    #[error("odd byte count {0} out of range")]
    OddCount(usize),
    #[error("checksum mismatch: calculated {computed:02x}, packet carries {expected:02x}")]
    Checksum { computed: u8, expected: u8 },
    #[error("packet buffer has no terminator")]
    Unterminated,
    #[error("data packet carries {0} bytes instead of a block")]
    BlockLength(usize),
    #[error("header byte {value:02x} at offset {at} has bit 7 clear")]
    HeaderByte { at: usize, value: u8 },
}
impl PacketError {
    /// SmartPort error code to report back to the host for this failure.
    pub const fn bus_code(&self) -> u8 {
        crate::status::BUS_ERROR
    }
}

/// How a payload is split into odd bytes and groups of seven.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BodyLayout {
    pub odd: usize,
    pub groups: usize,
}
impl BodyLayout {
    pub const fn for_payload(len: usize) -> Self {
        Self {
            odd: len % 7,
            groups: len / 7,
        }
    }
    pub const fn payload_len(&self) -> usize {
        self.odd + 7 * self.groups
    }
    /// Offset of the first group within the body.
    pub const fn group_offset(&self) -> usize {
        if self.odd > 0 {
            1 + self.odd
        } else {
            0
        }
    }
    pub const fn encoded_len(&self) -> usize {
        self.group_offset() + 8 * self.groups
    }
}

/// Header fields of a packet, as found in a buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    /// Offset of PBEGIN in the buffer.
    pub begin: usize,
    pub dest: u8,
    pub src: u8,
    pub packet_type: u8,
    pub aux: u8,
    pub stat: u8,
    pub layout: BodyLayout,
}
impl PacketHeader {
    pub fn read(buf: &[u8]) -> Result<Self, PacketError> {
        let begin = packet_begin(buf)?;
        let needed = begin + offset::BODY;
        if buf.len() < needed {
            return Err(PacketError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }
        let h = &buf[begin..needed];
        let odd = (h[offset::ODDCNT] & 0x7f) as usize;
        if odd >= 7 {
            return Err(PacketError::OddCount(odd));
        }
        Ok(Self {
            begin,
            dest: h[offset::DEST],
            src: h[offset::SRC],
            packet_type: h[offset::TYPE],
            aux: h[offset::AUX],
            stat: h[offset::STAT],
            layout: BodyLayout {
                odd,
                groups: (h[offset::GRP7CNT] & 0x7f) as usize,
            },
        })
    }
    /// Offset of the first body byte in the buffer.
    pub const fn body(&self) -> usize {
        self.begin + offset::BODY
    }
    /// Offset of the first checksum byte in the buffer.
    pub const fn checksum(&self) -> usize {
        self.body() + self.layout.encoded_len()
    }
    /// Offset of PEND in the buffer.
    pub const fn end(&self) -> usize {
        self.checksum() + 2
    }
    /// XOR of DEST..GRP7CNT, the header's share of the packet checksum.
    pub fn header_checksum(&self, buf: &[u8]) -> u8 {
        xor(&buf[self.begin + offset::DEST..self.body()])
    }
}

/// Locates PBEGIN within the sync window.
pub fn packet_begin(buf: &[u8]) -> Result<usize, PacketError> {
    buf.iter()
        .take(TX_SYNC_LEN + 1)
        .position(|&b| b == PBEGIN)
        .ok_or(PacketError::MissingBegin)
}

/// Offset of the last meaningful byte (normally PEND), i.e. one before the zero terminator.
/// `None` if the buffer is empty up front or has no terminator.
pub fn packet_length(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == 0)?.checked_sub(1)
}

pub(crate) fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Splits a checksum into the two marker-carrying bytes sent on the wire.
pub const fn split_checksum(checksum: u8) -> [u8; 2] {
    [checksum | CHECKSUM_MARKER, (checksum >> 1) | CHECKSUM_MARKER]
}

/// Inverse of [`split_checksum`].
pub const fn join_checksum(bytes: [u8; 2]) -> u8 {
    (bytes[0] & 0x55) | ((bytes[1] & 0x55) << 1)
}

/// Hex and ASCII dump of a packet, sixteen bytes per row.
pub struct PacketDump<'a>(pub &'a [u8]);
impl fmt::Display for PacketDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, chunk) in self.0.chunks(16).enumerate() {
            write!(f, "{:04X}: ", row * 16)?;
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => write!(f, "{b:02x} ")?,
                    None => f.write_str("   ")?,
                }
            }
            f.write_str("-")?;
            for &b in chunk {
                let c = if (0x20..0x7f).contains(&b) { b as char } else { '.' };
                write!(f, "{c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
