#![cfg_attr(not(any(test, feature = "std")), no_std)]
//! Wire format shared by the SmartPort device engine and host-side tooling.

/// Command codes carried in the first payload byte of a command packet.
pub mod command;
/// Packet encoding and decoding, for both sides.
pub mod packet;

pub use command::CommandCode;

/// Sync bytes sent ahead of every packet. The receiver's framing eats the first one.
pub const SYNC_BYTES: [u8; 6] = [0xff, 0x3f, 0xcf, 0xf3, 0xfc, 0xff];

/// Packet begin mark, directly after the sync bytes.
pub const PBEGIN: u8 = 0xc3;
/// Packet end mark, directly after the checksum bytes.
pub const PEND: u8 = 0xc8;

/// Identity the host uses for itself in DEST/SRC.
pub const HOST_ID: u8 = 0x80;

/// Marker bits OR'd into both checksum bytes.
pub const CHECKSUM_MARKER: u8 = 0xaa;

/// Capacity of a packet buffer. A 512-byte data packet is 604 bytes with its terminator; the
/// rest is headroom for whatever the host clocks out after PEND.
pub const PACKET_BUFFER_LEN: usize = 768;

/// Size of a disk block, i.e. the payload of a data packet.
pub const BLOCK_LEN: usize = 512;

/// Packet TYPE field values.
pub mod packet_type {
    /// Command packet, and status/init reply.
    pub const STATUS: u8 = 0x80;
    /// Reply to a write-block data packet.
    pub const WRITE_STATUS: u8 = 0x81;
    /// Data packet.
    pub const DATA: u8 = 0x82;
    /// Extended-command data packet.
    pub const EXTENDED_DATA: u8 = 0xc2;
}

/// STAT byte values used by the fixed replies.
pub mod status {
    /// Reply STAT for a successful status-type reply.
    pub const OK: u8 = 0x80;
    /// Init reply STAT marking the last device in the chain.
    pub const LAST_DEVICE: u8 = 0xff;
    /// Init reply STAT for a device that has more devices behind it.
    pub const NOT_LAST_DEVICE: u8 = 0x80;
    /// STAT of the error reply.
    pub const ERROR_REPLY: u8 = 0xa1;
    /// SmartPort bus error code, returned when a data packet fails its checksum.
    pub const BUS_ERROR: u8 = 0x06;
}
