use crate::packet::{offset, split_checksum, xor, BodyLayout, PacketError, TX_SYNC_LEN};
use crate::{packet_type, status, BLOCK_LEN, HOST_ID, PBEGIN, PEND, SYNC_BYTES};

/// Header fields written by [`encode_packet`]. The counts are derived from the payload length.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub dest: u8,
    pub source: u8,
    pub packet_type: u8,
    pub aux: u8,
    pub stat: u8,
}
impl Envelope {
    /// Envelope of a reply from `source` to the host.
    pub const fn reply(source: u8, packet_type: u8, stat: u8) -> Self {
        Self {
            dest: HOST_ID,
            source,
            packet_type,
            aux: 0x80,
            stat,
        }
    }
}

/// Bit 7 of each byte, packed into bits 6..0 of one byte (first byte in bit 6).
fn msb_byte(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .enumerate()
        .fold(0x80, |msb, (k, &b)| msb | ((b >> (k + 1)) & (0x80 >> (k + 1))))
}

/// Turns the `payload_len` bytes at the front of `buf` into a complete packet, in place.
///
/// The body is assembled from the last group to the first so that no payload byte is
/// overwritten before it has been encoded. Returns the offset of the zero terminator.
pub fn encode_packet(
    buf: &mut [u8],
    payload_len: usize,
    envelope: Envelope,
) -> Result<usize, PacketError> {
    let layout = BodyLayout::for_payload(payload_len);
    if layout.groups > 0x7f {
        return Err(PacketError::PayloadTooLong(payload_len));
    }
    let fields = [
        envelope.dest,
        envelope.source,
        envelope.packet_type,
        envelope.aux,
        envelope.stat,
    ];
    if let Some(i) = fields.iter().position(|&b| b & 0x80 == 0) {
        return Err(PacketError::HeaderByte {
            at: offset::DEST + i,
            value: fields[i],
        });
    }
    let body = TX_SYNC_LEN + offset::BODY;
    let checksum_at = body + layout.encoded_len();
    let end = checksum_at + 2;
    if buf.len() < end + 2 {
        return Err(PacketError::BufferTooSmall {
            needed: end + 2,
            available: buf.len(),
        });
    }

    let mut checksum = xor(&buf[..payload_len]);

    let groups_at = body + layout.group_offset();
    for g in (0..layout.groups).rev() {
        let mut group = [0u8; 7];
        let src = layout.odd + 7 * g;
        group.copy_from_slice(&buf[src..src + 7]);
        let dst = groups_at + 8 * g;
        buf[dst] = msb_byte(&group);
        for (k, b) in group.iter().enumerate() {
            buf[dst + 1 + k] = b | 0x80;
        }
    }

    if layout.odd > 0 {
        let mut odd = [0u8; 6];
        let odd = &mut odd[..layout.odd];
        odd.copy_from_slice(&buf[..layout.odd]);
        buf[body] = msb_byte(odd);
        for (j, b) in odd.iter().enumerate() {
            buf[body + 1 + j] = b | 0x80;
        }
    }

    let header = [
        PBEGIN,
        envelope.dest,
        envelope.source,
        envelope.packet_type,
        envelope.aux,
        envelope.stat,
        0x80 | layout.odd as u8,
        0x80 | layout.groups as u8,
    ];
    buf[..TX_SYNC_LEN].copy_from_slice(&SYNC_BYTES);
    buf[TX_SYNC_LEN..body].copy_from_slice(&header);
    checksum ^= xor(&header[offset::DEST..]);

    buf[checksum_at..end].copy_from_slice(&split_checksum(checksum));
    buf[end] = PEND;
    buf[end + 1] = 0;
    Ok(end + 1)
}

/// Encodes the 512-byte block at the front of `buf` as a data packet from `source`.
pub fn encode_data_packet(buf: &mut [u8], source: u8) -> Result<usize, PacketError> {
    encode_packet(
        buf,
        BLOCK_LEN,
        Envelope::reply(source, packet_type::DATA, status::OK),
    )
}

/// Encodes the 512-byte block at the front of `buf` as an extended data packet from `source`.
pub fn encode_extended_data_packet(buf: &mut [u8], source: u8) -> Result<usize, PacketError> {
    encode_packet(
        buf,
        BLOCK_LEN,
        Envelope::reply(source, packet_type::EXTENDED_DATA, status::OK),
    )
}

/// Reply to a write-block data packet, carrying the result of the write.
pub fn encode_write_status_packet(
    buf: &mut [u8],
    source: u8,
    status: u8,
) -> Result<usize, PacketError> {
    encode_packet(
        buf,
        0,
        Envelope::reply(source, packet_type::WRITE_STATUS, status | 0x80),
    )
}

/// Reply to INIT. `status` is [`status::LAST_DEVICE`] for the last device in the chain.
pub fn encode_init_reply_packet(
    buf: &mut [u8],
    source: u8,
    status: u8,
) -> Result<usize, PacketError> {
    encode_packet(buf, 0, Envelope::reply(source, packet_type::STATUS, status))
}

pub fn encode_error_reply_packet(buf: &mut [u8], source: u8) -> Result<usize, PacketError> {
    encode_packet(
        buf,
        0,
        Envelope::reply(source, packet_type::STATUS, status::ERROR_REPLY),
    )
}

/// Host side: a command packet addressed to `dest`. `payload[0]` is the command code.
pub fn encode_command_packet(
    buf: &mut [u8],
    dest: u8,
    payload: &[u8],
) -> Result<usize, PacketError> {
    if buf.len() < payload.len() {
        return Err(PacketError::BufferTooSmall {
            needed: payload.len(),
            available: buf.len(),
        });
    }
    buf[..payload.len()].copy_from_slice(payload);
    encode_packet(
        buf,
        payload.len(),
        Envelope {
            dest,
            source: HOST_ID,
            packet_type: packet_type::STATUS,
            aux: 0x80,
            stat: 0x80,
        },
    )
}
