use crate::packet::{join_checksum, packet_length, BodyLayout, PacketError, PacketHeader};
use crate::{BLOCK_LEN, PEND};

/// Result of an in-place decode: the payload now occupies `buf[..payload_len]`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub payload_len: usize,
}

/// Reads the header and checks that PEND sits where the counts say it should. Returns the
/// header and the checksum carried by the packet.
fn frame(buf: &[u8]) -> Result<(PacketHeader, u8), PacketError> {
    let header = PacketHeader::read(buf)?;
    let end = header.end();
    match buf.get(end) {
        None => Err(PacketError::BufferTooSmall {
            needed: end + 1,
            available: buf.len(),
        }),
        Some(&PEND) => {
            let at = header.checksum();
            Ok((header, join_checksum([buf[at], buf[at + 1]])))
        }
        Some(&found) => Err(PacketError::MissingEnd { at: end, found }),
    }
}

/// Payload byte `i` of a body starting at `body`.
fn decoded_byte(buf: &[u8], body: usize, layout: BodyLayout, i: usize) -> u8 {
    let (msb_at, data_at, bit) = if i < layout.odd {
        (body, body + 1 + i, i)
    } else {
        let j = i - layout.odd;
        let group = body + layout.group_offset() + 8 * (j / 7);
        (group, group + 1 + j % 7, j % 7)
    };
    (buf[data_at] & 0x7f) | ((buf[msb_at] << (bit + 1)) & 0x80)
}

fn check(computed: u8, expected: u8) -> Result<(), PacketError> {
    if computed == expected {
        Ok(())
    } else {
        Err(PacketError::Checksum { computed, expected })
    }
}

/// Decodes a packet in place, leaving the payload at the front of `buf`.
///
/// Every payload byte is written to an offset below the bytes it is read from, so a single
/// forward pass is safe. The header is overwritten in the process; it is returned instead.
pub fn decode_packet(buf: &mut [u8]) -> Result<DecodedPacket, PacketError> {
    let (header, expected) = frame(buf)?;
    let mut computed = header.header_checksum(buf);
    let body = header.body();
    let payload_len = header.layout.payload_len();
    for i in 0..payload_len {
        let b = decoded_byte(buf, body, header.layout, i);
        computed ^= b;
        buf[i] = b;
    }
    check(computed, expected)?;
    Ok(DecodedPacket {
        header,
        payload_len,
    })
}

/// [`decode_packet`] for the data packet that follows a write-block command.
pub fn decode_data_packet(buf: &mut [u8]) -> Result<DecodedPacket, PacketError> {
    let decoded = decode_packet(buf)?;
    if decoded.payload_len != BLOCK_LEN {
        return Err(PacketError::BlockLength(decoded.payload_len));
    }
    Ok(decoded)
}

/// Checks framing and checksum without touching the buffer.
pub fn verify_checksum(buf: &[u8]) -> Result<PacketHeader, PacketError> {
    let (header, expected) = frame(buf)?;
    let body = header.body();
    let computed = (0..header.layout.payload_len())
        .map(|i| decoded_byte(buf, body, header.layout, i))
        .fold(header.header_checksum(buf), |acc, b| acc ^ b);
    check(computed, expected)?;
    Ok(header)
}

/// Decodes the payload into `out`, leaving `buf` intact.
pub fn decode_payload(buf: &[u8], out: &mut [u8]) -> Result<PacketHeader, PacketError> {
    let header = verify_checksum(buf)?;
    let len = header.layout.payload_len();
    if out.len() < len {
        return Err(PacketError::BufferTooSmall {
            needed: len,
            available: out.len(),
        });
    }
    let body = header.body();
    for (i, b) in out[..len].iter_mut().enumerate() {
        *b = decoded_byte(buf, body, header.layout, i);
    }
    Ok(header)
}

/// Checksum check for a received command packet.
///
/// Command packets always carry nine payload bytes, so the body layout is fixed rather than
/// read from the counts, and the checksum is located from the end of the received frame.
pub fn verify_command_checksum(buf: &[u8]) -> Result<(), PacketError> {
    const LAYOUT: BodyLayout = BodyLayout::for_payload(9);
    let header = PacketHeader::read(buf)?;
    let last = packet_length(buf).ok_or(PacketError::Unterminated)?;
    let body = header.body();
    if last < body + LAYOUT.encoded_len() + 2 {
        return Err(PacketError::Unterminated);
    }
    let expected = join_checksum([buf[last - 2], buf[last - 1]]);
    let computed = (0..LAYOUT.payload_len())
        .map(|i| decoded_byte(buf, body, LAYOUT, i))
        .fold(header.header_checksum(buf), |acc, b| acc ^ b);
    check(computed, expected)
}
