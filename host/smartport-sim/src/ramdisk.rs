use log::{debug, warn};
use smartport_bus::{Command, DeviceError, LogicalDevice, Transport};
use smartport_common::packet::{
    decode_data_packet, decode_payload, encode_data_packet, encode_error_reply_packet,
    encode_packet, encode_write_status_packet, Envelope,
};
use smartport_common::{packet_type, status, CommandCode, BLOCK_LEN, PACKET_BUFFER_LEN};

pub type Block = [u8; BLOCK_LEN];

/// Command packets carry the command code, a parameter count and seven parameter bytes.
const COMMAND_PAYLOAD_LEN: usize = 9;

/// General status byte: block device, writable, readable, online.
const STATUS_BLOCK_DEVICE: u8 = 0xf8;

/// Status byte reported for a block number past the end of the disk.
const BAD_BLOCK: u8 = 0x2d;

/// A block device held in memory.
pub struct RamDisk {
    name: String,
    blocks: Vec<Block>,
    buf: Box<[u8; PACKET_BUFFER_LEN]>,
}

impl RamDisk {
    pub fn new(name: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            name: name.into(),
            blocks,
            buf: Box::new([0; PACKET_BUFFER_LEN]),
        }
    }

    /// Block number of the read/write command in the packet buffer.
    fn block_number(&self, command: &Command) -> Result<usize, DeviceError> {
        let mut payload = [0u8; COMMAND_PAYLOAD_LEN];
        decode_payload(&self.buf[..=command.len], &mut payload)?;
        Ok(u32::from_le_bytes([payload[4], payload[5], payload[6], 0]) as usize)
    }

    fn read_block(
        &mut self,
        link: &mut dyn Transport,
        unit: u8,
        n: usize,
    ) -> Result<(), DeviceError> {
        let Some(block) = self.blocks.get(n) else {
            warn!("[{}]: read of block {n}, disk has {}", self.name, self.blocks.len());
            return self.reply_error(link, unit);
        };
        debug!("[{}]: read block {n}", self.name);
        self.buf[..BLOCK_LEN].copy_from_slice(block);
        encode_data_packet(&mut self.buf[..], unit)?;
        link.transmit_frame(&self.buf[..])?;
        Ok(())
    }

    fn write_block(
        &mut self,
        link: &mut dyn Transport,
        unit: u8,
        n: usize,
    ) -> Result<(), DeviceError> {
        link.receive_frame(&mut self.buf[..])?;
        let stat = match decode_data_packet(&mut self.buf[..]) {
            Err(e) => {
                warn!("[{}]: bad data packet for block {n}: {e}", self.name);
                e.bus_code()
            }
            Ok(_) => match self.blocks.get_mut(n) {
                Some(block) => {
                    debug!("[{}]: write block {n}", self.name);
                    block.copy_from_slice(&self.buf[..BLOCK_LEN]);
                    0
                }
                None => {
                    warn!(
                        "[{}]: write of block {n}, disk has {}",
                        self.name,
                        self.blocks.len()
                    );
                    BAD_BLOCK
                }
            },
        };
        encode_write_status_packet(&mut self.buf[..], unit, stat)?;
        link.transmit_frame(&self.buf[..])?;
        Ok(())
    }

    fn status(&mut self, link: &mut dyn Transport, unit: u8) -> Result<(), DeviceError> {
        let [lo, mid, hi, _] = (self.blocks.len() as u32).to_le_bytes();
        self.buf[..4].copy_from_slice(&[STATUS_BLOCK_DEVICE, lo, mid, hi]);
        encode_packet(
            &mut self.buf[..],
            4,
            Envelope::reply(unit, packet_type::STATUS, status::OK),
        )?;
        link.transmit_frame(&self.buf[..])?;
        Ok(())
    }

    fn reply_error(&mut self, link: &mut dyn Transport, unit: u8) -> Result<(), DeviceError> {
        encode_error_reply_packet(&mut self.buf[..], unit)?;
        link.transmit_frame(&self.buf[..])?;
        Ok(())
    }
}

impl LogicalDevice for RamDisk {
    fn packet_buffer(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    fn process(&mut self, link: &mut dyn Transport, command: &Command) -> Result<(), DeviceError> {
        match CommandCode::try_from(command.code) {
            Ok(CommandCode::ReadBlock) => {
                let n = self.block_number(command)?;
                self.read_block(link, command.unit, n)
            }
            Ok(CommandCode::WriteBlock) => {
                let n = self.block_number(command)?;
                self.write_block(link, command.unit, n)
            }
            Ok(CommandCode::Status) => self.status(link, command.unit),
            _ => {
                self.reply_error(link, command.unit)?;
                Err(DeviceError::Unsupported(command.code))
            }
        }
    }

    fn shutdown(&mut self) {
        debug!("[{}]: shutdown, {} blocks", self.name, self.blocks.len());
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartport_bus::LinkError;
    use smartport_common::packet::{encode_command_packet, verify_checksum};

    /// Hands out queued frames and keeps whatever is transmitted.
    #[derive(Default)]
    struct Loopback {
        incoming: Vec<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }
    impl Transport for Loopback {
        fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
            let frame = self.incoming.pop().ok_or(LinkError::Overrun)?;
            buf[..frame.len()].copy_from_slice(&frame);
            buf[frame.len()] = 0;
            Ok(frame.len())
        }
        fn transmit_frame(&mut self, buf: &[u8]) -> Result<(), LinkError> {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            self.sent.push(buf[..=end].to_vec());
            Ok(())
        }
    }

    fn disk() -> RamDisk {
        let blocks = (0..3u8).map(|k| [k; BLOCK_LEN]).collect();
        RamDisk::new("disk", blocks)
    }

    /// Puts a command for `unit` in the disk's buffer, the way the arbiter would.
    fn command(disk: &mut RamDisk, unit: u8, code: u8, block: u8) -> Command {
        let payload = [code, 0x03, 0x00, 0x20, block, 0x00, 0x00, 0x00, 0x00];
        let len = encode_command_packet(disk.packet_buffer(), unit, &payload).unwrap();
        Command {
            unit,
            code,
            begin: 6,
            len,
        }
    }

    #[test]
    fn test_read_block() {
        let mut disk = disk();
        let mut link = Loopback::default();
        let c = command(&mut disk, 0x82, 0x81, 2);
        disk.process(&mut link, &c).unwrap();

        let mut reply = link.sent.pop().unwrap();
        let decoded = decode_data_packet(&mut reply).unwrap();
        assert_eq!(decoded.header.src, 0x82);
        assert_eq!(decoded.header.packet_type, packet_type::DATA);
        assert!(reply[..BLOCK_LEN].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_write_block() {
        let mut disk = disk();
        let mut link = Loopback::default();
        let mut data = vec![0u8; PACKET_BUFFER_LEN];
        data[..BLOCK_LEN].fill(0x5a);
        let end = encode_data_packet(&mut data, 0x80).unwrap();
        data.truncate(end);
        link.incoming.push(data);

        let c = command(&mut disk, 0x82, 0x82, 1);
        disk.process(&mut link, &c).unwrap();
        let header = verify_checksum(&link.sent[0]).unwrap();
        assert_eq!(header.packet_type, packet_type::WRITE_STATUS);
        assert_eq!(header.stat, 0x80);
        assert!(disk.blocks[1].iter().all(|&b| b == 0x5a));
        assert!(disk.blocks[0].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_corrupted_data() {
        let mut disk = disk();
        let mut link = Loopback::default();
        let mut data = vec![0u8; PACKET_BUFFER_LEN];
        let end = encode_data_packet(&mut data, 0x80).unwrap();
        data.truncate(end);
        data[100] ^= 0x01;
        link.incoming.push(data);

        let c = command(&mut disk, 0x82, 0x82, 1);
        disk.process(&mut link, &c).unwrap();
        let header = verify_checksum(&link.sent[0]).unwrap();
        assert_eq!(header.stat, status::BUS_ERROR | 0x80);
        assert!(disk.blocks[1].iter().all(|&b| b == 1), "block left alone");
    }

    #[test]
    fn test_status() {
        let mut disk = disk();
        let mut link = Loopback::default();
        let c = command(&mut disk, 0x85, 0x80, 0);
        disk.process(&mut link, &c).unwrap();
        let mut payload = [0u8; 4];
        let header = decode_payload(&link.sent[0], &mut payload).unwrap();
        assert_eq!(header.stat, status::OK);
        assert_eq!(payload, [STATUS_BLOCK_DEVICE, 3, 0, 0]);
    }

    #[test]
    fn test_out_of_range_and_unsupported() {
        let mut disk = disk();
        let mut link = Loopback::default();
        let c = command(&mut disk, 0x82, 0x81, 9);
        disk.process(&mut link, &c).unwrap();
        let header = verify_checksum(&link.sent[0]).unwrap();
        assert_eq!(header.stat, status::ERROR_REPLY);

        let c = command(&mut disk, 0x82, 0x84, 0);
        assert_eq!(
            disk.process(&mut link, &c),
            Err(DeviceError::Unsupported(0x84))
        );
        assert_eq!(link.sent.len(), 2);
    }
}
