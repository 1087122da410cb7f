//! The seam between the bus engine and the devices it carries.

use crate::link::LinkError;
use smartport_common::packet::PacketError;
use thiserror::Error;

/// Frame-level access to the bus, as handed to a device while it handles a command.
pub trait Transport {
    /// Receives the next frame into `buf`, e.g. the data packet of a write command.
    fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    /// Transmits `buf` up to its zero terminator.
    fn transmit_frame(&mut self, buf: &[u8]) -> Result<(), LinkError>;
}

/// A command packet, as routed by the arbiter. The packet itself is in the device's buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Command {
    /// Unit identity the packet was addressed to.
    pub unit: u8,
    /// Raw command code; see [`smartport_common::CommandCode`].
    pub code: u8,
    /// Offset of PBEGIN in the buffer.
    pub begin: usize,
    /// Bytes received, not counting the terminator.
    pub len: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum DeviceError {
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("packet: {0}")]
    Packet(#[from] PacketError),
    #[error("unsupported command {0:02x}")]
    Unsupported(u8),
}

/// A logical device on the daisy chain.
pub trait LogicalDevice {
    /// The device's packet buffer. Received command packets land here, replies are encoded
    /// here. Must hold at least [`smartport_common::PACKET_BUFFER_LEN`] bytes.
    fn packet_buffer(&mut self) -> &mut [u8];

    /// Handles a command packet addressed to this device. ACK is enabled and low on entry;
    /// any reply goes out through `link`.
    fn process(&mut self, link: &mut dyn Transport, command: &Command) -> Result<(), DeviceError>;

    /// Called before the system goes down.
    fn shutdown(&mut self) {}

    /// Short name for log output.
    fn name(&self) -> &str {
        "device"
    }
}
