/// SmartPort command codes, as they appear on the wire (bit 7 set).
///
/// Extended commands carry 32-bit block numbers and addresses; their codes are the standard
/// codes with bit 6 set as well.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum CommandCode {
    Status = 0x80,
    ReadBlock = 0x81,
    WriteBlock = 0x82,
    Format = 0x83,
    Control = 0x84,
    /// Bus initialisation; handled by the bus itself rather than by a device.
    Init = 0x85,
    Open = 0x86,
    Close = 0x87,
    Read = 0x88,
    Write = 0x89,
    ExtendedStatus = 0xc0,
    ExtendedReadBlock = 0xc1,
    ExtendedWriteBlock = 0xc2,
    ExtendedFormat = 0xc3,
    ExtendedControl = 0xc4,
    ExtendedInit = 0xc5,
    ExtendedOpen = 0xc6,
    ExtendedClose = 0xc7,
    ExtendedRead = 0xc8,
    ExtendedWrite = 0xc9,
}
impl CommandCode {
    pub const fn is_extended(self) -> bool {
        (self as u8) & 0x40 != 0
    }
}
impl TryFrom<u8> for CommandCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x80 => Self::Status,
            0x81 => Self::ReadBlock,
            0x82 => Self::WriteBlock,
            0x83 => Self::Format,
            0x84 => Self::Control,
            0x85 => Self::Init,
            0x86 => Self::Open,
            0x87 => Self::Close,
            0x88 => Self::Read,
            0x89 => Self::Write,
            0xc0 => Self::ExtendedStatus,
            0xc1 => Self::ExtendedReadBlock,
            0xc2 => Self::ExtendedWriteBlock,
            0xc3 => Self::ExtendedFormat,
            0xc4 => Self::ExtendedControl,
            0xc5 => Self::ExtendedInit,
            0xc6 => Self::ExtendedOpen,
            0xc7 => Self::ExtendedClose,
            0xc8 => Self::ExtendedRead,
            0xc9 => Self::ExtendedWrite,
            other => return Err(other),
        })
    }
}
