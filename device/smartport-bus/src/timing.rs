//! Bus timing, in whole microseconds. Windows are absolute; the bus runs at about 250 kbit/s
//! regardless of how fast the counter ticks.

/// Width of one bit cell.
pub const BIT_CELL: u32 = 4;
/// Width of the RDDATA pulse that carries a 1 bit.
pub const TX_PULSE: u32 = 1;
/// Remainder of the cell after the pulse.
pub const TX_GAP: u32 = BIT_CELL - TX_PULSE;
/// Delay between seeing REQ and the first transmitted pulse.
pub const TX_LEAD_IN: u32 = 1;

/// Settling delay used at the start of every transfer, and before sampling the first byte.
pub const SETTLE: u32 = 1;
/// Delay from a byte's leading edge to its first sample.
pub const RX_SAMPLE_OFFSET: u32 = 2;
/// Time past the last cell of a byte to wait for the next leading edge; expiry ends the frame.
pub const RX_BYTE_SNOOZE: u32 = 19;

/// How long to wait for the host to raise REQ. Hosts have been measured at around 40.
pub const REQ_TIMEOUT: u32 = 100;
/// How long to wait for WRDATA to settle low once REQ is up: one byte.
pub const WRDATA_IDLE_TIMEOUT: u32 = 32;
/// How long to wait for the host to drop REQ after ACK changes at the end of a transfer.
pub const REQ_RELEASE_TIMEOUT: u32 = 1000;
