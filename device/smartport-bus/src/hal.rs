//! What the engine needs from the board: eight bus lines and a free-running counter.

/// Bus lines, named from the device's side.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Line {
    Phase0,
    Phase1,
    Phase2,
    Phase3,
    /// REQ, driven by the host.
    Request,
    /// ACK, driven by the device while enabled, high impedance otherwise.
    Acknowledge,
    /// WRDATA, host to device.
    WriteData,
    /// RDDATA, device to host; only driven during a transmit.
    ReadData,
}
impl Line {
    pub const PHASES: [Line; 4] = [Line::Phase0, Line::Phase1, Line::Phase2, Line::Phase3];
}

pub trait BusPins {
    /// Current level of `line`; `true` is high.
    fn level(&mut self, line: Line) -> bool;
    /// Sets the output latch of `line`. Takes effect on the bus once the driver is enabled.
    fn drive(&mut self, line: Line, high: bool);
    /// Enables or releases the output driver of `line`.
    fn set_output(&mut self, line: Line, enabled: bool);
}

/// Free-running tick counter. Must not wrap within any single wait.
pub trait Counter {
    fn read(&mut self) -> u64;
    /// Restarts counting from zero.
    fn reset(&mut self);
}
