use crate::timing;

/// Conversion from microseconds to counter ticks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimerConfig {
    pub ticks_per_us: u32,
    /// Subtracted from every alarm to account for the polling overhead. Found empirically.
    pub calibration_ticks: u32,
}
impl TimerConfig {
    /// BCM2835 system timer: 1 MHz, and the overhead is well below a tick.
    pub const BCM2835: Self = Self {
        ticks_per_us: 1,
        calibration_ticks: 0,
    };

    pub const fn ticks(&self, us: u32) -> u64 {
        (us as u64 * self.ticks_per_us as u64).saturating_sub(self.calibration_ticks as u64)
    }
}
impl Default for TimerConfig {
    /// 80 MHz APB clock through a divider of 2.
    fn default() -> Self {
        Self {
            ticks_per_us: 40,
            calibration_ticks: 5,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BusConfig {
    pub timer: TimerConfig,
    /// Check the checksum of every command packet before acting on it.
    pub verify_commands: bool,
    /// Budget for the host to drop REQ at the end of a transfer.
    pub req_release_us: u32,
    /// Number the whole chain with successive INITs, front to back, instead of the device at
    /// the head claiming every INIT as the single, last device.
    pub number_chain: bool,
}
impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            verify_commands: true,
            req_release_us: timing::REQ_RELEASE_TIMEOUT,
            number_chain: false,
        }
    }
}
