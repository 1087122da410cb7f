//! Byte streams on and off the wire.
//!
//! The host sends with a self-clocking encoding: a 1 bit is a level change on WRDATA at the
//! start of its 4 µs cell, a 0 bit is no change. Bytes are MSB first and every byte on the
//! wire has its top bit set, so each byte starts with a transition and framing needs no clock.
//!
//! The device answers with pulses on RDDATA: 1 µs high for a 1 bit, nothing for a 0 bit.
//!
//! REQ/ACK handshake, as seen from the device:
//! ```txt
//! receive:   REQ up -> data on WRDATA -> enable ACK (low) -> REQ down
//! transmit:  ACK high -> REQ up -> data on RDDATA -> ACK low -> REQ down
//! ```

use crate::config::BusConfig;
use crate::critical::InterruptGuard;
use crate::device::Transport;
use crate::hal::{BusPins, Counter, Line};
use crate::timer::DeadlineTimer;
use crate::timing;
use thiserror::Error;

/// The wait that expired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    /// Host did not raise REQ.
    Request,
    /// WRDATA did not settle low once REQ was up.
    WriteDataIdle,
    /// Host did not drop REQ at the end of the transfer.
    RequestRelease,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum LinkError {
    #[error("timed out waiting for {0:?}")]
    Timeout(Stage),
    #[error("frame does not fit in the packet buffer")]
    Overrun,
}

pub struct LinkLayer<P, C> {
    pins: P,
    timer: DeadlineTimer<C>,
    req_release_us: u32,
}

impl<P: BusPins, C: Counter> LinkLayer<P, C> {
    pub fn new(pins: P, counter: C, config: &BusConfig) -> Self {
        Self {
            pins,
            timer: DeadlineTimer::new(counter, config.timer),
            req_release_us: config.req_release_us,
        }
    }

    pub fn pins(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn timer(&mut self) -> &mut DeadlineTimer<C> {
        &mut self.timer
    }

    /// Puts the lines in their resting state: ACK prepared low then released, phase lines and
    /// WRDATA as inputs, RDDATA prepared low then released.
    pub fn setup(&mut self) {
        self.pins.set_output(Line::Acknowledge, true);
        self.pins.drive(Line::Acknowledge, false);
        self.pins.set_output(Line::Acknowledge, false);
        for line in Line::PHASES {
            self.pins.set_output(line, false);
        }
        self.pins.set_output(Line::Request, false);
        self.pins.set_output(Line::WriteData, false);
        self.pins.set_output(Line::ReadData, true);
        self.pins.drive(Line::ReadData, false);
        self.pins.set_output(Line::ReadData, false);
        self.timer.reset();
    }

    /// Releases ACK and prepares it to come up low, ahead of the next receive.
    pub fn release_ack(&mut self) {
        self.pins.set_output(Line::Acknowledge, false);
        self.pins.drive(Line::Acknowledge, false);
    }

    pub fn release_read_data(&mut self) {
        self.pins.set_output(Line::ReadData, false);
        self.pins.drive(Line::ReadData, false);
    }

    /// Resets the counter and burns the settle delay that starts every transfer.
    fn start_transfer(&mut self) {
        self.timer.reset();
        self.timer.latch();
        self.timer.alarm_set(timing::SETTLE);
        self.timer.wait();
        self.timer.alarm_extend(timing::SETTLE);
        self.timer.wait();
    }

    /// Spins until `line` reads `level`, or fails with `stage` after `us`.
    fn await_level(
        &mut self,
        line: Line,
        level: bool,
        us: u32,
        stage: Stage,
    ) -> Result<(), LinkError> {
        self.timer.latch();
        self.timer.alarm_set(us);
        while self.pins.level(line) != level {
            if self.timer.expired() {
                return Err(LinkError::Timeout(stage));
            }
        }
        Ok(())
    }

    /// Receives one frame into `buf`, followed by a zero terminator, and returns the number of
    /// bytes received. The phase must be enable; the caller masks interrupts.
    ///
    /// Nothing is written to `buf` unless the host raises REQ in time. On success ACK is
    /// enabled (low) and REQ has been released.
    pub fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        self.start_transfer();
        self.await_level(Line::Request, true, timing::REQ_TIMEOUT, Stage::Request)?;
        self.await_level(
            Line::WriteData,
            false,
            timing::WRDATA_IDLE_TIMEOUT,
            Stage::WriteDataIdle,
        )?;
        self.timer.alarm_set(timing::SETTLE);
        self.timer.wait();

        // WRDATA idles high before the frame, so its first fall is the first 1 bit
        let mut prev = true;
        let mut len = 0;
        loop {
            self.timer
                .alarm_set(if len > 0 { timing::RX_SAMPLE_OFFSET } else { 0 });
            let mut byte = 0u8;
            for _ in 0..8 {
                self.timer.wait();
                let level = self.pins.level(Line::WriteData);
                self.timer.alarm_set(timing::BIT_CELL);
                byte = (byte << 1) | (prev ^ level) as u8;
                prev = level;
            }
            if len + 1 >= buf.len() {
                return Err(LinkError::Overrun);
            }
            buf[len] = byte;
            len += 1;

            // the next byte's leading edge, or the end of the frame
            self.timer.alarm_extend(timing::RX_BYTE_SNOOZE);
            let more = loop {
                if self.timer.expired() {
                    break false;
                }
                if self.pins.level(Line::WriteData) != prev {
                    break true;
                }
            };
            if !more {
                break;
            }
        }
        buf[len] = 0;

        // ACK is already latched low
        self.pins.set_output(Line::Acknowledge, true);
        self.await_level(Line::Request, false, self.req_release_us, Stage::RequestRelease)?;
        Ok(len)
    }

    /// Transmits `buf` up to its zero terminator. ACK must have been enabled by the receive
    /// this answers. Interrupts are masked for the whole call.
    pub fn transmit_frame(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let _guard = InterruptGuard::acquire();
        let frame = buf.iter().position(|&b| b == 0).map_or(buf, |end| &buf[..end]);

        self.start_transfer();
        self.pins.drive(Line::ReadData, false);
        self.pins.set_output(Line::ReadData, true);
        self.pins.drive(Line::Acknowledge, true);

        let requested = self.await_level(Line::Request, true, timing::REQ_TIMEOUT, Stage::Request);
        if let Err(e) = requested {
            self.release_read_data();
            return Err(e);
        }
        self.timer.alarm_set(timing::TX_LEAD_IN);
        self.timer.wait();

        for &byte in frame {
            for bit in 0..8 {
                self.pins.drive(Line::ReadData, byte & (0x80 >> bit) != 0);
                self.timer.alarm_extend(timing::TX_PULSE);
                self.timer.wait();
                self.pins.drive(Line::ReadData, false);
                self.timer.alarm_set(timing::TX_GAP);
                self.timer.wait();
            }
        }

        self.pins.drive(Line::Acknowledge, false);
        let released =
            self.await_level(Line::Request, false, self.req_release_us, Stage::RequestRelease);
        self.release_read_data();
        released
    }
}

impl<P: BusPins, C: Counter> Transport for LinkLayer<P, C> {
    fn receive_frame(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let _guard = InterruptGuard::acquire();
        LinkLayer::receive_frame(self, buf)
    }

    fn transmit_frame(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        LinkLayer::transmit_frame(self, buf)
    }
}
