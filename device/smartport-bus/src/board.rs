//! BCM2835 backend: bus lines on GPIO, pacing from the 1MHz system timer.

use crate::arbiter::BusArbiter;
use crate::config::{BusConfig, TimerConfig};
use crate::hal::{BusPins, Counter, Line};
use bcm2835_lpa::{GPIO, SYSTMR};

/// Data synchronization barrier, needed whenever we switch from one peripheral to another.
#[inline(always)]
pub fn dsb() {
    #[cfg(target_arch = "arm")]
    unsafe {
        // DSB is marked as SBZ, Should Be Zero.
        // See: arm1176.pdf 3-70, 3-71
        core::arch::asm!("mcr p15,0,{tmp},c7,c10,4", tmp = in(reg) 0);
    }
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// GPIO pin of every bus line. Lines may share a pin: on the connector REQ is PH0.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PinMap {
    pub phases: [u8; 4],
    pub request: u8,
    pub acknowledge: u8,
    pub write_data: u8,
    pub read_data: u8,
}
impl PinMap {
    pub const fn pin(&self, line: Line) -> u8 {
        match line {
            Line::Phase0 => self.phases[0],
            Line::Phase1 => self.phases[1],
            Line::Phase2 => self.phases[2],
            Line::Phase3 => self.phases[3],
            Line::Request => self.request,
            Line::Acknowledge => self.acknowledge,
            Line::WriteData => self.write_data,
            Line::ReadData => self.read_data,
        }
    }
}
impl Default for PinMap {
    fn default() -> Self {
        Self {
            phases: [17, 27, 22, 23],
            request: 17,
            acknowledge: 24,
            write_data: 25,
            read_data: 5,
        }
    }
}

const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

/// GPFSELn contents with `pin`'s 3-bit function field replaced.
const fn with_function(bits: u32, pin: u8, function: u32) -> u32 {
    let shift = (pin % 10) as u32 * 3;
    (bits & !(0b111 << shift)) | (function << shift)
}

pub struct Bcm2835Pins<'a> {
    gpio: &'a GPIO,
    map: PinMap,
}
impl<'a> Bcm2835Pins<'a> {
    pub fn new(gpio: &'a GPIO, map: PinMap) -> Self {
        Self { gpio, map }
    }

    fn select(&mut self, pin: u8, function: u32) {
        let f = |bits: u32| with_function(bits, pin, function);
        dsb();
        unsafe {
            match pin / 10 {
                0 => self.gpio.gpfsel0().modify(|r, w| w.bits(f(r.bits()))),
                1 => self.gpio.gpfsel1().modify(|r, w| w.bits(f(r.bits()))),
                2 => self.gpio.gpfsel2().modify(|r, w| w.bits(f(r.bits()))),
                3 => self.gpio.gpfsel3().modify(|r, w| w.bits(f(r.bits()))),
                4 => self.gpio.gpfsel4().modify(|r, w| w.bits(f(r.bits()))),
                _ => self.gpio.gpfsel5().modify(|r, w| w.bits(f(r.bits()))),
            };
        }
        dsb();
    }
}

// No barriers on the line accesses themselves: they sit in the tightest loops, and every switch
// back to the timer goes through the barriers in SystemTimer::read.
impl BusPins for Bcm2835Pins<'_> {
    fn level(&mut self, line: Line) -> bool {
        let pin = self.map.pin(line);
        let bits = if pin < 32 {
            self.gpio.gplev0().read().bits()
        } else {
            self.gpio.gplev1().read().bits()
        };
        bits & (1 << (pin % 32)) != 0
    }

    fn drive(&mut self, line: Line, high: bool) {
        let pin = self.map.pin(line);
        let mask = 1u32 << (pin % 32);
        unsafe {
            match (pin < 32, high) {
                (true, true) => self.gpio.gpset0().write_with_zero(|w| w.bits(mask)),
                (true, false) => self.gpio.gpclr0().write_with_zero(|w| w.bits(mask)),
                (false, true) => self.gpio.gpset1().write_with_zero(|w| w.bits(mask)),
                (false, false) => self.gpio.gpclr1().write_with_zero(|w| w.bits(mask)),
            };
        }
    }

    fn set_output(&mut self, line: Line, enabled: bool) {
        let pin = self.map.pin(line);
        self.select(pin, if enabled { FSEL_OUTPUT } else { FSEL_INPUT });
    }
}

/// The system timer's CHI:CLO pair, counted from the last reset.
pub struct SystemTimer<'a> {
    st: &'a SYSTMR,
    origin: u64,
}
impl<'a> SystemTimer<'a> {
    pub fn new(st: &'a SYSTMR) -> Self {
        let mut timer = Self { st, origin: 0 };
        timer.origin = timer.floating_time();
        timer
    }

    fn floating_time(&self) -> u64 {
        dsb();
        let t = loop {
            let hi = self.st.chi().read().bits();
            let lo = self.st.clo().read().bits();
            // CLO rolled over between the two reads
            if self.st.chi().read().bits() == hi {
                break ((hi as u64) << 32) | lo as u64;
            }
        };
        dsb();
        t
    }
}
impl Counter for SystemTimer<'_> {
    fn read(&mut self) -> u64 {
        self.floating_time().wrapping_sub(self.origin)
    }

    fn reset(&mut self) {
        self.origin = self.floating_time();
    }
}

/// An arbiter on the BCM2835's own GPIO and system timer.
pub fn arbiter<'a>(
    gpio: &'a GPIO,
    st: &'a SYSTMR,
    map: PinMap,
) -> BusArbiter<Bcm2835Pins<'a>, SystemTimer<'a>> {
    let config = BusConfig {
        timer: TimerConfig::BCM2835,
        ..BusConfig::default()
    };
    BusArbiter::new(Bcm2835Pins::new(gpio, map), SystemTimer::new(st), config)
}
