//! A bus in software: a virtual clock, the eight lines, and a scripted host on the other end.
//!
//! Time only moves when the device looks at the bus. Every counter read and every line read
//! advances the clock by one tick; driving a line takes no time. With ten ticks per
//! microsecond and no calibration, the engine's alarms land exactly on tick boundaries, so
//! captured waveforms can be checked to the tick.

use crate::config::{BusConfig, TimerConfig};
use crate::hal::{BusPins, Counter, Line};
use crate::phase::Phase;
use crate::timing;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use log::trace;

/// One transfer, from the host's point of view.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HostStep {
    /// Raise REQ `delay` ticks after the previous step, clock out `bytes` on WRDATA, and drop
    /// REQ once the device enables ACK.
    Send { bytes: Vec<u8>, delay: u64 },
    /// Raise REQ `delay` ticks after the device drives ACK high, record RDDATA, and drop REQ
    /// `delay` ticks after ACK falls.
    Receive { delay: u64 },
}
impl HostStep {
    pub fn send(bytes: &[u8], delay: u64) -> Self {
        Self::Send {
            bytes: bytes.to_vec(),
            delay,
        }
    }
    pub fn receive(delay: u64) -> Self {
        Self::Receive { delay }
    }
}

enum Activity {
    Idle,
    Sending {
        req_at: u64,
        /// WRDATA level changes, in time order. WRDATA is high before the first.
        edges: Vec<(u64, bool)>,
        acked_at: Option<u64>,
    },
    Receiving {
        delay: u64,
        ack_high_at: Option<u64>,
        ack_low_at: Option<u64>,
        pulses: Vec<u64>,
    },
}

struct State {
    clock: u64,
    counter_base: u64,
    phases: Vec<(u64, [bool; 4])>,
    script: VecDeque<HostStep>,
    activity: Activity,
    step_origin: u64,
    ack_output: bool,
    ack_latch: bool,
    read_data_output: bool,
    read_data_latch: bool,
    read_data_edges: Vec<(u64, bool)>,
    captures: Vec<Vec<u64>>,
}

impl State {
    fn tick(&mut self) {
        self.clock += 1;
        self.advance();
    }

    /// Retires finished steps and starts the next one.
    fn advance(&mut self) {
        loop {
            match &mut self.activity {
                Activity::Idle => {
                    let Some(step) = self.script.pop_front() else {
                        return;
                    };
                    self.activity = match step {
                        HostStep::Send { bytes, delay } => {
                            let req_at = self.step_origin + delay;
                            trace!("[sim]: host sends {} bytes at {req_at}", bytes.len());
                            Activity::Sending {
                                req_at,
                                edges: waveform(&bytes, req_at + SimBus::DATA_LEAD_TICKS),
                                acked_at: None,
                            }
                        }
                        HostStep::Receive { delay } => Activity::Receiving {
                            delay,
                            ack_high_at: None,
                            ack_low_at: None,
                            pulses: Vec::new(),
                        },
                    };
                }
                Activity::Sending {
                    acked_at: Some(acked_at),
                    ..
                } => {
                    let done = *acked_at + SimBus::RELEASE_TICKS;
                    if self.clock < done {
                        return;
                    }
                    self.step_origin = done;
                    self.activity = Activity::Idle;
                }
                Activity::Receiving {
                    delay,
                    ack_low_at: Some(ack_low_at),
                    pulses,
                    ..
                } => {
                    let done = *ack_low_at + *delay;
                    if self.clock < done {
                        return;
                    }
                    trace!("[sim]: host received {} pulses", pulses.len());
                    self.captures.push(core::mem::take(pulses));
                    self.step_origin = done;
                    self.activity = Activity::Idle;
                }
                _ => return,
            }
        }
    }

    fn level(&self, line: Line) -> bool {
        let t = self.clock;
        match line {
            Line::Phase0 => self.phase_levels(t)[0],
            Line::Phase1 => self.phase_levels(t)[1],
            Line::Phase2 => self.phase_levels(t)[2],
            Line::Phase3 => self.phase_levels(t)[3],
            Line::Request => match &self.activity {
                Activity::Idle => false,
                Activity::Sending {
                    req_at, acked_at, ..
                } => t >= *req_at && acked_at.map_or(true, |a| t < a + SimBus::RELEASE_TICKS),
                Activity::Receiving {
                    delay,
                    ack_high_at,
                    ack_low_at,
                    ..
                } => {
                    ack_high_at.is_some_and(|h| t >= h + delay)
                        && ack_low_at.map_or(true, |l| t < l + delay)
                }
            },
            Line::WriteData => match &self.activity {
                Activity::Sending { edges, .. } => {
                    let i = edges.partition_point(|e| e.0 <= t);
                    i == 0 || edges[i - 1].1
                }
                _ => true,
            },
            Line::Acknowledge => self.ack_output && self.ack_latch,
            Line::ReadData => self.read_data_output && self.read_data_latch,
        }
    }

    fn phase_levels(&self, t: u64) -> [bool; 4] {
        let i = self.phases.partition_point(|p| p.0 <= t);
        if i == 0 {
            [false; 4]
        } else {
            self.phases[i - 1].1
        }
    }

    fn ack_changed(&mut self) {
        let t = self.clock;
        let (output, latch) = (self.ack_output, self.ack_latch);
        match &mut self.activity {
            Activity::Sending {
                req_at, acked_at, ..
            } => {
                if acked_at.is_none() && output && !latch && t >= *req_at {
                    *acked_at = Some(t);
                }
            }
            Activity::Receiving {
                ack_high_at,
                ack_low_at,
                ..
            } => {
                let high = output && latch;
                if ack_high_at.is_none() && high {
                    *ack_high_at = Some(t);
                } else if ack_high_at.is_some() && ack_low_at.is_none() && !high {
                    *ack_low_at = Some(t);
                }
            }
            Activity::Idle => {}
        }
    }
}

/// WRDATA level changes for `bytes` sent back to back from `start`, starting from high.
fn waveform(bytes: &[u8], start: u64) -> Vec<(u64, bool)> {
    let mut level = true;
    let mut edges = Vec::new();
    for (i, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                level = !level;
                let cell = (i * 8 + bit) as u64;
                edges.push((start + cell * SimBus::CELL_TICKS, level));
            }
        }
    }
    edges
}

/// Reassembles bytes from the rising edges of a RDDATA capture. The first edge is the first
/// bit of the first byte; trailing zero bits are implied.
pub fn decode_pulses(rising: &[u64], cell_ticks: u64) -> Vec<u8> {
    let Some(&first) = rising.first() else {
        return Vec::new();
    };
    let slots: Vec<usize> = rising
        .iter()
        .map(|t| ((t - first) / cell_ticks) as usize)
        .collect();
    let bits = slots.last().map_or(0, |s| s + 1);
    let mut bytes = alloc::vec![0u8; bits.div_ceil(8)];
    for slot in slots {
        bytes[slot / 8] |= 0x80 >> (slot % 8);
    }
    bytes
}

/// Handle on a simulated bus, for scripting the host and inspecting the lines.
#[derive(Clone)]
pub struct SimBus(Rc<RefCell<State>>);

impl SimBus {
    pub const TICKS_PER_US: u32 = 10;
    pub const CELL_TICKS: u64 = (timing::BIT_CELL * Self::TICKS_PER_US) as u64;
    pub const PULSE_TICKS: u64 = (timing::TX_PULSE * Self::TICKS_PER_US) as u64;
    /// Time from REQ to the first WRDATA transition of a sent frame.
    pub const DATA_LEAD_TICKS: u64 = 50;
    /// Time from ACK enabled to REQ dropped, at the end of a sent frame.
    pub const RELEASE_TICKS: u64 = 30;

    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(State {
            clock: 0,
            counter_base: 0,
            phases: Vec::new(),
            script: VecDeque::new(),
            activity: Activity::Idle,
            step_origin: 0,
            ack_output: false,
            ack_latch: false,
            read_data_output: false,
            read_data_latch: false,
            read_data_edges: Vec::new(),
            captures: Vec::new(),
        })))
    }

    /// Engine configuration matching the simulated clock.
    pub fn config() -> BusConfig {
        BusConfig {
            timer: TimerConfig {
                ticks_per_us: Self::TICKS_PER_US,
                calibration_ticks: 0,
            },
            ..BusConfig::default()
        }
    }

    pub fn pins(&self) -> SimPins {
        SimPins(self.0.clone())
    }

    pub fn counter(&self) -> SimCounter {
        SimCounter(self.0.clone())
    }

    /// Queues host transfers. Timing of the first is relative to the end of the last step
    /// already run, or to the start of the simulation.
    pub fn script(&self, steps: impl IntoIterator<Item = HostStep>) {
        let mut state = self.0.borrow_mut();
        state.script.extend(steps);
        state.advance();
    }

    /// Whether every scripted step has run to completion.
    pub fn script_done(&self) -> bool {
        let state = self.0.borrow();
        state.script.is_empty() && matches!(state.activity, Activity::Idle)
    }

    /// Sets the phase lines from now on.
    pub fn set_phase(&self, phase: Phase) {
        let now = self.now();
        self.schedule_phase(now, phase);
    }

    /// Sets the phase lines from tick `at` on.
    pub fn schedule_phase(&self, at: u64, phase: Phase) {
        let levels = match phase {
            Phase::Idle => [false; 4],
            Phase::Reset => [true, false, true, false],
            Phase::Enable => [false, true, false, true],
        };
        let mut state = self.0.borrow_mut();
        let i = state.phases.partition_point(|p| p.0 <= at);
        state.phases.insert(i, (at, levels));
    }

    pub fn now(&self) -> u64 {
        self.0.borrow().clock
    }

    /// Level of `line` right now, without letting time pass.
    pub fn level(&self, line: Line) -> bool {
        let mut state = self.0.borrow_mut();
        state.advance();
        state.level(line)
    }

    pub fn ack_enabled(&self) -> bool {
        self.0.borrow().ack_output
    }

    pub fn read_data_enabled(&self) -> bool {
        self.0.borrow().read_data_output
    }

    /// Every RDDATA latch write, as (tick, level).
    pub fn read_data_edges(&self) -> Vec<(u64, bool)> {
        self.0.borrow().read_data_edges.clone()
    }

    /// RDDATA rising edges seen by each completed receive step.
    pub fn captures(&self) -> Vec<Vec<u64>> {
        self.0.borrow().captures.clone()
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimPins(Rc<RefCell<State>>);

impl BusPins for SimPins {
    fn level(&mut self, line: Line) -> bool {
        let mut state = self.0.borrow_mut();
        state.tick();
        state.level(line)
    }

    fn drive(&mut self, line: Line, high: bool) {
        let mut state = self.0.borrow_mut();
        state.advance();
        match line {
            Line::Acknowledge => {
                state.ack_latch = high;
                state.ack_changed();
            }
            Line::ReadData => {
                state.read_data_latch = high;
                let t = state.clock;
                state.read_data_edges.push((t, high));
                let output = state.read_data_output;
                if let Activity::Receiving { pulses, .. } = &mut state.activity {
                    if high && output {
                        pulses.push(t);
                    }
                }
            }
            _ => {}
        }
    }

    fn set_output(&mut self, line: Line, enabled: bool) {
        let mut state = self.0.borrow_mut();
        state.advance();
        match line {
            Line::Acknowledge => {
                state.ack_output = enabled;
                state.ack_changed();
            }
            Line::ReadData => state.read_data_output = enabled,
            _ => {}
        }
    }
}

pub struct SimCounter(Rc<RefCell<State>>);

impl Counter for SimCounter {
    fn read(&mut self) -> u64 {
        let mut state = self.0.borrow_mut();
        state.tick();
        state.clock - state.counter_base
    }

    fn reset(&mut self) {
        let mut state = self.0.borrow_mut();
        state.counter_base = state.clock;
    }
}
