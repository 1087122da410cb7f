use crate::config::TimerConfig;
use crate::hal::Counter;

/// Microsecond alarm over a free-running counter.
///
/// `now` only changes on [`latch`](Self::latch), so an alarm set right after a wait is based
/// exactly on the instant the wait ended. Chaining `wait`/`alarm_set` therefore accumulates
/// only the polling granularity, and chaining `wait`/`alarm_extend` accumulates nothing.
pub struct DeadlineTimer<C> {
    counter: C,
    config: TimerConfig,
    now: u64,
    target: u64,
}

impl<C: Counter> DeadlineTimer<C> {
    pub fn new(counter: C, config: TimerConfig) -> Self {
        Self {
            counter,
            config,
            now: 0,
            target: 0,
        }
    }

    pub fn config(&self) -> TimerConfig {
        self.config
    }

    pub fn reset(&mut self) {
        self.counter.reset();
        self.now = 0;
        self.target = 0;
    }

    /// Captures the counter.
    pub fn latch(&mut self) -> u64 {
        self.now = self.counter.read();
        self.now
    }

    /// Value captured by the last [`latch`](Self::latch).
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Arms the alarm `us` after the last latch.
    pub fn alarm_set(&mut self, us: u32) {
        self.target = self.now + self.config.ticks(us);
    }

    /// Pushes the alarm `us` further out, without re-basing on the last latch.
    pub fn alarm_extend(&mut self, us: u32) {
        self.target += self.config.ticks(us);
    }

    /// Latches and reports whether the alarm has been reached.
    pub fn expired(&mut self) -> bool {
        self.latch() >= self.target
    }

    /// Spins until the alarm has been reached.
    pub fn wait(&mut self) {
        while !self.expired() {}
    }

    /// Latches, arms the alarm `us` out, and spins until it is reached.
    pub fn delay(&mut self, us: u32) {
        self.latch();
        self.alarm_set(us);
        self.wait();
    }
}
