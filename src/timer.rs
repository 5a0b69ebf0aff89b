//! Time sources — injectable millisecond clocks and tick budgeting
//!
//! The scheduler never reads a global clock. Every time query goes through
//! a [`Clock`] handed over at construction, so tests and simulations can
//! drive time deterministically.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::cell::Cell;

/// Millisecond time source
///
/// Readings must be monotonically non-decreasing. Wrap a coarse clock in
/// [`StrictClock`] when consecutive readings must differ.
pub trait Clock {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for alloc::rc::Rc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Software clock, advanced by hand
///
/// Interior-mutable so one instance can be shared (via `Rc`) between a
/// test and the scheduler reading it.
#[derive(Debug, Default)]
pub struct SoftwareClock {
    /// Current time (milliseconds)
    now_ms: Cell<u64>,
}

impl SoftwareClock {
    /// Clock starting at t = 0
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Clock starting at an arbitrary timestamp
    pub const fn starting_at(ms: u64) -> Self {
        Self { now_ms: Cell::new(ms) }
    }

    /// Advance time by `ms` milliseconds (saturating)
    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get().saturating_add(ms));
    }

    /// Jump to an absolute time; going backwards is ignored
    pub fn set(&self, ms: u64) {
        if ms > self.now_ms.get() {
            self.now_ms.set(ms);
        }
    }

    /// Reset to t = 0
    pub fn reset(&self) {
        self.now_ms.set(0);
    }
}

impl Clock for SoftwareClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

/// Replays a scripted sequence of readings, one per call
///
/// Once the script runs out the last value is repeated.
#[derive(Debug)]
pub struct ScriptedClock {
    readings: Vec<u64>,
    cursor: Cell<usize>,
}

impl ScriptedClock {
    /// Clock replaying `readings` in order
    pub fn new(readings: impl IntoIterator<Item = u64>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            cursor: Cell::new(0),
        }
    }

    /// Readings not yet handed out
    pub fn remaining(&self) -> usize {
        self.readings.len().saturating_sub(self.cursor.get())
    }
}

impl Clock for ScriptedClock {
    fn now_ms(&self) -> u64 {
        let idx = self.cursor.get();
        match self.readings.get(idx) {
            Some(&ms) => {
                self.cursor.set(idx + 1);
                ms
            }
            None => self.readings.last().copied().unwrap_or(0),
        }
    }
}

/// Strictly increasing wrapper around another clock
///
/// Each reading is at least 1 ms after the previous one, so two samples
/// from consecutive ticks never compare equal even on a coarse clock
/// (velocity estimates divide by the difference).
#[derive(Debug)]
pub struct StrictClock<C> {
    inner: C,
    last: Cell<Option<u64>>,
}

impl<C: Clock> StrictClock<C> {
    /// Wrap `inner`; the first reading passes through unchanged
    pub const fn new(inner: C) -> Self {
        Self {
            inner,
            last: Cell::new(None),
        }
    }

    /// Wrapped clock
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Clock> Clock for StrictClock<C> {
    fn now_ms(&self) -> u64 {
        let raw = self.inner.now_ms();
        let now = match self.last.get() {
            Some(last) if raw <= last => last.saturating_add(1),
            _ => raw,
        };
        self.last.set(Some(now));
        now
    }
}

/// Wall clock: milliseconds since construction
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    /// Clock reading 0 now
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let ms = self.origin.elapsed().as_millis();
        ms.min(u128::from(u64::MAX)) as u64
    }
}

/// Time budget of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBudget {
    /// Tick start (absolute, ms)
    start: u64,
    /// Configured interval (ms)
    interval_ms: u32,
}

impl TickBudget {
    /// Budget of `interval_ms` for a tick started at `start`
    pub const fn new(start: u64, interval_ms: u32) -> Self {
        Self { start, interval_ms }
    }

    /// Tick start timestamp
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Elapsed since the tick started
    pub fn elapsed(&self, current: u64) -> u64 {
        current.saturating_sub(self.start)
    }

    /// Remaining budget (0 once overrun, never negative)
    pub fn remaining(&self, current: u64) -> u32 {
        let elapsed = self.elapsed(current);
        u64::from(self.interval_ms).saturating_sub(elapsed) as u32
    }

    /// Has the tick used more than its interval?
    pub fn is_overrun(&self, current: u64) -> bool {
        self.elapsed(current) > u64::from(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_clock() {
        let clock = SoftwareClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.set(500);
        assert_eq!(clock.now_ms(), 1000);
        clock.reset();
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_scripted_clock_holds_last() {
        let clock = ScriptedClock::new([5, 9, 14]);
        assert_eq!(clock.remaining(), 3);
        assert_eq!(clock.now_ms(), 5);
        assert_eq!(clock.now_ms(), 9);
        assert_eq!(clock.now_ms(), 14);
        assert_eq!(clock.now_ms(), 14);
        assert_eq!(clock.remaining(), 0);
    }

    #[test]
    fn test_strict_clock_always_increases() {
        let clock = StrictClock::new(ScriptedClock::new([10, 10, 10, 8, 20]));
        let samples: Vec<u64> = (0..5).map(|_| clock.now_ms()).collect();
        assert_eq!(samples, [10, 11, 12, 13, 20]);
    }

    #[test]
    fn test_budget_remaining() {
        let budget = TickBudget::new(100, 20);
        assert_eq!(budget.remaining(100), 20);
        assert_eq!(budget.remaining(115), 5);
        assert_eq!(budget.remaining(120), 0);
        assert!(!budget.is_overrun(120));
    }

    #[test]
    fn test_budget_never_negative() {
        let budget = TickBudget::new(100, 20);
        assert_eq!(budget.remaining(500), 0);
        assert!(budget.is_overrun(121));
        // clock before tick start (misbehaving source) counts as no time used
        assert_eq!(budget.remaining(50), 20);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_system_clock_monotonic() {
        let clock = StrictClock::new(SystemClock::new());
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b > a);
    }
}
