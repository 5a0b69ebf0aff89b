//! Driver — the fixed-period control loop around a scheduler
//!
//! One driver tick is `do_work()` followed by a sleep for whatever is
//! left of the tick budget. The sleep goes through a [`Sleeper`], so the
//! same loop runs on a thread, on bare metal, or in simulated time.
//!
//! Author: Moroya Sakamoto

use alloc::rc::Rc;
use core::cell::Cell;

use crate::scheduler::Scheduler;
use crate::task::{Task, TaskState};
use crate::timer::SoftwareClock;

/// Blocks the driving loop between ticks
pub trait Sleeper {
    /// Block for `ms` milliseconds
    fn sleep_ms(&mut self, ms: u32);
}

/// Sleeps the current thread
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

#[cfg(feature = "std")]
impl Sleeper for ThreadSleeper {
    fn sleep_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

/// Simulated sleep: advances a software clock instead of waiting
#[derive(Debug, Clone)]
pub struct ClockSleeper {
    clock: Rc<SoftwareClock>,
}

impl ClockSleeper {
    /// Sleeper advancing `clock`
    pub fn new(clock: Rc<SoftwareClock>) -> Self {
        Self { clock }
    }
}

impl Sleeper for ClockSleeper {
    fn sleep_ms(&mut self, ms: u32) {
        self.clock.advance(u64::from(ms));
    }
}

/// Stops a running driver from anywhere (task bodies included)
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Rc<Cell<bool>>,
}

impl StopHandle {
    /// Stop the loop after the current tick
    pub fn stop(&self) {
        self.running.set(false);
    }
}

/// Loop execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Ticks run by this driver
    pub ticks: u64,
    /// Total time handed to the sleeper (ms)
    pub slept_ms: u64,
    /// Tick overruns seen by the scheduler
    pub overruns: u64,
    /// Sensor and action tasks still registered
    pub coroutines_left: usize,
}

/// Fixed-period loop driving a [`Scheduler`]
pub struct Driver<S> {
    scheduler: Scheduler,
    sleeper: S,
    running: Rc<Cell<bool>>,
    ticks: u64,
    slept_ms: u64,
}

impl<S: Sleeper> Driver<S> {
    /// Idle driver around `scheduler`
    pub fn new(scheduler: Scheduler, sleeper: S) -> Self {
        Self {
            scheduler,
            sleeper,
            running: Rc::new(Cell::new(false)),
            ticks: 0,
            slept_ms: 0,
        }
    }

    /// Driven scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Handle that stops this driver from inside a task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Stop the loop after the current tick
    pub fn stop(&mut self) {
        self.running.set(false);
    }

    /// Is a run loop in progress?
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Run one tick and sleep out the rest of its budget
    ///
    /// Returns the time slept.
    pub fn tick(&mut self) -> u32 {
        self.scheduler.do_work();
        self.ticks += 1;
        let wait = self.scheduler.time_millis_to_next_call();
        if wait > 0 {
            self.sleeper.sleep_ms(wait);
            self.slept_ms += u64::from(wait);
        }
        wait
    }

    /// Run `ticks` ticks (fewer if stopped)
    pub fn run_for(&mut self, ticks: u64) -> DriverStats {
        let mut left = ticks;
        self.run_until(|_| {
            if left == 0 {
                return true;
            }
            left -= 1;
            false
        })
    }

    /// Tick until `done` holds (checked before every tick) or the loop is stopped
    pub fn run_until(&mut self, mut done: impl FnMut(&Scheduler) -> bool) -> DriverStats {
        self.running.set(true);
        while self.running.get() && !done(&self.scheduler) {
            self.tick();
        }
        self.running.set(false);
        self.stats()
    }

    /// Tick until no sensor or action task is left, at most `max_ticks` times
    pub fn run_until_idle(&mut self, max_ticks: u64) -> DriverStats {
        let mut left = max_ticks;
        self.run_until(|sched| {
            if sched.num_coroutines() == 0 || left == 0 {
                return true;
            }
            left -= 1;
            false
        })
    }

    /// Drive `task` to its end, ticking between its advances
    ///
    /// The task is advanced directly, not registered. Returns its state
    /// when it finishes or when the loop is stopped.
    pub fn block_on(&mut self, task: &Task) -> TaskState {
        self.running.set(true);
        let mut state = self.scheduler.drive(task);
        while !state.is_finished() && self.running.get() {
            self.tick();
            state = self.scheduler.drive(task);
        }
        self.running.set(false);
        state
    }

    /// Statistics since construction
    pub fn stats(&self) -> DriverStats {
        DriverStats {
            ticks: self.ticks,
            slept_ms: self.slept_ms,
            overruns: self.scheduler.stats().overruns,
            coroutines_left: self.scheduler.num_coroutines(),
        }
    }
}
