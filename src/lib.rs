//! tickflow — cooperative, tick-budgeted task scheduling
//!
//! Drive motors, read sensors, stay inside the control period.
//!
//! Minimal cooperative scheduler for fixed-period control loops:
//! - One update task plus ordered sensor and action tasks
//! - Fixed tick order: update → sensors → actions → update
//! - Cleanup actions that run exactly once, however a task ends
//! - Failures contained per task, never surfaced to the loop
//! - Combinators (wait, race, join, timeout) built from the same primitives
//! - Injectable clock, `no_std` + `alloc`
//!
//! ```
//! use std::rc::Rc;
//! use tickflow::{combinator, Scheduler, SoftwareClock, TaskState};
//!
//! let clock = Rc::new(SoftwareClock::new());
//! let sched = Scheduler::new(clock.clone());
//! let wait = combinator::with_timeout(50, &sched, combinator::wait_milliseconds(1000));
//! while !sched.drive(&wait).is_finished() {
//!     sched.do_work();
//!     clock.advance(10);
//! }
//! assert_eq!(wait.state(), TaskState::Completed);
//! ```
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;
pub mod task;
pub mod timer;
pub mod scheduler;
pub mod combinator;
pub mod driver;

pub use error::TaskError;
pub use task::{Context, Coroutine, Step, Task, TaskId, TaskState, WeakTask};
pub use scheduler::{
    Category, Scheduler, SchedulerConfig, SchedulerStats, UpdateFailurePolicy, WeakScheduler,
    DEFAULT_TICK_INTERVAL_MS,
};
pub use timer::{Clock, ScriptedClock, SoftwareClock, StrictClock, TickBudget};
#[cfg(feature = "std")]
pub use timer::SystemClock;
pub use combinator::{
    run_till_all_complete, run_till_first_completes, wait_for, wait_for_args,
    wait_milliseconds, with_timeout,
};
pub use driver::{ClockSleeper, Driver, DriverStats, Sleeper, StopHandle};
#[cfg(feature = "std")]
pub use driver::ThreadSleeper;
