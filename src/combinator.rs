//! Control-flow combinators built from scheduler primitives
//!
//! Each combinator is an ordinary [`Task`]: advance it directly (for
//! example with [`Scheduler::drive`] between ticks) or register it like
//! any other task. Combinators register their children as action tasks
//! on their first advance and stop every still-running child when they
//! are themselves cancelled.
//!
//! Combinators only hold a [`WeakScheduler`], and race observers only
//! hold [`WeakTask`]s, so dropping the scheduler frees every task.
//!
//! Author: Moroya Sakamoto

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::error::TaskError;
use crate::scheduler::{Scheduler, WeakScheduler};
use crate::task::{Context, Step, Task, TaskState, WeakTask};

fn stop_children(scheduler: &WeakScheduler, children: &[Task]) {
    let scheduler = scheduler.upgrade();
    for child in children {
        if let Some(scheduler) = &scheduler {
            scheduler.stop_coroutine(child);
        }
        // covers children already drained from the scheduler's sets
        child.cancel();
    }
}

fn attach(scheduler: &WeakScheduler) -> Result<Scheduler, TaskError> {
    scheduler.upgrade().ok_or(TaskError::Custom("scheduler dropped"))
}

fn done_if(condition: bool) -> Result<Step, TaskError> {
    Ok(if condition { Step::Complete } else { Step::Yield })
}

/// Completes once `duration_ms` has elapsed since its first advance
pub fn wait_milliseconds(duration_ms: u32) -> Task {
    let mut started_at: Option<u64> = None;
    Task::named("wait_milliseconds", move |cx: &mut Context<'_>| {
        let now = cx.now_ms();
        let start = *started_at.get_or_insert(now);
        done_if(now.saturating_sub(start) >= u64::from(duration_ms))
    })
}

/// Completes on the first advance where `predicate` holds
///
/// Arguments are captured by the closure; see [`wait_for_args`] to pass
/// them separately.
pub fn wait_for(mut predicate: impl FnMut() -> bool + 'static) -> Task {
    Task::named("wait_for", move |_: &mut Context<'_>| done_if(predicate()))
}

/// [`wait_for`] with the predicate's arguments held by the task
pub fn wait_for_args<A: 'static>(mut predicate: impl FnMut(&A) -> bool + 'static, args: A) -> Task {
    Task::named("wait_for", move |_: &mut Context<'_>| done_if(predicate(&args)))
}

/// Races `tasks`; completes as soon as one of them finishes
///
/// The first task to complete (or fail) stops all the others right away,
/// from inside the same tick, so a sibling later in registration order
/// never gets its advance in that tick. Also completes if every raced
/// task was stopped from outside.
pub fn run_till_first_completes(scheduler: &Scheduler, tasks: impl IntoIterator<Item = Task>) -> Task {
    let scheduler = scheduler.downgrade();
    let tasks: Vec<Task> = tasks.into_iter().collect();
    let decided = Rc::new(Cell::new(false));
    let mut started = false;

    Task::named("run_till_first_completes", move |cx: &mut Context<'_>| {
        if !started {
            let sched = attach(&scheduler)?;
            started = true;
            let (weak, children) = (scheduler.clone(), tasks.clone());
            cx.defer(move || stop_children(&weak, &children));

            for task in &tasks {
                sched.add_action_coroutine(task.clone());
            }
            let siblings: Vec<WeakTask> = tasks.iter().map(Task::downgrade).collect();
            for task in &tasks {
                let (weak, siblings, decided) = (scheduler.clone(), siblings.clone(), decided.clone());
                task.on_finish(move |winner, state| {
                    if state == TaskState::Cancelled || decided.get() {
                        return;
                    }
                    decided.set(true);
                    log::debug!("race decided by task {}: {:?}", winner, state);
                    let losers: Vec<Task> = siblings
                        .iter()
                        .filter(|t| t.id() != winner)
                        .filter_map(WeakTask::upgrade)
                        .collect();
                    stop_children(&weak, &losers);
                });
            }
        }
        done_if(decided.get() || tasks.iter().all(Task::is_finished))
    })
}

/// Runs `tasks` side by side; completes once every one of them finished
pub fn run_till_all_complete(scheduler: &Scheduler, tasks: impl IntoIterator<Item = Task>) -> Task {
    let scheduler = scheduler.downgrade();
    let tasks: Vec<Task> = tasks.into_iter().collect();
    let mut started = false;

    Task::named("run_till_all_complete", move |cx: &mut Context<'_>| {
        if !started {
            let sched = attach(&scheduler)?;
            started = true;
            let (weak, children) = (scheduler.clone(), tasks.clone());
            cx.defer(move || stop_children(&weak, &children));
            for task in &tasks {
                sched.add_action_coroutine(task.clone());
            }
        }
        done_if(tasks.iter().all(Task::is_finished))
    })
}

/// Runs `task`, stopping it once `duration_ms` has elapsed
///
/// Completes when the task finishes on its own, or when the deadline
/// passes (after stopping the task and running its cleanup). Afterwards
/// `task.state()` tells the two apart: `Cancelled` means it timed out.
pub fn with_timeout(duration_ms: u32, scheduler: &Scheduler, task: Task) -> Task {
    let scheduler = scheduler.downgrade();
    let mut started_at: Option<u64> = None;

    Task::named("with_timeout", move |cx: &mut Context<'_>| -> Result<Step, TaskError> {
        let now = cx.now_ms();
        let start = match started_at {
            Some(start) => start,
            None => {
                let sched = attach(&scheduler)?;
                started_at = Some(now);
                let (weak, child) = (scheduler.clone(), task.clone());
                cx.defer(move || stop_children(&weak, core::slice::from_ref(&child)));
                sched.add_action_coroutine(task.clone());
                now
            }
        };

        if task.is_finished() {
            return Ok(Step::Complete);
        }
        if now.saturating_sub(start) >= u64::from(duration_ms) {
            log::debug!("task {} timed out after {} ms", task, duration_ms);
            stop_children(&scheduler, core::slice::from_ref(&task));
            return Ok(Step::Complete);
        }
        Ok(Step::Yield)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::SoftwareClock;
    use core::cell::RefCell;

    type Log = Rc<RefCell<Vec<i64>>>;

    /// Records 1..=n, one value per advance, then completes on advance n + 1
    fn steps(log: &Log, n: i64) -> Task {
        let log = log.clone();
        let mut k = 0;
        Task::from_fn(move |_| {
            k += 1;
            if k > n {
                return Ok(Step::Complete);
            }
            log.borrow_mut().push(k);
            Ok(Step::Yield)
        })
    }

    /// Like `steps`, with a cleanup recording -1
    fn guarded_steps(log: &Log, n: i64) -> Task {
        let log = log.clone();
        let mut k = 0;
        Task::from_fn(move |cx| {
            k += 1;
            if k == 1 {
                let log = log.clone();
                cx.defer(move || log.borrow_mut().push(-1));
            }
            if k > n {
                return Ok(Step::Complete);
            }
            log.borrow_mut().push(k);
            Ok(Step::Yield)
        })
    }

    fn scheduler() -> (Rc<SoftwareClock>, Scheduler) {
        let clock = Rc::new(SoftwareClock::new());
        let sched = Scheduler::new(clock.clone());
        (clock, sched)
    }

    /// Advance `task` directly, running a tick after each unfinished advance
    fn drive_to_end(sched: &Scheduler, task: &Task, max_ticks: usize) -> usize {
        for tick in 0..max_ticks {
            if sched.drive(task).is_finished() {
                return tick;
            }
            sched.do_work();
        }
        panic!("task did not finish within {max_ticks} ticks");
    }

    #[test]
    fn test_wait_milliseconds() {
        let (clock, sched) = scheduler();
        let wait = wait_milliseconds(30);
        assert_eq!(sched.drive(&wait), TaskState::Suspended);
        clock.advance(29);
        assert_eq!(sched.drive(&wait), TaskState::Suspended);
        clock.advance(1);
        assert_eq!(sched.drive(&wait), TaskState::Completed);
    }

    #[test]
    fn test_wait_zero_completes_at_once() {
        let (_, sched) = scheduler();
        assert_eq!(sched.drive(&wait_milliseconds(0)), TaskState::Completed);
    }

    #[test]
    fn test_wait_inside_body() {
        let (clock, sched) = scheduler();
        let log = Log::default();
        let sink = log.clone();
        let pause = wait_milliseconds(40);
        let mut phase = 0;
        sched.add_action_coroutine(Task::from_fn(move |cx| {
            if phase == 0 {
                sink.borrow_mut().push(1);
                phase = 1;
            }
            if cx.delegate(&pause)? == Step::Yield {
                return Ok(Step::Yield);
            }
            sink.borrow_mut().push(2);
            Ok(Step::Complete)
        }));
        for _ in 0..5 {
            sched.do_work();
            clock.advance(10);
        }
        assert_eq!(*log.borrow(), [1, 2]);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_wait_for_predicate() {
        let (_, sched) = scheduler();
        let reached = Rc::new(Cell::new(false));
        let seen = reached.clone();
        let wait = wait_for(move || seen.get());
        assert_eq!(sched.drive(&wait), TaskState::Suspended);
        assert_eq!(sched.drive(&wait), TaskState::Suspended);
        reached.set(true);
        assert_eq!(sched.drive(&wait), TaskState::Completed);
    }

    #[test]
    fn test_wait_for_args() {
        let (_, sched) = scheduler();
        let encoder = Rc::new(Cell::new(0));
        let wait = wait_for_args(|(count, target): &(Rc<Cell<i32>>, i32)| count.get() >= *target, (encoder.clone(), 3));
        for _ in 0..3 {
            assert_eq!(sched.drive(&wait), TaskState::Suspended);
            encoder.set(encoder.get() + 1);
        }
        assert_eq!(sched.drive(&wait), TaskState::Completed);
    }

    #[test]
    fn test_first_completes_cancels_unadvanced_sibling() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let race = run_till_first_completes(&sched, [steps(&log, 8), steps(&log, 1), steps(&log, 8)]);
        drive_to_end(&sched, &race, 20);
        assert_eq!(*log.borrow(), [1, 1, 1, 2]);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_first_completes_runs_loser_cleanup() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let slow = guarded_steps(&log, 8);
        let fast = steps(&log, 1);
        let later = guarded_steps(&log, 8);
        let race = run_till_first_completes(&sched, [slow.clone(), fast.clone(), later.clone()]);
        drive_to_end(&sched, &race, 20);
        assert_eq!(*log.borrow(), [1, 1, 1, 2, -1, -1]);
        assert_eq!(fast.state(), TaskState::Completed);
        assert_eq!(slow.state(), TaskState::Cancelled);
        assert_eq!(later.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_first_completes_on_failure() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let mut calls = 0;
        let flaky = Task::from_fn(move |_| {
            calls += 1;
            if calls == 2 {
                Err(TaskError::msg("limit switch fault"))
            } else {
                Ok(Step::Yield)
            }
        });
        let survivor = guarded_steps(&log, 10);
        let race = run_till_first_completes(&sched, [flaky.clone(), survivor.clone()]);
        drive_to_end(&sched, &race, 20);
        assert_eq!(flaky.state(), TaskState::Failed);
        assert_eq!(survivor.state(), TaskState::Cancelled);
        assert_eq!(*log.borrow(), [1, -1]);
    }

    #[test]
    fn test_first_completes_when_all_stopped() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let race = run_till_first_completes(&sched, [steps(&log, 5), steps(&log, 5)]);
        assert_eq!(sched.drive(&race), TaskState::Suspended);
        sched.do_work();
        sched.stop_all_coroutines();
        assert_eq!(sched.drive(&race), TaskState::Completed);
    }

    #[test]
    fn test_first_completes_empty() {
        let (_, sched) = scheduler();
        let race = run_till_first_completes(&sched, Vec::new());
        assert_eq!(sched.drive(&race), TaskState::Completed);
    }

    #[test]
    fn test_all_complete_is_exhaustive() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let all = run_till_all_complete(&sched, [steps(&log, 1), steps(&log, 2), steps(&log, 3)]);
        drive_to_end(&sched, &all, 20);
        assert_eq!(*log.borrow(), [1, 1, 1, 2, 2, 3]);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_all_complete_counts_failures() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let broken = Task::from_fn(|_| Err(TaskError::Custom("no sensor")));
        let all = run_till_all_complete(&sched, [broken, steps(&log, 2)]);
        let ticks = drive_to_end(&sched, &all, 20);
        assert_eq!(ticks, 3);
        assert_eq!(*log.borrow(), [1, 2]);
    }

    #[test]
    fn test_registered_combinator() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let all = sched.add_action_coroutine(run_till_all_complete(&sched, [steps(&log, 1), steps(&log, 1)]));
        for _ in 0..5 {
            sched.do_work();
        }
        assert_eq!(all.state(), TaskState::Completed);
        assert_eq!(*log.borrow(), [1, 1]);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_timeout_stops_task() {
        let (clock, sched) = scheduler();
        let log = Log::default();
        let child = guarded_steps(&log, 100);
        let bounded = with_timeout(50, &sched, child.clone());
        let ticks = {
            let mut ticks = 0;
            while !sched.drive(&bounded).is_finished() {
                sched.do_work();
                clock.advance(20);
                ticks += 1;
            }
            ticks
        };
        assert_eq!(ticks, 3);
        assert_eq!(child.state(), TaskState::Cancelled);
        assert_eq!(*log.borrow(), [1, 2, 3, -1]);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_timeout_not_reached() {
        let (clock, sched) = scheduler();
        let log = Log::default();
        let child = guarded_steps(&log, 2);
        let bounded = with_timeout(1000, &sched, child.clone());
        while !sched.drive(&bounded).is_finished() {
            sched.do_work();
            clock.advance(20);
        }
        assert_eq!(child.state(), TaskState::Completed);
        assert_eq!(*log.borrow(), [1, 2, -1]);
    }

    #[test]
    fn test_timeout_cancels_nested_race() {
        let (clock, sched) = scheduler();
        let log = Log::default();
        let a = guarded_steps(&log, 100);
        let b = guarded_steps(&log, 100);
        let race = run_till_first_completes(&sched, [a.clone(), b.clone()]);
        let bounded = with_timeout(30, &sched, race.clone());
        while !sched.drive(&bounded).is_finished() {
            sched.do_work();
            clock.advance(10);
        }
        assert_eq!(race.state(), TaskState::Cancelled);
        assert_eq!(a.state(), TaskState::Cancelled);
        assert_eq!(b.state(), TaskState::Cancelled);
        assert_eq!(sched.num_coroutines(), 0);
    }

    #[test]
    fn test_cancelled_combinator_stops_children() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let all = run_till_all_complete(&sched, [guarded_steps(&log, 9), guarded_steps(&log, 9)]);
        sched.drive(&all);
        sched.do_work();
        assert_eq!(sched.num_coroutines(), 2);
        assert!(all.cancel());
        assert_eq!(sched.num_coroutines(), 0);
        assert_eq!(*log.borrow(), [1, 1, -1, -1]);
    }

    #[test]
    fn test_dropping_scheduler_frees_race_children() {
        struct DropFlag(Rc<Cell<bool>>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let (_, sched) = scheduler();
        let dropped = Rc::new(Cell::new(false));
        let flag = DropFlag(dropped.clone());
        let child = Task::from_fn(move |_| {
            let _held = &flag;
            Ok(Step::Yield)
        });
        let other = Task::from_fn(|_| Ok(Step::Yield));
        sched.add_action_coroutine(run_till_first_completes(&sched, [child, other]));
        sched.do_work();
        sched.do_work();
        assert_eq!(sched.num_coroutines(), 3);
        assert!(!dropped.get());
        drop(sched);
        assert!(dropped.get());
    }

    #[test]
    fn test_combinator_fails_without_scheduler() {
        let (_, sched) = scheduler();
        let log = Log::default();
        let all = run_till_all_complete(&sched, [steps(&log, 1)]);
        let clock = SoftwareClock::new();
        drop(sched);
        assert_eq!(all.resume(&clock), TaskState::Failed);
        assert!(log.borrow().is_empty());
    }
}
