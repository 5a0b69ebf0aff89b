//! Task — cooperative, resumable unit of work
//!
//! A task wraps a [`Coroutine`] body that is advanced one step at a time.
//! Each advance runs until the body reaches a suspension point
//! ([`Step::Yield`]), ends naturally ([`Step::Complete`]) or fails
//! (`Err`). Bodies register cleanup actions through the [`Context`];
//! those run exactly once when the task reaches a final state, whether
//! it completed, failed or was cancelled.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;

use crate::error::TaskError;
use crate::timer::Clock;

// cs: thumbv6m / riscv32imc have no atomic fetch_add
static NEXT_TASK_ID: critical_section::Mutex<Cell<usize>> =
    critical_section::Mutex::new(Cell::new(1));

/// Opaque task identity, unique per constructed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

impl TaskId {
    fn next() -> Self {
        critical_section::with(|cs| {
            let next = NEXT_TASK_ID.borrow(cs);
            let id = next.get();
            next.set(id.wrapping_add(1));
            TaskId(id)
        })
    }

    /// Raw identifier (diagnostics only)
    pub const fn from_raw(raw: usize) -> Self {
        TaskId(raw)
    }

    /// Raw identifier
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, or currently being advanced
    Active,
    /// Yielded at a suspension point, waiting for the next advance
    Suspended,
    /// Ended naturally
    Completed,
    /// Terminated from outside
    Cancelled,
    /// Body returned an error
    Failed,
}

impl TaskState {
    /// Final state? (no further advances, cleanup already ran)
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Failed)
    }
}

/// Outcome of one advance of a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Suspension point: resume on a later tick
    Yield,
    /// Natural end
    Complete,
}

/// Resumable task body
pub trait Coroutine {
    /// Run until the next suspension point
    fn resume(&mut self, cx: &mut Context<'_>) -> Result<Step, TaskError>;
}

impl<F> Coroutine for F
where
    F: FnMut(&mut Context<'_>) -> Result<Step, TaskError>,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Result<Step, TaskError> {
        self(cx)
    }
}

type Cleanup = Box<dyn FnOnce()>;
type Observer = Box<dyn FnOnce(TaskId, TaskState)>;

/// What a body sees during one advance
pub struct Context<'a> {
    clock: &'a dyn Clock,
    cleanups: &'a RefCell<Vec<Cleanup>>,
}

impl<'a> Context<'a> {
    /// Current time of the driving clock (ms)
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Driving clock
    pub fn clock(&self) -> &'a dyn Clock {
        self.clock
    }

    /// Register a cleanup action
    ///
    /// Cleanups run once, newest first, when the task completes, fails or
    /// is cancelled.
    pub fn defer(&mut self, cleanup: impl FnOnce() + 'static) {
        self.cleanups.borrow_mut().push(Box::new(cleanup));
    }

    /// Advance a nested task once with this context's clock
    ///
    /// Returns `Complete` once the nested task has finished (naturally or
    /// by cancellation) and `Yield` while it is still running. A nested
    /// failure is returned as [`TaskError::Delegate`], failing the caller
    /// in turn when propagated with `?`.
    pub fn delegate(&mut self, task: &Task) -> Result<Step, TaskError> {
        match task.resume(self.clock) {
            TaskState::Active | TaskState::Suspended => Ok(Step::Yield),
            TaskState::Completed | TaskState::Cancelled => Ok(Step::Complete),
            TaskState::Failed => Err(TaskError::Delegate {
                task: task.id(),
                source: Box::new(task.error().unwrap_or(TaskError::Custom("unknown failure"))),
            }),
        }
    }
}

struct TaskInner {
    id: TaskId,
    name: Option<&'static str>,
    state: Cell<TaskState>,
    body: RefCell<Box<dyn Coroutine>>,
    cleanups: RefCell<Vec<Cleanup>>,
    observers: RefCell<Vec<Observer>>,
    cancel_requested: Cell<bool>,
    advances: Cell<u32>,
    error: RefCell<Option<TaskError>>,
}

/// Shared handle to a task
///
/// Cloning yields another handle to the same task; equality is identity.
#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl Task {
    /// Wrap a body into a new task
    pub fn new(body: impl Coroutine + 'static) -> Self {
        Self::build(None, Box::new(body))
    }

    /// Task with a name shown in log records
    pub fn named(name: &'static str, body: impl Coroutine + 'static) -> Self {
        Self::build(Some(name), Box::new(body))
    }

    /// Task from a closure body
    pub fn from_fn<F>(body: F) -> Self
    where
        F: FnMut(&mut Context<'_>) -> Result<Step, TaskError> + 'static,
    {
        Self::new(body)
    }

    fn build(name: Option<&'static str>, body: Box<dyn Coroutine>) -> Self {
        Self {
            inner: Rc::new(TaskInner {
                id: TaskId::next(),
                name,
                state: Cell::new(TaskState::Active),
                body: RefCell::new(body),
                cleanups: RefCell::new(Vec::new()),
                observers: RefCell::new(Vec::new()),
                cancel_requested: Cell::new(false),
                advances: Cell::new(0),
                error: RefCell::new(None),
            }),
        }
    }

    /// Task identity
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Name given at construction, if any
    pub fn name(&self) -> Option<&'static str> {
        self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.inner.state.get()
    }

    /// Completed, cancelled or failed?
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Non-owning handle; does not keep the task alive
    pub fn downgrade(&self) -> WeakTask {
        WeakTask {
            id: self.id(),
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Advances that have run to a suspension point or an end
    pub fn advances(&self) -> u32 {
        self.inner.advances.get()
    }

    /// Failure reported by the body, if it failed
    pub fn error(&self) -> Option<TaskError> {
        self.inner.error.borrow().clone()
    }

    /// Advance the task once
    ///
    /// No-op for a finished task, and for a task that is already being
    /// advanced further up the call stack.
    pub fn resume(&self, clock: &dyn Clock) -> TaskState {
        if self.is_finished() {
            return self.state();
        }
        let Ok(mut body) = self.inner.body.try_borrow_mut() else {
            return self.state();
        };

        self.inner.state.set(TaskState::Active);
        let result = {
            let mut cx = Context {
                clock,
                cleanups: &self.inner.cleanups,
            };
            body.resume(&mut cx)
        };
        drop(body);
        self.inner.advances.set(self.inner.advances.get().saturating_add(1));

        let outcome = match result {
            Ok(Step::Yield) if self.inner.cancel_requested.get() => TaskState::Cancelled,
            Ok(Step::Yield) => {
                self.inner.state.set(TaskState::Suspended);
                return TaskState::Suspended;
            }
            Ok(Step::Complete) => TaskState::Completed,
            Err(err) => {
                log::warn!("task {} failed: {}", self, err);
                *self.inner.error.borrow_mut() = Some(err);
                TaskState::Failed
            }
        };
        self.finish(outcome)
    }

    /// Cancel the task, running its cleanup actions before returning
    ///
    /// Returns `false` if the task had already finished. When called while
    /// the task itself is mid-advance, cancellation takes effect as soon
    /// as that advance returns.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        if self.inner.body.try_borrow_mut().is_err() {
            self.inner.cancel_requested.set(true);
            return true;
        }
        self.finish(TaskState::Cancelled);
        true
    }

    /// Observe the task's final state
    ///
    /// Fires once, after cleanup, with the final state. Fires immediately
    /// if the task has already finished.
    pub fn on_finish(&self, observer: impl FnOnce(TaskId, TaskState) + 'static) {
        if self.is_finished() {
            observer(self.id(), self.state());
        } else {
            self.inner.observers.borrow_mut().push(Box::new(observer));
        }
    }

    fn finish(&self, state: TaskState) -> TaskState {
        self.inner.state.set(state);
        log::debug!("task {} finished: {:?}", self, state);

        let mut cleanups = core::mem::take(&mut *self.inner.cleanups.borrow_mut());
        while let Some(cleanup) = cleanups.pop() {
            cleanup();
        }

        let observers = core::mem::take(&mut *self.inner.observers.borrow_mut());
        for observer in observers {
            observer(self.id(), state);
        }
        state
    }
}

/// Weak handle to a task, for observers that must not own it
#[derive(Clone)]
pub struct WeakTask {
    id: TaskId,
    inner: Weak<TaskInner>,
}

impl WeakTask {
    /// Identity of the task, even after it was freed
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Strong handle, if the task is still alive
    pub fn upgrade(&self) -> Option<Task> {
        self.inner.upgrade().map(|inner| Task { inner })
    }
}

impl fmt::Debug for WeakTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTask").field("id", &self.id).finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.id(), name),
            None => write!(f, "{}", self.id()),
        }
    }
}
