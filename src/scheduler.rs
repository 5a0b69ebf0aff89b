//! Tick scheduler
//!
//! Fixed-order cooperative scheduling for control loops. Every call to
//! [`Scheduler::do_work`] runs one tick:
//!
//! ```text
//! update (pre) → sensors (registration order) → actions (registration order) → update (post)
//! ```
//!
//! The order never changes, however many tasks come and go. Sensor and
//! action tasks leave their set when they complete, fail or are stopped;
//! failures are logged and contained, never surfaced to the caller.
//!
//! Author: Moroya Sakamoto

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use crate::task::{Task, TaskState};
use crate::timer::{Clock, TickBudget};

/// Default tick interval (50 Hz control loop)
pub const DEFAULT_TICK_INTERVAL_MS: u32 = 20;

/// What to do when the update task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFailurePolicy {
    /// Log, clear the update slot, keep running sensors and actions
    #[default]
    Contain,
    /// Log, clear the update slot and stop every sensor and action task
    StopAll,
}

/// Scheduler configuration
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Target period of the driving loop (ms); only used for budget queries
    pub tick_interval_ms: u32,
    /// Reaction to a failing update task
    pub update_failure: UpdateFailurePolicy,
}

impl SchedulerConfig {
    /// Same config with another tick interval
    pub fn with_tick_interval(self, tick_interval_ms: u32) -> Self {
        Self {
            tick_interval_ms,
            ..self
        }
    }

    /// Same config with another update-failure policy
    pub fn with_update_failure(self, update_failure: UpdateFailurePolicy) -> Self {
        Self {
            update_failure,
            ..self
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            update_failure: UpdateFailurePolicy::Contain,
        }
    }
}

/// Task category; fixes where in the tick a task is advanced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Update,
    Sensor,
    Action,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ticks executed
    pub ticks: u64,
    /// Task advances (update advances included)
    pub advances: u64,
    /// Tasks that ended naturally
    pub completed: u64,
    /// Tasks stopped from outside
    pub cancelled: u64,
    /// Tasks whose body failed
    pub failed: u64,
    /// Ticks started more than one interval after the previous tick
    pub overruns: u64,
}

struct SchedulerInner {
    update: Option<Task>,
    sensors: Vec<Task>,
    actions: Vec<Task>,
    budget: Option<TickBudget>,
    stats: SchedulerStats,
}

impl SchedulerInner {
    fn category_of(&self, task: &Task) -> Option<Category> {
        if self.sensors.contains(task) {
            Some(Category::Sensor)
        } else if self.actions.contains(task) {
            Some(Category::Action)
        } else {
            None
        }
    }

    fn set_mut(&mut self, category: Category) -> Option<&mut Vec<Task>> {
        match category {
            Category::Sensor => Some(&mut self.sensors),
            Category::Action => Some(&mut self.actions),
            Category::Update => None,
        }
    }

    fn remove(&mut self, task: &Task) -> bool {
        match self.category_of(task) {
            Some(category) => {
                if let Some(set) = self.set_mut(category) {
                    set.retain(|t| t != task);
                }
                true
            }
            None => false,
        }
    }
}

/// Cooperative tick scheduler
///
/// Cheap to clone: clones share the same task sets, so task bodies and
/// combinators can hold a handle and call back in during a tick. No
/// internal borrow is held while a task body runs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
    clock: Rc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Scheduler with the default configuration
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::with_config(SchedulerConfig::default(), clock)
    }

    /// Scheduler with a custom tick interval
    pub fn with_interval(tick_interval_ms: u32, clock: impl Clock + 'static) -> Self {
        Self::with_config(
            SchedulerConfig::default().with_tick_interval(tick_interval_ms),
            clock,
        )
    }

    /// Scheduler with an explicit configuration
    pub fn with_config(config: SchedulerConfig, clock: impl Clock + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                update: None,
                sensors: Vec::new(),
                actions: Vec::new(),
                budget: None,
                stats: SchedulerStats::default(),
            })),
            clock: Rc::new(clock),
            config,
        }
    }

    /// Scheduler on the strictly increasing wall clock
    #[cfg(feature = "std")]
    pub fn system() -> Self {
        use crate::timer::{StrictClock, SystemClock};
        Self::new(StrictClock::new(SystemClock::new()))
    }

    /// Configuration fixed at construction
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Target period of the driving loop (ms)
    pub fn tick_interval_millis(&self) -> u32 {
        self.config.tick_interval_ms
    }

    /// Current time of the injected clock (ms)
    pub fn current_time_millis(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Injected clock
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Non-owning handle, for tasks that must not keep the scheduler alive
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Rc::downgrade(&self.inner),
            clock: self.clock.clone(),
            config: self.config,
        }
    }

    /// Append a sensor task; returns the same handle
    pub fn add_sensor_coroutine(&self, task: Task) -> Task {
        self.register(task, Category::Sensor)
    }

    /// Append an action task; returns the same handle
    pub fn add_action_coroutine(&self, task: Task) -> Task {
        self.register(task, Category::Action)
    }

    fn register(&self, task: Task, category: Category) -> Task {
        let mut inner = self.inner.borrow_mut();
        let existing = if inner.update.as_ref() == Some(&task) {
            Some(Category::Update)
        } else {
            inner.category_of(&task)
        };
        if let Some(existing) = existing {
            log::warn!("task {} already registered as {:?}, ignoring", task, existing);
            return task;
        }
        if let Some(set) = inner.set_mut(category) {
            set.push(task.clone());
        }
        log::debug!("registered {:?} task {}", category, task);
        task
    }

    /// Install the update task, replacing any previous one
    ///
    /// The replaced task is dropped from the slot without cleanup. A task
    /// already registered as sensor or action is refused.
    pub fn set_update_coroutine(&self, task: Task) {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing) = inner.category_of(&task) {
            log::warn!(
                "task {} already registered as {:?}, not installing as update",
                task,
                existing
            );
            return;
        }
        log::debug!("update task set to {}", task);
        inner.update = Some(task);
    }

    /// Is an update task installed?
    pub fn has_update_coroutine(&self) -> bool {
        self.inner.borrow().update.is_some()
    }

    /// Is the task in the sensor or action set?
    pub fn is_registered(&self, task: &Task) -> bool {
        self.inner.borrow().category_of(task).is_some()
    }

    /// Stop a sensor or action task
    ///
    /// Removes it from its set and runs its cleanup before returning.
    /// Returns `false` (and does nothing) if the task is not registered.
    pub fn stop_coroutine(&self, task: &Task) -> bool {
        if !self.inner.borrow_mut().remove(task) {
            return false;
        }
        if task.cancel() {
            log::debug!("stopped task {}", task);
            // a stop issued mid-advance lands when that advance returns,
            // and the task may still end some other way
            let inner = Rc::downgrade(&self.inner);
            task.on_finish(move |_, state| {
                let Some(inner) = inner.upgrade() else { return };
                let Ok(mut inner) = inner.try_borrow_mut() else { return };
                match state {
                    TaskState::Completed => inner.stats.completed += 1,
                    TaskState::Failed => inner.stats.failed += 1,
                    _ => inner.stats.cancelled += 1,
                }
            });
        }
        true
    }

    /// Stop every sensor and action task (the update task is left alone)
    pub fn stop_all_coroutines(&self) {
        let registered: Vec<Task> = {
            let inner = self.inner.borrow();
            inner.sensors.iter().chain(inner.actions.iter()).cloned().collect()
        };
        for task in &registered {
            self.stop_coroutine(task);
        }
    }

    /// Number of sensor and action tasks (the update task is not counted)
    pub fn num_coroutines(&self) -> usize {
        let inner = self.inner.borrow();
        inner.sensors.len() + inner.actions.len()
    }

    /// Counters since construction
    pub fn stats(&self) -> SchedulerStats {
        self.inner.borrow().stats
    }

    /// Advance a task once on this scheduler's clock
    ///
    /// For driving a combinator (or any task) directly from the caller's
    /// own loop instead of registering it.
    pub fn drive(&self, task: &Task) -> TaskState {
        task.resume(&*self.clock)
    }

    /// Run one tick
    pub fn do_work(&self) {
        let start = self.clock.now_ms();
        let (update, sensors, actions) = {
            let mut inner = self.inner.borrow_mut();
            if let Some(previous) = inner.budget {
                if previous.is_overrun(start) {
                    inner.stats.overruns += 1;
                    log::warn!(
                        "tick overrun: {} ms since previous tick (interval {} ms)",
                        previous.elapsed(start),
                        self.config.tick_interval_ms
                    );
                }
            }
            inner.budget = Some(TickBudget::new(start, self.config.tick_interval_ms));
            inner.stats.ticks += 1;
            (inner.update.clone(), inner.sensors.clone(), inner.actions.clone())
        };
        log::trace!(
            "tick at {} ms: {} sensors, {} actions",
            start,
            sensors.len(),
            actions.len()
        );

        if let Some(update) = update {
            self.advance_update(&update);
        }
        for task in &sensors {
            self.advance_registered(task);
        }
        for task in &actions {
            self.advance_registered(task);
        }
        let update = self.inner.borrow().update.clone();
        if let Some(update) = update {
            self.advance_update(&update);
        }
    }

    fn advance_registered(&self, task: &Task) {
        // stopped earlier in this tick
        if !self.is_registered(task) {
            return;
        }
        let state = task.resume(&*self.clock);

        let mut inner = self.inner.borrow_mut();
        inner.stats.advances += 1;
        if !state.is_finished() || !inner.remove(task) {
            return;
        }
        match state {
            TaskState::Completed => inner.stats.completed += 1,
            TaskState::Failed => inner.stats.failed += 1,
            _ => inner.stats.cancelled += 1,
        }
        log::debug!("task {} left the scheduler: {:?}", task, state);
    }

    fn advance_update(&self, task: &Task) {
        let state = task.resume(&*self.clock);
        {
            let mut inner = self.inner.borrow_mut();
            inner.stats.advances += 1;
            if !state.is_finished() {
                return;
            }
            if inner.update.as_ref() == Some(task) {
                inner.update = None;
            }
            match state {
                TaskState::Completed => inner.stats.completed += 1,
                TaskState::Failed => inner.stats.failed += 1,
                _ => inner.stats.cancelled += 1,
            }
        }

        if state != TaskState::Failed {
            log::debug!("update task {} ended: {:?}", task, state);
            return;
        }
        log::error!(
            "update task {} failed, slot cleared ({:?})",
            task,
            self.config.update_failure
        );
        if self.config.update_failure == UpdateFailurePolicy::StopAll {
            self.stop_all_coroutines();
        }
    }

    /// Milliseconds left in the current tick's budget, never negative
    ///
    /// Before the first tick the whole interval is available.
    pub fn time_millis_to_next_call(&self) -> u32 {
        let budget = self.inner.borrow().budget;
        match budget {
            Some(budget) => budget.remaining(self.clock.now_ms()),
            None => self.config.tick_interval_ms,
        }
    }
}

/// Weak handle to a [`Scheduler`]
///
/// Held by combinators so a registered combinator does not keep its own
/// scheduler (and with it every task) alive.
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<RefCell<SchedulerInner>>,
    clock: Rc<dyn Clock>,
    config: SchedulerConfig,
}

impl WeakScheduler {
    /// Strong handle, if the scheduler still exists
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler {
            inner,
            clock: self.clock.clone(),
            config: self.config,
        })
    }
}

impl fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakScheduler")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("update", &inner.update)
            .field("sensors", &inner.sensors.len())
            .field("actions", &inner.actions.len())
            .field("stats", &inner.stats)
            .finish()
    }
}
