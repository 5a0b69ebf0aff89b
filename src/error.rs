//! Task error types
//!
//! A task body reports a failed advance by returning `Err(TaskError)`.
//! The scheduler contains the failure at the task boundary: the task is
//! removed, its cleanup runs, and the error is logged and stored on the
//! task handle. Nothing here ever escapes `Scheduler::do_work`.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::string::String;

use thiserror::Error;

use crate::task::TaskId;

/// Error raised by a task body while advancing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Body failed with a formatted message
    #[error("task failed: {0}")]
    Failed(String),

    /// Body failed with a static message (no allocation)
    #[error("task failed: {0}")]
    Custom(&'static str),

    /// A nested task driven through `Context::delegate` failed
    #[error("delegated task {task} failed: {source}")]
    Delegate {
        /// Nested task that failed
        task: TaskId,
        /// Failure of the nested task
        source: Box<TaskError>,
    },
}

impl TaskError {
    /// Build a `Failed` error from anything printable
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}
