use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
};

use thiserror::Error;

/// An error returned when a task could not be submitted to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The pool has been shut down and no longer accepts work.
    #[error("pool is shut down")]
    ShutDown,
}

/// A failure captured from inside a task.
///
/// Failures are caught at the worker boundary and never escape it; instead
/// they are transported back to the completion handle as the stringified
/// panic payload plus a best-effort backtrace.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
    stack: Option<String>,
}

impl TaskFailure {
    pub(crate) fn new(message: String, stack: Option<String>) -> Self {
        Self { message, stack }
    }

    /// Build a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(panic_message(payload), capture_stack())
    }

    /// The stringified panic payload.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// A best-effort backtrace captured where the failure was caught.
    ///
    /// `None` when backtrace capture is disabled for the process.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }
}

/// The rejection produced when waiting on a handle that did not produce a
/// value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task ran and failed.
    #[error(transparent)]
    Failure(#[from] TaskFailure),

    /// The task was cancelled before it started.
    #[error("task was cancelled")]
    Cancelled,
}

/// An error returned when trying to configure a process-wide default that has
/// already been initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("default {0} is already initialized")]
pub struct DefaultAlreadyInitialized(pub(crate) &'static str);

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();

    if backtrace.status() == BacktraceStatus::Captured {
        Some(backtrace.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_from_str() {
        let payload: Box<dyn Any + Send> = Box::new("oh no");
        assert_eq!(panic_message(&*payload), "oh no");
    }

    #[test]
    fn panic_message_from_string() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted: 42"));
        assert_eq!(panic_message(&*payload), "formatted: 42");
    }

    #[test]
    fn panic_message_from_opaque_payload() {
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "task panicked");
    }

    #[test]
    fn task_failure_displays_message() {
        let failure = TaskFailure::new("it broke".into(), None);
        assert_eq!(failure.to_string(), "it broke");
    }
}
