//! Completion handles: the caller-facing view of a submitted task.

use std::{
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    task::{Context, Poll, Waker},
    thread,
};

use once_cell::sync::OnceCell;

use crate::{
    error::{panic_message, TaskError, TaskFailure},
    task::TaskId,
    wakers,
};

/// Cancellation entry point of the pool or executor that owns a task.
///
/// Handles hold this behind a weak reference: dropping the owner is never
/// blocked by outstanding handles, they merely lose the ability to cancel.
pub(crate) trait CancelScope: Send + Sync {
    /// Cancel the task if it is still queued. Returns whether it was.
    fn cancel(&self, task: TaskId) -> bool;
}

/// Terminal outcome of a task. A handle reaches exactly one of these, once.
pub(crate) enum Outcome<T> {
    Value(T),
    Error(TaskFailure),
    Cancelled,
}

type ValueFn<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorFn = Box<dyn FnOnce(&TaskFailure) + Send>;
type ActionFn = Box<dyn FnOnce() + Send>;

struct Subscribers<T> {
    on_value: Vec<ValueFn<T>>,
    on_error: Vec<ErrorFn>,
    on_complete: Vec<ActionFn>,
    on_cancel: Vec<ActionFn>,
    wakers: Vec<Waker>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            on_value: Vec::new(),
            on_error: Vec::new(),
            on_complete: Vec::new(),
            on_cancel: Vec::new(),
            wakers: Vec::new(),
        }
    }
}

/// State shared between all clones of a handle and its settling side.
pub(crate) struct HandleInner<T> {
    outcome: OnceCell<Outcome<T>>,
    subscribers: Mutex<Subscribers<T>>,
}

impl<T> HandleInner<T> {
    fn new() -> Self {
        Self {
            outcome: OnceCell::new(),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    /// Transition the handle to a terminal state and fan out to subscribers.
    ///
    /// The outcome slot is written under the subscriber lock so registration
    /// can atomically decide between appending and firing immediately; the
    /// drained subscribers are invoked after the lock is released. A second
    /// settle is a no-op.
    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        let drained = {
            let mut subscribers = self.subscribers.lock().unwrap();

            if self.outcome.set(outcome).is_err() {
                return;
            }

            std::mem::take(&mut *subscribers)
        };

        // Wake waiters first so a panicking subscriber cannot strand them.
        for waker in drained.wakers {
            waker.wake();
        }

        match self.outcome.get().unwrap() {
            Outcome::Value(value) => {
                for subscriber in drained.on_value {
                    subscriber(value);
                }
                for subscriber in drained.on_complete {
                    subscriber();
                }
            }
            Outcome::Error(failure) => {
                for subscriber in drained.on_error {
                    // Error subscribers are not allowed to take down the
                    // settling thread (often a pool's dispatcher).
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(failure))) {
                        tracing::error!(
                            error = %panic_message(&*payload),
                            "error subscriber panicked"
                        );
                    }
                }
                for subscriber in drained.on_complete {
                    subscriber();
                }
            }
            Outcome::Cancelled => {
                for subscriber in drained.on_cancel {
                    subscriber();
                }
                for subscriber in drained.on_complete {
                    subscriber();
                }
            }
        }
    }
}

/// A handle to a submitted task.
///
/// The handle tracks the task's terminal state: completed with a value,
/// completed with an error, or cancelled. It supports multiple subscribers,
/// blocking and `async` waiting, and cancellation of work that has not been
/// dispatched yet. Handles are cheap to clone; all clones observe the same
/// task.
///
/// Dropping every handle detaches the task but does not cancel it.
///
/// Subscribers registered before the terminal transition run on the thread
/// that settles the task (the pool's dispatcher or the executor's driver), so
/// they must not block on operations of that same pool or executor.
///
/// # Examples
///
/// ```
/// fn double(n: u64) -> u64 {
///     n * 2
/// }
///
/// let pool = isopod::IsolatedPool::builder().name("docs").max(1).build();
///
/// let task = pool.execute(double, 21).unwrap();
/// assert_eq!(task.wait().unwrap(), 42);
/// ```
pub struct CompletionHandle<T> {
    task_id: TaskId,
    inner: Arc<HandleInner<T>>,
    canceller: Weak<dyn CancelScope>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            inner: self.inner.clone(),
            canceller: self.canceller.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> CompletionHandle<T> {
    /// A handle in the pending state, paired with the settling side handed to
    /// the owning pool or executor.
    pub(crate) fn pending(
        task_id: TaskId,
        canceller: Weak<dyn CancelScope>,
    ) -> (Self, Arc<HandleInner<T>>) {
        let inner = Arc::new(HandleInner::new());

        (
            Self {
                task_id,
                inner: inner.clone(),
                canceller,
            },
            inner,
        )
    }

    /// The id of the task this handle observes.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Whether the task has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Whether the task completed with an error.
    pub fn is_error(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(Outcome::Error(_)))
    }

    /// Whether the task was cancelled before it started.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(Outcome::Cancelled))
    }

    /// The task's failure, if it completed with an error.
    pub fn error(&self) -> Option<TaskFailure> {
        match self.inner.outcome.get() {
            Some(Outcome::Error(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// The task's value, if it completed with one.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        match self.inner.outcome.get() {
            Some(Outcome::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Register a subscriber for the task's value.
    ///
    /// If the task already completed with a value, the subscriber runs
    /// immediately on the current thread. It never runs for a task that
    /// failed or was cancelled.
    pub fn then<F>(&self, on_value: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let subscriber: ValueFn<T> = Box::new(on_value);

        let mut subscribers = self.inner.subscribers.lock().unwrap();

        match self.inner.outcome.get() {
            None => subscribers.on_value.push(subscriber),
            Some(outcome) => {
                drop(subscribers);

                if let Outcome::Value(value) = outcome {
                    subscriber(value);
                }
            }
        }
    }

    /// Register a subscriber for the task's failure.
    ///
    /// If the task already failed, the subscriber runs immediately on the
    /// current thread. Panics from error subscribers are caught and logged;
    /// they never propagate to the settling thread.
    pub fn on_error<F>(&self, on_error: F)
    where
        F: FnOnce(&TaskFailure) + Send + 'static,
    {
        let subscriber: ErrorFn = Box::new(on_error);

        let mut subscribers = self.inner.subscribers.lock().unwrap();

        match self.inner.outcome.get() {
            None => subscribers.on_error.push(subscriber),
            Some(outcome) => {
                drop(subscribers);

                if let Outcome::Error(failure) = outcome {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(failure))) {
                        tracing::error!(
                            error = %panic_message(&*payload),
                            "error subscriber panicked"
                        );
                    }
                }
            }
        }
    }

    /// Register a subscriber for any terminal transition, including
    /// cancellation.
    ///
    /// If the task is already terminal, the action runs immediately on the
    /// current thread and is not retained.
    pub fn when_complete<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let subscriber: ActionFn = Box::new(action);

        let mut subscribers = self.inner.subscribers.lock().unwrap();

        if self.inner.outcome.get().is_none() {
            subscribers.on_complete.push(subscriber);
        } else {
            drop(subscribers);
            subscriber();
        }
    }

    /// Register a subscriber that runs only if the task is cancelled.
    ///
    /// Registration on a handle that is already terminal is a no-op.
    pub fn on_cancel<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut subscribers = self.inner.subscribers.lock().unwrap();

        if self.inner.outcome.get().is_none() {
            subscribers.on_cancel.push(Box::new(action));
        }
    }

    /// Block the current thread until the task reaches a terminal state.
    ///
    /// Returns the task's value, or [`TaskError::Failure`] if the task
    /// failed, or [`TaskError::Cancelled`] if it was cancelled.
    pub fn wait(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap();

            if self.inner.outcome.get().is_none() {
                subscribers.wakers.push(wakers::current_thread_waker());
            }
        }

        loop {
            if let Some(outcome) = self.inner.outcome.get() {
                return match outcome {
                    Outcome::Value(value) => Ok(value.clone()),
                    Outcome::Error(failure) => Err(TaskError::Failure(failure.clone())),
                    Outcome::Cancelled => Err(TaskError::Cancelled),
                };
            }

            thread::park();
        }
    }

    /// Request cancellation of the task.
    ///
    /// Only work that is still queued can be cancelled; a task that a worker
    /// already owns runs to completion. Returns `true` if the task was
    /// removed from its queue, in which case the handle is now terminal with
    /// [`is_cancelled`][Self::is_cancelled] set and cancel subscribers have
    /// fired. Returns `false` in every other case (the handle does not
    /// transition), including when the owning pool is gone.
    pub fn cancel(&self) -> bool {
        if self.inner.outcome.get().is_some() {
            return false;
        }

        match self.canceller.upgrade() {
            Some(scope) => scope.cancel(self.task_id),
            None => false,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Future for CompletionHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut subscribers = self.inner.subscribers.lock().unwrap();

        match self.inner.outcome.get() {
            Some(Outcome::Value(value)) => Poll::Ready(Ok(value.clone())),
            Some(Outcome::Error(failure)) => Poll::Ready(Err(TaskError::Failure(failure.clone()))),
            Some(Outcome::Cancelled) => Poll::Ready(Err(TaskError::Cancelled)),
            None => {
                subscribers.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("task_id", &self.task_id)
            .field("complete", &self.is_complete())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Block until every handle in the collection has reached a terminal state,
/// then hand the collection back for result inspection.
///
/// Cancelled handles count as terminal. An empty collection returns
/// immediately.
///
/// # Examples
///
/// ```
/// fn square(n: u64) -> u64 {
///     n * n
/// }
///
/// let pool = isopod::IsolatedPool::builder().name("docs").max(2).build();
///
/// let tasks: Vec<_> = (1..=4)
///     .map(|n| pool.execute(square, n).unwrap())
///     .collect();
///
/// let results: Vec<u64> = isopod::join(tasks)
///     .iter()
///     .map(|task| task.result().unwrap())
///     .collect();
///
/// assert_eq!(results, [1, 4, 9, 16]);
/// ```
pub fn join<T>(handles: Vec<CompletionHandle<T>>) -> Vec<CompletionHandle<T>>
where
    T: Send + Sync + 'static,
{
    if handles.is_empty() {
        return handles;
    }

    let latch = Arc::new((Mutex::new(handles.len()), Condvar::new()));

    for handle in &handles {
        // A handle that reports both completion and cancellation must count
        // once, so both subscriptions share a per-handle guard.
        let counted = Arc::new(AtomicBool::new(false));

        handle.when_complete(arrival(&latch, &counted));
        handle.on_cancel(arrival(&latch, &counted));
    }

    let (remaining, condvar) = &*latch;
    let mut remaining = remaining.lock().unwrap();

    while *remaining > 0 {
        remaining = condvar.wait(remaining).unwrap();
    }

    drop(remaining);

    handles
}

fn arrival(
    latch: &Arc<(Mutex<usize>, Condvar)>,
    counted: &Arc<AtomicBool>,
) -> impl FnOnce() + Send + 'static {
    let latch = latch.clone();
    let counted = counted.clone();

    move || {
        if !counted.swap(true, Ordering::SeqCst) {
            let (remaining, condvar) = &*latch;
            let mut remaining = remaining.lock().unwrap();
            *remaining -= 1;

            if *remaining == 0 {
                condvar.notify_all();
            }
        }
    }
}
