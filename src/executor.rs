//! The in-process bounded executor.
//!
//! Unlike the isolated pool, this executor provides no isolation: tasks are
//! ordinary futures that may capture shared state, and they all interleave
//! cooperatively on one driver thread. The executor is strictly a semaphore
//! with a FIFO wait queue: at most `max_size` tasks are in flight, and
//! queued tasks start as slots free up.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
    thread,
};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use slab::Slab;

use crate::{
    error::TaskFailure,
    handle::{CancelScope, CompletionHandle, HandleInner, Outcome},
    task::TaskId,
};

pub(crate) const DEFAULT_MAX_SIZE: usize = 20;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(0);

/// The driver side of an in-process task. Polls the underlying future and
/// settles the task's handle when it finishes, one way or another.
trait Coroutine: Send {
    fn task_id(&self) -> TaskId;

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Settle the handle as cancelled without ever polling the future.
    fn settle_cancelled(self: Box<Self>);
}

struct FutureCoroutine<F: Future> {
    id: TaskId,
    future: F,
    inner: Arc<HandleInner<F::Output>>,
}

impl<F> Coroutine for FutureCoroutine<F>
where
    F: Future + Send + 'static,
    F::Output: Send + Sync + 'static,
{
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: the coroutine only ever lives inside a box, so neither self
        // nor this future will move.
        let future = unsafe { Pin::new_unchecked(&mut self.future) };

        match catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                self.inner.settle(Outcome::Value(value));
                Poll::Ready(())
            }
            Err(payload) => {
                self.inner.settle(Outcome::Error(TaskFailure::from_panic(&*payload)));
                Poll::Ready(())
            }
        }
    }

    fn settle_cancelled(self: Box<Self>) {
        self.inner.settle(Outcome::Cancelled);
    }
}

enum ExecControl {
    Run(Box<dyn Coroutine>),
    CancelQueued { task: TaskId, reply: Sender<bool> },
    ClearQueued,
}

struct ExecShared {
    max_size: usize,
    in_flight: AtomicUsize,
    next_task_id: AtomicU64,
}

struct ExecCore {
    shared: Arc<ExecShared>,
    control: Sender<ExecControl>,
}

impl CancelScope for ExecCore {
    fn cancel(&self, task: TaskId) -> bool {
        let (reply_tx, reply_rx) = bounded(1);

        if self
            .control
            .send(ExecControl::CancelQueued {
                task,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }

        reply_rx.recv().unwrap_or(false)
    }
}

/// An executor that bounds the number of concurrently in-flight cooperative
/// tasks.
///
/// Tasks beyond the bound wait in a FIFO queue and start as running tasks
/// finish. A task that panics settles its own handle with the failure; the
/// executor itself is unaffected.
///
/// Dropping the executor stops intake; tasks that already started still run
/// to completion, while tasks still waiting for a slot are dropped and never
/// complete.
///
/// # Examples
///
/// ```
/// let executor = isopod::InProcessExecutor::new(2);
///
/// let task = executor.execute(async { 2 + 2 });
/// assert_eq!(task.wait().unwrap(), 4);
/// ```
pub struct InProcessExecutor {
    core: Arc<ExecCore>,
}

impl Default for InProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl InProcessExecutor {
    /// Create an executor allowing at most `max_size` tasks in flight.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is zero.
    pub fn new(max_size: usize) -> Self {
        if max_size == 0 {
            panic!("executor maximum size must be non-zero");
        }

        let shared = Arc::new(ExecShared {
            max_size,
            in_flight: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
        });

        let (control_tx, control_rx) = unbounded();
        let (wake_tx, wake_rx) = unbounded();

        let driver = Driver {
            shared: shared.clone(),
            control: control_rx,
            running: Slab::new(),
            waiting: VecDeque::new(),
            wakes: (wake_tx, wake_rx),
        };

        thread::Builder::new()
            .name(format!(
                "in-process-{}",
                NEXT_DRIVER_ID.fetch_add(1, Ordering::SeqCst) + 1
            ))
            .spawn(move || driver.run())
            .unwrap();

        Self {
            core: Arc::new(ExecCore {
                shared,
                control: control_tx,
            }),
        }
    }

    /// The configured in-flight bound.
    pub fn max_size(&self) -> usize {
        self.core.shared.max_size
    }

    /// The number of tasks currently in flight (started and not finished).
    pub fn active_count(&self) -> usize {
        self.core.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a task.
    ///
    /// Starts polling immediately if a slot is free, otherwise the task
    /// waits its turn in FIFO order. Cancelling the returned handle before
    /// the task starts guarantees the future is never polled.
    pub fn execute<F>(&self, future: F) -> CompletionHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + Sync + 'static,
    {
        let id = TaskId(
            self.core
                .shared
                .next_task_id
                .fetch_add(1, Ordering::SeqCst)
                + 1,
        );

        let scope: Arc<dyn CancelScope> = self.core.clone();
        let (handle, inner) = CompletionHandle::pending(id, Arc::downgrade(&scope));

        let coroutine = Box::new(FutureCoroutine {
            id,
            future,
            inner,
        });

        // The driver thread outlives every executor handle.
        self.core.control.send(ExecControl::Run(coroutine)).unwrap();

        handle
    }

    /// Submit a collection of tasks in order.
    pub fn execute_all<I>(&self, futures: I) -> Vec<CompletionHandle<<I::Item as Future>::Output>>
    where
        I: IntoIterator,
        I::Item: Future + Send + 'static,
        <I::Item as Future>::Output: Send + Sync + 'static,
    {
        futures.into_iter().map(|future| self.execute(future)).collect()
    }

    /// Drop every task still waiting for a slot.
    ///
    /// Cleared tasks never run and their handles never complete. Tasks
    /// already in flight are unaffected.
    pub fn clear_queued(&self) {
        self.core.control.send(ExecControl::ClearQueued).unwrap();
    }
}

impl fmt::Debug for InProcessExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessExecutor")
            .field("max_size", &self.max_size())
            .field("active_count", &self.active_count())
            .finish()
    }
}

/// A waker that reports the slot of the task it belongs to.
struct SlotWaker {
    key: usize,
    wakes: Sender<usize>,
}

impl Wake for SlotWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.wakes.send(self.key);
    }
}

/// The driver loop: a single thread interleaving every in-flight task.
struct Driver {
    shared: Arc<ExecShared>,
    control: Receiver<ExecControl>,
    /// Tasks that yielded and are waiting on their wakers.
    running: Slab<(Box<dyn Coroutine>, Waker)>,
    /// Tasks waiting for an in-flight slot.
    waiting: VecDeque<Box<dyn Coroutine>>,
    wakes: (Sender<usize>, Receiver<usize>),
}

impl Driver {
    fn run(mut self) {
        loop {
            select! {
                recv(self.control) -> message => match message {
                    Ok(ExecControl::Run(coroutine)) => {
                        if self.shared.in_flight.load(Ordering::SeqCst) < self.shared.max_size {
                            self.start(coroutine);
                        } else {
                            self.waiting.push_back(coroutine);
                        }

                        self.drain_waiting();
                    }
                    Ok(ExecControl::CancelQueued { task, reply }) => {
                        let hit = match self
                            .waiting
                            .iter()
                            .position(|coroutine| coroutine.task_id() == task)
                        {
                            Some(position) => {
                                if let Some(coroutine) = self.waiting.remove(position) {
                                    coroutine.settle_cancelled();
                                }
                                true
                            }
                            None => false,
                        };

                        let _ = reply.send(hit);
                    }
                    Ok(ExecControl::ClearQueued) => {
                        if !self.waiting.is_empty() {
                            tracing::debug!(dropped = self.waiting.len(), "clearing wait queue");
                        }

                        self.waiting.clear();
                    }
                    Err(_) => break,
                },
                recv(self.wakes.1) -> key => {
                    if let Ok(key) = key {
                        self.poll_running(key);
                    }
                }
            }
        }

        // The executor was dropped. Tasks that never started are dropped with
        // it, but tasks already in flight get to finish.
        self.waiting.clear();

        while !self.running.is_empty() {
            let key = self.wakes.1.recv().expect("wake channel can't be dropped");
            self.poll_running(key);
        }
    }

    fn start(&mut self, mut coroutine: Box<dyn Coroutine>) {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);

        let key = self.running.vacant_entry().key();
        let waker: Waker = Arc::new(SlotWaker {
            key,
            wakes: self.wakes.0.clone(),
        })
        .into();

        let mut cx = Context::from_waker(&waker);

        match coroutine.poll(&mut cx) {
            Poll::Pending => {
                self.running.insert((coroutine, waker));
            }
            Poll::Ready(()) => {
                self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn poll_running(&mut self, key: usize) {
        // Wakes can arrive for tasks that already finished; the slot is
        // simply gone by then.
        let Some((coroutine, waker)) = self.running.get_mut(key) else {
            return;
        };

        let waker = waker.clone();
        let mut cx = Context::from_waker(&waker);

        if coroutine.poll(&mut cx).is_ready() {
            self.running.remove(key);
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.drain_waiting();
        }
    }

    fn drain_waiting(&mut self) {
        while self.shared.in_flight.load(Ordering::SeqCst) < self.shared.max_size {
            let Some(next) = self.waiting.pop_front() else {
                return;
            };

            self.start(next);
        }
    }
}
