//! The isolated worker pool.
//!
//! A pool runs entry-point functions on a bounded set of worker threads. The
//! submitting side and a worker share nothing: the argument moves into the
//! task's envelope, the result (or captured failure) travels back over the
//! pool's event channel, and a single dispatcher thread makes every
//! scheduling decision, so no scheduling state is ever shared between
//! threads.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::{
    error::{SubmitError, TaskFailure},
    handle::{CancelScope, CompletionHandle, HandleInner, Outcome},
    task::{TaskEnvelope, TaskId, TaskOutcome},
    worker::{Worker, WorkerEvent, WorkerId},
};

const DEFAULT_KEEP_ACTIVE: Duration = Duration::from_secs(120);

/// A builder for constructing a customized isolated pool.
#[derive(Debug, Clone)]
pub struct Builder {
    name: String,
    max: Option<usize>,
    core: usize,
    keep_active: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: "isopod".into(),
            max: None,
            core: 0,
            keep_active: DEFAULT_KEEP_ACTIVE,
        }
    }
}

impl Builder {
    /// Set the pool name, used as the prefix of worker thread names.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty.
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.is_empty() {
            panic!("pool name must not be empty");
        }

        self.name = name;
        self
    }

    /// Set the maximum number of workers the pool may have alive at once.
    ///
    /// If not set, defaults to twice the number of logical CPUs.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn max(mut self, max: usize) -> Self {
        if max == 0 {
            panic!("pool maximum size must be non-zero");
        }

        self.max = Some(max);
        self
    }

    /// Set the number of core workers, which are never idle-reaped.
    ///
    /// Defaults to zero: every worker exits once it has been idle past the
    /// keep-active window.
    pub fn core(mut self, core: usize) -> Self {
        self.core = core;
        self
    }

    /// Set how long a non-core worker may sit idle before it exits.
    ///
    /// Defaults to 120 seconds.
    ///
    /// # Panics
    ///
    /// Panics if the duration is zero.
    pub fn keep_active(mut self, keep_active: Duration) -> Self {
        if keep_active.is_zero() {
            panic!("keep-active window must be non-zero");
        }

        self.keep_active = keep_active;
        self
    }

    /// Create an isolated pool according to the configuration set with this
    /// builder.
    ///
    /// # Panics
    ///
    /// Panics if the core size is larger than the maximum size.
    pub fn build(self) -> IsolatedPool {
        let max = self.max.unwrap_or_else(|| num_cpus::get().max(1) * 2);

        if self.core > max {
            panic!("pool core size cannot be larger than maximum size");
        }

        let shared = Arc::new(Shared {
            name: self.name,
            max,
            core: self.core,
            keep_active: self.keep_active,
            active_workers: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            is_shut_down: AtomicBool::new(false),
        });

        let (control_tx, control_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let dispatcher = Dispatcher {
            shared: shared.clone(),
            control: control_rx,
            events: event_rx,
            event_tx,
            workers: Vec::new(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_worker_id: 0,
        };

        thread::Builder::new()
            .name(format!("{}-dispatch", shared.name))
            .spawn(move || dispatcher.run())
            .unwrap();

        IsolatedPool {
            core: Arc::new(PoolCore {
                shared,
                control: control_tx,
            }),
        }
    }
}

/// Pool state shared between the owner, the dispatcher, and observers.
struct Shared {
    name: String,
    max: usize,
    core: usize,
    keep_active: Duration,
    active_workers: AtomicUsize,
    queued: AtomicUsize,
    next_task_id: AtomicU64,
    completed_tasks: AtomicU64,
    is_shut_down: AtomicBool,
}

/// What the dispatcher reports to a task's completion sink.
enum SinkOutcome {
    Value(Box<dyn Any + Send>),
    Failed(TaskFailure),
    Cancelled,
}

type CompletionSink = Box<dyn FnOnce(SinkOutcome) + Send>;

enum Control {
    Submit {
        envelope: TaskEnvelope,
        sink: CompletionSink,
    },
    Cancel {
        task: TaskId,
        reply: Sender<bool>,
    },
    Shutdown,
}

struct PoolCore {
    shared: Arc<Shared>,
    control: Sender<Control>,
}

impl CancelScope for PoolCore {
    fn cancel(&self, task: TaskId) -> bool {
        let (reply_tx, reply_rx) = bounded(1);

        if self
            .control
            .send(Control::Cancel {
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

/// A pool of isolated workers.
///
/// Tasks are plain functions of a by-value argument; they run on worker
/// threads that share no state with the submitter. The pool spawns workers
/// on demand up to its maximum size, keeps a FIFO overflow queue for
/// submissions beyond that, retains `core` workers permanently, and reaps
/// the rest once they have been idle past the keep-active window.
///
/// Dropping the last handle to the pool shuts it down: queued tasks are
/// cancelled and workers stop after their current task.
///
/// # Examples
///
/// ```
/// fn fibonacci(n: u64) -> u64 {
///     match n {
///         0 | 1 => n,
///         n => fibonacci(n - 1) + fibonacci(n - 2),
///     }
/// }
///
/// let pool = isopod::IsolatedPool::builder()
///     .name("math")
///     .max(4)
///     .build();
///
/// let task = pool.execute(fibonacci, 20).unwrap();
/// assert_eq!(task.wait().unwrap(), 6765);
/// ```
pub struct IsolatedPool {
    core: Arc<PoolCore>,
}

impl Default for IsolatedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolatedPool {
    /// Create a new pool with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Get a builder for creating a customized pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.core.shared.name
    }

    /// The number of workers currently alive (spawned and not yet exited).
    ///
    /// Never exceeds the configured maximum.
    pub fn active_workers(&self) -> usize {
        self.core.shared.active_workers.load(Ordering::SeqCst)
    }

    /// The number of tasks waiting in the overflow queue.
    pub fn queued_tasks(&self) -> usize {
        self.core.shared.queued.load(Ordering::SeqCst)
    }

    /// The number of tasks finished (successfully or otherwise) since the
    /// pool was created.
    pub fn completed_tasks(&self) -> u64 {
        self.core.shared.completed_tasks.load(Ordering::SeqCst)
    }

    /// Whether the pool has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.core.shared.is_shut_down.load(Ordering::SeqCst)
    }

    /// Submit a task without a handle.
    ///
    /// The task runs as usual but its result is discarded and a failure is
    /// only logged. Returns the task id, which can still be passed to
    /// [`cancel`][Self::cancel] while the task is queued.
    pub fn submit<A, R>(&self, entry: fn(A) -> R, argument: A) -> Result<TaskId, SubmitError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let id = self.next_task_id()?;

        self.send_envelope(TaskEnvelope::from_entry(id, entry, argument), Box::new(|_| {}))?;

        Ok(id)
    }

    /// Submit a task and get a handle to its completion.
    ///
    /// If fewer than `max` workers are alive a new worker is spawned for the
    /// task (a core worker while the pool is below its core size); otherwise
    /// the task waits in the overflow queue for the first worker to go idle.
    pub fn execute<A, R>(
        &self,
        entry: fn(A) -> R,
        argument: A,
    ) -> Result<CompletionHandle<R>, SubmitError>
    where
        A: Send + 'static,
        R: Send + Sync + 'static,
    {
        let id = self.next_task_id()?;
        let (handle, inner) = CompletionHandle::pending(id, self.cancel_scope());

        self.send_envelope(TaskEnvelope::from_entry(id, entry, argument), settle_sink(inner))?;

        Ok(handle)
    }

    /// Submit an entry point that returns a future.
    ///
    /// The worker drives the future to completion on its own thread before
    /// acknowledging the task.
    pub fn execute_future<A, F>(
        &self,
        entry: fn(A) -> F,
        argument: A,
    ) -> Result<CompletionHandle<F::Output>, SubmitError>
    where
        A: Send + 'static,
        F: Future + 'static,
        F::Output: Send + Sync + 'static,
    {
        let id = self.next_task_id()?;
        let (handle, inner) = CompletionHandle::pending(id, self.cancel_scope());

        self.send_envelope(
            TaskEnvelope::from_future_entry(id, entry, argument),
            settle_sink(inner),
        )?;

        Ok(handle)
    }

    /// Cancel a task that is still waiting in the overflow queue.
    ///
    /// Returns `true` iff the task was removed from the queue; a task that a
    /// worker already owns cannot be cancelled and keeps running.
    pub fn cancel(&self, task: TaskId) -> bool {
        self.core.cancel(task)
    }

    /// Shut down the pool.
    ///
    /// Subsequent submissions fail with [`SubmitError::ShutDown`]. Tasks
    /// still in the overflow queue are cancelled. Workers stop as soon as
    /// they finish their current task; running tasks are never interrupted,
    /// and their results still settle their handles.
    pub fn shutdown(&self) {
        self.core.shared.is_shut_down.store(true, Ordering::SeqCst);
        let _ = self.core.control.send(Control::Shutdown);
    }

    fn next_task_id(&self) -> Result<TaskId, SubmitError> {
        if self.is_shut_down() {
            return Err(SubmitError::ShutDown);
        }

        Ok(TaskId(
            self.core.shared.next_task_id.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    fn send_envelope(&self, envelope: TaskEnvelope, sink: CompletionSink) -> Result<(), SubmitError> {
        self.core
            .control
            .send(Control::Submit { envelope, sink })
            .map_err(|_| SubmitError::ShutDown)
    }

    fn cancel_scope(&self) -> Weak<dyn CancelScope> {
        let scope: Arc<dyn CancelScope> = self.core.clone();
        Arc::downgrade(&scope)
    }
}

impl fmt::Debug for IsolatedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedPool")
            .field("name", &self.name())
            .field("active_workers", &self.active_workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .finish()
    }
}

/// A sink that settles a completion handle, downcasting the type-erased
/// result back to the handle's type.
fn settle_sink<R: Send + Sync + 'static>(inner: Arc<HandleInner<R>>) -> CompletionSink {
    Box::new(move |outcome| match outcome {
        SinkOutcome::Value(value) => match value.downcast::<R>() {
            Ok(value) => inner.settle(Outcome::Value(*value)),
            Err(_) => inner.settle(Outcome::Error(TaskFailure::new(
                "task produced a result of an unexpected type".into(),
                None,
            ))),
        },
        SinkOutcome::Failed(failure) => inner.settle(Outcome::Error(failure)),
        SinkOutcome::Cancelled => inner.settle(Outcome::Cancelled),
    })
}

/// Pool-side record of one worker.
struct WorkerRecord {
    id: WorkerId,
    debug_name: String,
    /// `None` until the worker publishes its mailbox, and again once the
    /// pool closes it during shutdown.
    inbound: Option<Sender<TaskEnvelope>>,
    busy: bool,
}

/// The dispatcher owns all scheduling state and runs on its own thread.
///
/// Every event that can free capacity (worker ready, task ack, worker exit)
/// triggers a dispatch pass; dispatch itself never blocks.
struct Dispatcher {
    shared: Arc<Shared>,
    control: Receiver<Control>,
    events: Receiver<WorkerEvent>,
    /// Cloned into every spawned worker. Also keeps `events` connected, so
    /// the drain loop below relies on the worker table rather than channel
    /// disconnection.
    event_tx: Sender<WorkerEvent>,
    workers: Vec<WorkerRecord>,
    queue: VecDeque<TaskEnvelope>,
    pending: HashMap<TaskId, CompletionSink>,
    next_worker_id: WorkerId,
}

impl Dispatcher {
    fn run(mut self) {
        // Live phase: ends on an explicit shutdown or when every pool handle
        // has been dropped.
        let mut control_open = loop {
            select! {
                recv(self.control) -> message => match message {
                    Ok(Control::Submit { envelope, sink }) => self.on_submit(envelope, sink),
                    Ok(Control::Cancel { task, reply }) => {
                        let hit = self.on_cancel(task);
                        let _ = reply.send(hit);
                    }
                    Ok(Control::Shutdown) => break true,
                    Err(_) => break false,
                },
                recv(self.events) -> event => {
                    if let Ok(event) = event {
                        self.on_event(event);
                    }
                }
            }
        };

        self.begin_shutdown();

        // Drain phase: wait for every worker to exit so their threads are
        // released, still answering control traffic while the pool handle
        // lives.
        while !self.workers.is_empty() {
            if control_open {
                select! {
                    recv(self.control) -> message => match message {
                        Ok(Control::Submit { envelope, sink }) => {
                            // A submission that raced the shutdown flag; it
                            // will never run.
                            drop(envelope);
                            sink(SinkOutcome::Cancelled);
                        }
                        Ok(Control::Cancel { reply, .. }) => {
                            let _ = reply.send(false);
                        }
                        Ok(Control::Shutdown) => {}
                        Err(_) => control_open = false,
                    },
                    recv(self.events) -> event => {
                        if let Ok(event) = event {
                            self.on_event(event);
                        }
                    }
                }
            } else {
                match self.events.recv() {
                    Ok(event) => self.on_event(event),
                    // Unreachable while we hold `event_tx`.
                    Err(_) => break,
                }
            }
        }

        tracing::debug!(pool = %self.shared.name, "dispatcher stopped");
    }

    fn on_submit(&mut self, envelope: TaskEnvelope, sink: CompletionSink) {
        // A submission that raced the shutdown flag must not spawn a worker.
        if self.shared.is_shut_down.load(Ordering::SeqCst) {
            drop(envelope);
            sink(SinkOutcome::Cancelled);
            return;
        }

        self.pending.insert(envelope.id, sink);

        let active = self.shared.active_workers.load(Ordering::SeqCst);

        if active < self.shared.max {
            // Core only while the pool is below its core size at spawn time.
            self.spawn_worker(Some(envelope), active < self.shared.core);
        } else {
            self.queue.push_back(envelope);
            self.dispatch();
        }
    }

    fn on_cancel(&mut self, task: TaskId) -> bool {
        let Some(position) = self.queue.iter().position(|envelope| envelope.id == task) else {
            return false;
        };

        self.queue.remove(position);
        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);

        if let Some(sink) = self.pending.remove(&task) {
            sink(SinkOutcome::Cancelled);
        }

        true
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker, inbound } => {
                if self.shared.is_shut_down.load(Ordering::SeqCst) {
                    // Dropping the mailbox stops the worker once its seeded
                    // envelope (if any) is done.
                    drop(inbound);
                } else if let Some(record) = self.worker_mut(worker) {
                    record.inbound = Some(inbound);
                }

                self.dispatch();
            }
            WorkerEvent::Ack {
                worker,
                task,
                outcome,
            } => {
                if let Some(record) = self.worker_mut(worker) {
                    record.busy = false;
                }

                self.shared.completed_tasks.fetch_add(1, Ordering::SeqCst);

                if let Some(sink) = self.pending.remove(&task) {
                    sink(sink_outcome(outcome));
                } else {
                    tracing::debug!(task = %task, "ack for unknown task");
                }

                self.dispatch();
            }
            WorkerEvent::Exit { worker } => {
                // The voluntary sentinel and the thread-exit guard both send
                // this; only the first one for a given worker counts.
                let Some(position) = self.workers.iter().position(|record| record.id == worker)
                else {
                    return;
                };

                let record = self.workers.remove(position);
                self.shared.active_workers.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(worker = %record.debug_name, "worker exited");

                self.dispatch();
            }
        }
    }

    /// Hand queued envelopes to idle workers in table order, then burst new
    /// workers for whatever remains, up to the maximum.
    fn dispatch(&mut self) {
        if self.shared.is_shut_down.load(Ordering::SeqCst) {
            return;
        }

        for record in &mut self.workers {
            if record.busy {
                continue;
            }

            let Some(inbound) = record.inbound.as_ref() else {
                continue;
            };

            let Some(envelope) = self.queue.pop_front() else {
                break;
            };

            match inbound.try_send(envelope) {
                Ok(()) => record.busy = true,
                // A full or closed mailbox means the worker is not actually
                // idle (it may be mid-exit); put the envelope back and let a
                // later event retry.
                Err(error) => self.queue.push_front(error.into_inner()),
            }
        }

        while !self.queue.is_empty()
            && self.shared.active_workers.load(Ordering::SeqCst) < self.shared.max
        {
            let envelope = self.queue.pop_front();
            // Overflow replacements are always subject to the reaper.
            self.spawn_worker(envelope, false);
        }

        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
    }

    fn spawn_worker(&mut self, initial: Option<TaskEnvelope>, is_core: bool) {
        debug_assert!(self.shared.active_workers.load(Ordering::SeqCst) < self.shared.max);

        let busy = initial.is_some();

        self.next_worker_id += 1;
        let id = self.next_worker_id;
        let debug_name = format!("{}-worker-{}", self.shared.name, id);

        let worker = Worker::new(
            id,
            debug_name.clone(),
            is_core,
            self.shared.keep_active,
            initial,
            self.event_tx.clone(),
        );

        self.shared.active_workers.fetch_add(1, Ordering::SeqCst);
        self.workers.push(WorkerRecord {
            id,
            debug_name: debug_name.clone(),
            inbound: None,
            busy,
        });

        tracing::debug!(worker = %debug_name, core = is_core, "spawning worker");

        thread::Builder::new()
            .name(debug_name)
            .spawn(move || worker.run())
            .unwrap();
    }

    fn begin_shutdown(&mut self) {
        self.shared.is_shut_down.store(true, Ordering::SeqCst);
        tracing::debug!(pool = %self.shared.name, "shutting down");

        // Closing the mailboxes stops every worker after its current task.
        for record in &mut self.workers {
            record.inbound = None;
        }

        for envelope in self.queue.drain(..) {
            if let Some(sink) = self.pending.remove(&envelope.id) {
                sink(SinkOutcome::Cancelled);
            }
        }

        self.shared.queued.store(0, Ordering::SeqCst);
    }

    fn worker_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|record| record.id == id)
    }
}

fn sink_outcome(outcome: TaskOutcome) -> SinkOutcome {
    match outcome {
        Ok(value) => SinkOutcome::Value(value),
        Err(failure) => SinkOutcome::Failed(failure),
    }
}
