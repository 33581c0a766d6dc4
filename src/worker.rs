//! Worker threads: isolated execution contexts owned by a pool.

use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};

use crate::task::{TaskEnvelope, TaskId, TaskOutcome};

pub(crate) type WorkerId = u64;

/// Messages a worker sends to its pool over the shared event channel.
pub(crate) enum WorkerEvent {
    /// The worker created its mailbox and is ready to be dispatched to.
    Ready {
        worker: WorkerId,
        inbound: Sender<TaskEnvelope>,
    },

    /// A task finished, successfully or not.
    Ack {
        worker: WorkerId,
        task: TaskId,
        outcome: TaskOutcome,
    },

    /// The worker is going away. Sent voluntarily when the idle reaper fires
    /// and unconditionally by the exit guard when the thread ends; the pool
    /// deduplicates by worker-table membership.
    Exit { worker: WorkerId },
}

/// The thread-side half of a pool worker.
///
/// A worker processes one envelope at a time. Its mailbox holds at most one
/// envelope beyond the one being processed, so the pool's `try_send` doubles
/// as the idle check.
pub(crate) struct Worker {
    id: WorkerId,
    debug_name: String,
    is_core: bool,
    keep_active: Duration,
    initial: Option<TaskEnvelope>,
    events: Sender<WorkerEvent>,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        debug_name: String,
        is_core: bool,
        keep_active: Duration,
        initial: Option<TaskEnvelope>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            debug_name,
            is_core,
            keep_active,
            initial,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        // Announces the exit when the thread ends for any reason. This is the
        // authoritative signal that no further messages will arrive.
        struct ExitGuard {
            id: WorkerId,
            events: Sender<WorkerEvent>,
        }

        impl Drop for ExitGuard {
            fn drop(&mut self) {
                let _ = self.events.send(WorkerEvent::Exit { worker: self.id });
            }
        }

        let _guard = ExitGuard {
            id: self.id,
            events: self.events.clone(),
        };

        let (inbound_tx, inbound) = bounded(1);

        if self
            .events
            .send(WorkerEvent::Ready {
                worker: self.id,
                inbound: inbound_tx,
            })
            .is_err()
        {
            // The pool is already gone.
            return;
        }

        tracing::debug!(worker = %self.debug_name, core = self.is_core, "worker ready");

        if let Some(envelope) = self.initial.take() {
            self.run_envelope(envelope);
        }

        if self.is_core {
            // Core workers are never reaped; they stop when the pool closes
            // the mailbox.
            while let Ok(envelope) = inbound.recv() {
                self.run_envelope(envelope);
            }
        } else {
            loop {
                select! {
                    recv(inbound) -> envelope => match envelope {
                        Ok(envelope) => self.run_envelope(envelope),
                        Err(_) => return,
                    },
                    default(self.keep_active) => {
                        tracing::debug!(worker = %self.debug_name, "idle past keep-active window, exiting");

                        if self
                            .events
                            .send(WorkerEvent::Exit { worker: self.id })
                            .is_err()
                        {
                            return;
                        }

                        // Keep accepting work until the pool acknowledges the
                        // exit by closing the mailbox, so an envelope racing
                        // the sentinel is still run and acked.
                        while let Ok(envelope) = inbound.recv() {
                            self.run_envelope(envelope);
                        }

                        return;
                    }
                }
            }
        }
    }

    fn run_envelope(&self, envelope: TaskEnvelope) {
        let task = envelope.id;
        let outcome = envelope.run();

        if let Err(failure) = &outcome {
            tracing::warn!(worker = %self.debug_name, task = %task, error = %failure, "task failed");
        }

        let _ = self.events.send(WorkerEvent::Ack {
            worker: self.id,
            task,
            outcome,
        });
    }
}
