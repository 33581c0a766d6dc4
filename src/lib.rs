//! Bounded task execution on isolated worker threads, with a cooperative
//! in-process counterpart.
//!
//! This crate provides two coupled scheduling primitives:
//!
//! - [`IsolatedPool`]: a bounded pool of worker threads that share nothing
//!   with the submitter. A task is a plain function pointer applied to an
//!   argument moved in by value; the result (or the captured failure)
//!   travels back over a message channel. The pool bursts up to a maximum
//!   size, keeps overflow in a FIFO queue, retains a configurable number of
//!   core workers permanently, and reaps the rest after an idle window.
//! - [`InProcessExecutor`]: a bound on the number of concurrently in-flight
//!   cooperative tasks (futures) interleaving on one driver thread, with a
//!   FIFO wait queue. No isolation; tasks may capture shared state.
//!
//! Both hand back a [`CompletionHandle`], which carries the task's terminal
//! state (value, error, or cancelled), supports any number of completion
//! subscribers, blocking and `async` waiting, cancellation of work that has
//! not started yet, and an n-way [`join`].
//!
//! # Examples
//!
//! ```
//! fn collatz_steps(mut n: u64) -> u64 {
//!     let mut steps = 0;
//!
//!     while n != 1 {
//!         n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
//!         steps += 1;
//!     }
//!
//!     steps
//! }
//!
//! let pool = isopod::IsolatedPool::builder()
//!     .name("collatz")
//!     .max(4)
//!     .build();
//!
//! let tasks: Vec<_> = [27, 97, 871]
//!     .into_iter()
//!     .map(|n| pool.execute(collatz_steps, n).unwrap())
//!     .collect();
//!
//! let steps: Vec<u64> = isopod::join(tasks)
//!     .iter()
//!     .map(|task| task.result().unwrap())
//!     .collect();
//!
//! assert_eq!(steps, [111, 118, 178]);
//! ```
//!
//! Cancellation only reaches tasks that have not been dispatched yet:
//!
//! ```
//! use std::{thread, time::Duration};
//!
//! fn nap(ms: u64) -> u64 {
//!     thread::sleep(Duration::from_millis(ms));
//!     ms
//! }
//!
//! let pool = isopod::IsolatedPool::builder().name("naps").max(1).build();
//!
//! let running = pool.execute(nap, 100).unwrap();
//! let queued = pool.execute(nap, 100).unwrap();
//!
//! assert!(queued.cancel());
//! assert!(queued.is_cancelled());
//! assert_eq!(running.wait().unwrap(), 100);
//! ```

mod common;
mod error;
mod executor;
mod handle;
mod pool;
mod task;
mod wakers;
mod worker;

pub use common::{
    configure_default_executor, configure_default_pool, default_executor, default_pool,
    submit_in_process, submit_isolated,
};
pub use error::{DefaultAlreadyInitialized, SubmitError, TaskError, TaskFailure};
pub use executor::InProcessExecutor;
pub use handle::{join, CompletionHandle};
pub use pool::{Builder, IsolatedPool};
pub use task::TaskId;
