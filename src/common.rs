use std::future::Future;

use once_cell::sync::OnceCell;

use crate::{
    error::{DefaultAlreadyInitialized, SubmitError},
    executor::InProcessExecutor,
    handle::CompletionHandle,
    pool::{Builder, IsolatedPool},
};

static DEFAULT_POOL: OnceCell<IsolatedPool> = OnceCell::new();
static DEFAULT_EXECUTOR: OnceCell<InProcessExecutor> = OnceCell::new();

/// Get a shared reference to the process-wide default isolated pool.
///
/// The pool is created lazily on first use with a maximum of twice the
/// number of logical CPUs, no core workers, and the default keep-active
/// window. It lives for the rest of the process; there is no teardown hook.
///
/// # Examples
///
/// ```
/// fn double(n: u64) -> u64 {
///     n * 2
/// }
///
/// let task = isopod::default_pool().execute(double, 8).unwrap();
///
/// assert_eq!(task.wait().unwrap(), 16);
/// ```
pub fn default_pool() -> &'static IsolatedPool {
    DEFAULT_POOL.get_or_init(|| default_pool_builder().build())
}

/// Configure the process-wide default isolated pool.
///
/// This should be done near the start of your program before any other code
/// uses the default pool, as this function will return an error if the
/// default pool has already been initialized.
///
/// Only programs should use this function! Libraries should instead create
/// their own pool instance if they need a customized one.
pub fn configure_default_pool<F>(f: F) -> Result<(), DefaultAlreadyInitialized>
where
    F: FnOnce(Builder) -> Builder,
{
    let mut was_initialized = true;

    DEFAULT_POOL.get_or_init(|| {
        was_initialized = false;
        f(default_pool_builder()).build()
    });

    if was_initialized {
        Err(DefaultAlreadyInitialized("pool"))
    } else {
        Ok(())
    }
}

/// Get a shared reference to the process-wide default in-process executor.
///
/// The executor is created lazily on first use with an in-flight bound of
/// 20. It lives for the rest of the process; there is no teardown hook.
pub fn default_executor() -> &'static InProcessExecutor {
    DEFAULT_EXECUTOR.get_or_init(InProcessExecutor::default)
}

/// Configure the process-wide default in-process executor.
///
/// Returns an error if the default executor has already been initialized.
pub fn configure_default_executor(max_size: usize) -> Result<(), DefaultAlreadyInitialized> {
    let mut was_initialized = true;

    DEFAULT_EXECUTOR.get_or_init(|| {
        was_initialized = false;
        InProcessExecutor::new(max_size)
    });

    if was_initialized {
        Err(DefaultAlreadyInitialized("executor"))
    } else {
        Ok(())
    }
}

/// Submit a task to the default isolated pool and get its completion handle.
///
/// The entry point must be a plain function. It runs on a worker thread
/// with only the argument it is given, which is moved in by value.
///
/// # Examples
///
/// ```
/// fn greet(name: String) -> String {
///     format!("hello, {name}")
/// }
///
/// let task = isopod::submit_isolated(greet, "isopod".to_owned()).unwrap();
///
/// assert_eq!(task.wait().unwrap(), "hello, isopod");
/// ```
pub fn submit_isolated<A, R>(
    entry: fn(A) -> R,
    argument: A,
) -> Result<CompletionHandle<R>, SubmitError>
where
    A: Send + 'static,
    R: Send + Sync + 'static,
{
    default_pool().execute(entry, argument)
}

/// Submit a future to the default in-process executor and get its completion
/// handle.
///
/// # Examples
///
/// ```
/// let task = isopod::submit_in_process(async { 6 * 7 });
///
/// assert_eq!(task.wait().unwrap(), 42);
/// ```
pub fn submit_in_process<F>(future: F) -> CompletionHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + Sync + 'static,
{
    default_executor().execute(future)
}

fn default_pool_builder() -> Builder {
    Builder::default().name("isopod-default")
}
