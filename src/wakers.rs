use std::{
    future::Future,
    task::{Context, Poll, Waker},
    thread::{self, Thread},
};

/// Creates a waker that unparks the current thread.
pub(crate) fn current_thread_waker() -> Waker {
    thread_waker(thread::current())
}

/// Creates a waker that unparks a thread.
pub(crate) fn thread_waker(thread: Thread) -> Waker {
    waker_fn::waker_fn(move || thread.unpark())
}

/// Drive a future to completion on the current thread, parking between polls.
///
/// Used by workers to run future-returning entry points. The worker processes
/// one envelope at a time, so blocking the worker thread here is exactly the
/// intended behavior.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    let waker = current_thread_waker();
    let mut cx = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_ready_future() {
        assert_eq!(block_on(async { 2 + 2 }), 4);
    }

    #[test]
    fn block_on_yielding_future() {
        use std::time::Duration;

        let value = block_on(async {
            futures_timer::Delay::new(Duration::from_millis(10)).await;
            7
        });

        assert_eq!(value, 7);
    }
}
