use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use futures_timer::Delay;
use isopod::{join, InProcessExecutor, IsolatedPool, SubmitError, TaskError};

fn identity(n: usize) -> usize {
    n
}

fn nap_and_return((index, ms): (usize, u64)) -> usize {
    thread::sleep(Duration::from_millis(ms));
    index
}

fn nap(ms: u64) -> u64 {
    thread::sleep(Duration::from_millis(ms));
    ms
}

fn explode(_: ()) {
    panic!("task exploded");
}

fn record((order, index): (Arc<Mutex<Vec<usize>>>, usize)) {
    order.lock().unwrap().push(index);
}

/// Subscribers run on the settling thread, so assertions about them may need
/// to wait a beat.
fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);

    while Instant::now() < deadline {
        if condition() {
            return;
        }

        thread::sleep(Duration::from_millis(5));
    }

    panic!("condition not reached within deadline");
}

#[test]
#[should_panic(expected = "pool name must not be empty")]
fn empty_pool_name_panics() {
    IsolatedPool::builder().name("");
}

#[test]
#[should_panic(expected = "pool maximum size must be non-zero")]
fn zero_pool_max_panics() {
    IsolatedPool::builder().max(0);
}

#[test]
#[should_panic(expected = "pool core size cannot be larger than maximum size")]
fn core_above_max_panics() {
    IsolatedPool::builder().name("bad").max(2).core(3).build();
}

#[test]
fn execute_returns_the_value() {
    let pool = IsolatedPool::builder().name("simple").max(1).build();

    assert_eq!(pool.execute(identity, 7).unwrap().wait().unwrap(), 7);
}

#[test]
fn results_match_inputs_under_load() {
    let pool = IsolatedPool::builder().name("load").max(4).build();
    let started = Instant::now();

    let tasks: Vec<_> = (0..40)
        .map(|index| pool.execute(nap_and_return, (index, 25)).unwrap())
        .collect();

    assert!(pool.active_workers() <= 4);

    let tasks = join(tasks);
    let elapsed = started.elapsed();

    for (index, task) in tasks.iter().enumerate() {
        assert_eq!(task.result(), Some(index));
    }

    // 40 tasks of 25 ms across 4 workers is at least 10 serial rounds.
    assert!(elapsed >= Duration::from_millis(250), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "finished too slow: {elapsed:?}");
    assert_eq!(pool.completed_tasks(), 40);
}

#[test]
fn overflow_is_dispatched_in_fifo_order() {
    let pool = IsolatedPool::builder().name("fifo").max(1).build();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the only worker so everything below overflows.
    let blocker = pool.execute(nap, 150).unwrap();

    let tasks: Vec<_> = (0..5)
        .map(|index| pool.execute(record, (order.clone(), index)).unwrap())
        .collect();

    join(tasks);
    blocker.wait().unwrap();

    assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3, 4]);
}

#[test]
fn non_core_workers_are_reaped() {
    let pool = IsolatedPool::builder()
        .name("reap")
        .max(2)
        .keep_active(Duration::from_millis(200))
        .build();

    let tasks: Vec<_> = (0..10)
        .map(|index| pool.execute(identity, index).unwrap())
        .collect();
    join(tasks);

    thread::sleep(Duration::from_millis(900));

    assert_eq!(pool.active_workers(), 0);

    // The next submission re-spawns from zero.
    assert_eq!(pool.execute(identity, 3).unwrap().wait().unwrap(), 3);
    assert!(pool.active_workers() >= 1);
}

#[test]
fn core_workers_survive_the_reaper() {
    let pool = IsolatedPool::builder()
        .name("core")
        .max(4)
        .core(2)
        .keep_active(Duration::from_millis(200))
        .build();

    let tasks: Vec<_> = (0..10)
        .map(|index| pool.execute(nap_and_return, (index, 20)).unwrap())
        .collect();
    join(tasks);

    thread::sleep(Duration::from_millis(900));

    assert_eq!(pool.active_workers(), 2);
}

#[test]
fn cancel_reaches_only_queued_tasks() {
    let pool = IsolatedPool::builder().name("cancel").max(1).build();

    let cancelled_seen = Arc::new(AtomicUsize::new(0));
    let completed_seen = Arc::new(AtomicUsize::new(0));

    let running = pool.execute(nap, 500).unwrap();
    let queued = pool.execute(nap, 10).unwrap();

    {
        let cancelled_seen = cancelled_seen.clone();
        queued.on_cancel(move || {
            cancelled_seen.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let completed_seen = completed_seen.clone();
        queued.when_complete(move || {
            completed_seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(queued.cancel(), "first cancel must win");
    assert!(!queued.cancel(), "second cancel must lose");
    assert!(!pool.cancel(queued.task_id()));

    assert!(queued.is_cancelled());
    assert!(matches!(queued.wait(), Err(TaskError::Cancelled)));
    assert_eq!(cancelled_seen.load(Ordering::SeqCst), 1);
    assert_eq!(completed_seen.load(Ordering::SeqCst), 1);

    // The running task is beyond cancellation and completes normally.
    assert!(!running.cancel());
    assert_eq!(running.wait().unwrap(), 500);
}

#[test]
fn failures_are_transported_to_the_handle() {
    let pool = IsolatedPool::builder().name("faulty").max(1).build();

    let error_seen = Arc::new(AtomicUsize::new(0));
    let completed_seen = Arc::new(AtomicUsize::new(0));

    let task = pool.execute(explode, ()).unwrap();

    {
        let error_seen = error_seen.clone();
        task.on_error(move |failure| {
            assert_eq!(failure.message(), "task exploded");
            error_seen.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let completed_seen = completed_seen.clone();
        task.when_complete(move || {
            completed_seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    let failure = match task.wait() {
        Err(TaskError::Failure(failure)) => failure,
        other => panic!("expected a failure, got {other:?}"),
    };

    assert!(task.is_error());
    assert!(!task.is_cancelled());
    assert_eq!(failure.message(), "task exploded");

    eventually(|| error_seen.load(Ordering::SeqCst) == 1);
    eventually(|| completed_seen.load(Ordering::SeqCst) == 1);

    // The worker survives the failure.
    assert_eq!(pool.execute(identity, 11).unwrap().wait().unwrap(), 11);
}

#[test]
fn future_entries_are_driven_on_the_worker() {
    fn delayed_square(n: u64) -> impl std::future::Future<Output = u64> {
        async move {
            Delay::new(Duration::from_millis(20)).await;
            n * n
        }
    }

    let pool = IsolatedPool::builder().name("async-entry").max(1).build();

    let task = pool.execute_future(delayed_square, 9).unwrap();

    assert_eq!(task.wait().unwrap(), 81);
}

#[test]
fn shutdown_rejects_and_cancels() {
    let pool = IsolatedPool::builder().name("closing").max(1).build();

    let running = pool.execute(nap, 200).unwrap();
    let queued = pool.execute(identity, 1).unwrap();

    pool.shutdown();

    assert!(pool.is_shut_down());
    assert!(matches!(
        pool.execute(identity, 2),
        Err(SubmitError::ShutDown)
    ));

    // The running task still settles; the queued one is cancelled.
    assert_eq!(running.wait().unwrap(), 200);
    assert!(matches!(queued.wait(), Err(TaskError::Cancelled)));

    // All workers are gone shortly after.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.active_workers(), 0);
}

#[test]
fn then_after_completion_fires_immediately() {
    let pool = IsolatedPool::builder().name("late").max(1).build();

    let task = pool.execute(identity, 5).unwrap();
    task.wait().unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();
    task.then(move |value| {
        assert_eq!(*value, 5);
        seen_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn join_waits_for_every_terminal_state() {
    let pool = IsolatedPool::builder().name("joiner").max(1).build();

    let running = pool.execute(nap_and_return, (0, 200)).unwrap();
    let queued = pool.execute(nap_and_return, (1, 10)).unwrap();

    assert!(queued.cancel());

    let started = Instant::now();
    let tasks = join(vec![running, queued]);

    // Join had to wait out the running task.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(tasks[0].result(), Some(0));
    assert!(tasks[1].is_cancelled());
}

#[test]
fn join_of_nothing_is_immediate() {
    let started = Instant::now();

    assert!(join(Vec::<isopod::CompletionHandle<usize>>::new()).is_empty());
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[test]
fn in_process_bound_is_respected() {
    let executor = InProcessExecutor::new(3);

    let current = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let tasks: Vec<_> = (0..9)
        .map(|_| {
            let current = current.clone();
            let high_water = high_water.clone();

            executor.execute(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);

                Delay::new(Duration::from_millis(50)).await;

                current.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    join(tasks);
    let elapsed = started.elapsed();

    assert_eq!(high_water.load(Ordering::SeqCst), 3);
    assert_eq!(executor.active_count(), 0);

    // 9 tasks of 50 ms with 3 slots is at least 3 serial rounds.
    assert!(elapsed >= Duration::from_millis(150), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "finished too slow: {elapsed:?}");
}

#[test]
fn in_process_queued_task_can_be_cancelled() {
    let executor = InProcessExecutor::new(1);

    let blocker = executor.execute(async {
        Delay::new(Duration::from_millis(200)).await;
        1
    });

    let entered = Arc::new(AtomicUsize::new(0));
    let entered_clone = entered.clone();
    let queued = executor.execute(async move {
        entered_clone.fetch_add(1, Ordering::SeqCst);
        2
    });

    assert!(queued.cancel());
    assert!(!queued.cancel());
    assert!(queued.is_cancelled());

    assert_eq!(blocker.wait().unwrap(), 1);
    thread::sleep(Duration::from_millis(50));

    // The cancelled future was never polled.
    assert_eq!(entered.load(Ordering::SeqCst), 0);
}

#[test]
fn in_process_running_task_cannot_be_cancelled() {
    let executor = InProcessExecutor::new(1);

    let task = executor.execute(async {
        Delay::new(Duration::from_millis(100)).await;
        7
    });

    thread::sleep(Duration::from_millis(20));

    assert!(!task.cancel());
    assert_eq!(task.wait().unwrap(), 7);
}

#[test]
fn execute_all_preserves_order() {
    let executor = InProcessExecutor::new(2);

    let tasks = executor.execute_all((0..6).map(|n| async move { n * 10 }));
    let tasks = join(tasks);

    let values: Vec<_> = tasks.iter().map(|task| task.result().unwrap()).collect();
    assert_eq!(values, [0, 10, 20, 30, 40, 50]);
}

#[test]
fn default_pool_and_executor_round_trip() {
    assert_eq!(
        isopod::submit_isolated(identity, 5).unwrap().wait().unwrap(),
        5
    );
    assert_eq!(isopod::submit_in_process(async { 9 }).wait().unwrap(), 9);

    // The defaults exist now, so configuring them is an error.
    assert!(isopod::configure_default_pool(|builder| builder).is_err());
    assert!(isopod::configure_default_executor(4).is_err());
}

#[test]
fn handles_are_cloneable_and_agree() {
    let pool = IsolatedPool::builder().name("clones").max(1).build();

    let task = pool.execute(nap, 50).unwrap();
    let twin = task.clone();

    assert_eq!(task.task_id(), twin.task_id());
    assert_eq!(task.wait().unwrap(), 50);
    assert!(twin.is_complete());
    assert_eq!(twin.result(), Some(50));
}

#[test]
fn handle_can_be_awaited() {
    let pool = IsolatedPool::builder().name("awaited").max(1).build();
    let executor = InProcessExecutor::new(1);

    let task = pool.execute(nap, 30).unwrap();
    let relayed = executor.execute(async move { task.await.unwrap() });

    assert_eq!(relayed.wait().unwrap(), 30);
}
