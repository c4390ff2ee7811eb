mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{scheduler, wait_until};
use fibra::runtime::{StackAllocator, StackConfig, NEVER_POOL};
use fibra::{await_results, callable, this_task, Task, TaskError, TaskMutex, TaskRwMutex, TaskSemaphore, TaskState, Value};

#[test]
fn mutual_exclusion_under_contention() {
    let sched = scheduler(4);
    let mutex = Arc::new(TaskMutex::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let (mutex, inside, violations) = (Arc::clone(&mutex), Arc::clone(&inside), Arc::clone(&violations));
            Task::builder(callable(move |_| {
                for _ in 0..10 {
                    mutex.lock()?;
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    this_task::yield_now()?;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    mutex.unlock()?;
                }
                Ok(None)
            }))
            .scheduler(&sched)
            .spawn()
            .unwrap()
        })
        .collect();

    for r in await_results(&handles, false).unwrap() {
        assert_eq!(r, Ok(None));
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(!mutex.is_locked());
    sched.shutdown().unwrap();
}

#[test]
fn waiters_resume_in_arrival_order() {
    let sched = scheduler(2);
    let sem = Arc::new(TaskSemaphore::new(0));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let spawn = |tag: &'static str| {
        let (sem, order) = (Arc::clone(&sem), Arc::clone(&order));
        Task::builder(callable(move |_| {
            sem.acquire()?;
            order.lock().push(tag);
            Ok(None)
        }))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };

    let a = spawn("a");
    wait_until("first waiter", || sem.waiting() == 1);
    let b = spawn("b");
    wait_until("second waiter", || sem.waiting() == 2);

    sem.release();
    wait_until("first grant", || order.lock().len() == 1);
    sem.release();
    a.await_task().unwrap();
    b.await_task().unwrap();
    assert_eq!(*order.lock(), vec!["a", "b"]);
    sched.shutdown().unwrap();
}

#[test]
fn sleeping_tasks_do_not_occupy_workers() {
    let sched = scheduler(2);
    let start = Instant::now();
    let handles: Vec<_> = (0..200)
        .map(|_| {
            Task::builder(callable(|_| {
                this_task::sleep(Duration::from_millis(100))?;
                Ok(None)
            }))
            .scheduler(&sched)
            .spawn()
            .unwrap()
        })
        .collect();
    fibra::runtime::await_multiple(&handles, false).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    // 200 个任务串行睡眠需要 20 秒
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    sched.shutdown().unwrap();
}

#[test]
fn await_results_keeps_input_order() {
    let sched = scheduler(3);
    let delayed = |ms: u64, v: i64| {
        Task::builder(callable(move |_| {
            this_task::sleep(Duration::from_millis(ms))?;
            Ok(Some(Value::Int(v)))
        }))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };
    let t1 = delayed(300, 1);
    let t2 = delayed(0, 2);
    let t3 = delayed(40, 3);

    t2.await_task().unwrap();
    assert!(!t1.is_finished());

    let results = await_results(&[t1, t2, t3], false).unwrap();
    assert_eq!(
        results,
        vec![Ok(Some(Value::Int(1))), Ok(Some(Value::Int(2))), Ok(Some(Value::Int(3)))]
    );
    sched.shutdown().unwrap();
}

#[test]
fn cancellation_waits_for_a_suspension_point() {
    let sched = scheduler(2);
    let started = Arc::new(AtomicBool::new(false));
    let go = Arc::new(AtomicBool::new(false));
    let reached_check = Arc::new(AtomicBool::new(false));
    let passed_check = Arc::new(AtomicBool::new(false));

    let task = {
        let (started, go, reached, passed) = (
            Arc::clone(&started),
            Arc::clone(&go),
            Arc::clone(&reached_check),
            Arc::clone(&passed_check),
        );
        Task::builder(callable(move |_| {
            started.store(true, Ordering::SeqCst);
            while !go.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            reached.store(true, Ordering::SeqCst);
            this_task::check_cancellation()?;
            passed.store(true, Ordering::SeqCst);
            Ok(None)
        }))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };

    wait_until("task start", || started.load(Ordering::SeqCst));
    task.notify_cancel();
    assert_eq!(task.state(), TaskState::Running);
    go.store(true, Ordering::SeqCst);

    assert_eq!(task.get_result(), Err(TaskError::Cancelled));
    assert!(reached_check.load(Ordering::SeqCst));
    assert!(!passed_check.load(Ordering::SeqCst));
    assert_eq!(task.state(), TaskState::Cancelled);
    sched.shutdown().unwrap();
}

#[test]
fn stack_pool_round_trip() {
    let stacks = StackAllocator::new(&StackConfig::default());
    let first = stacks.allocate(64 * 1024).unwrap();
    let base = first.base();
    stacks.deallocate(first);
    let again = stacks.allocate(64 * 1024).unwrap();
    assert_eq!(again.base(), base);
    assert_eq!(stacks.stats().reused, 1);

    stacks.set_max_buffer_size(NEVER_POOL);
    stacks.deallocate(again);
    assert_eq!(stacks.stats().pooled, 0);
    let fresh = stacks.allocate(64 * 1024).unwrap();
    assert_eq!(stacks.stats().reused, 1);
    assert_eq!(stacks.stats().fresh, 2);
    stacks.deallocate(fresh);
}

#[test]
fn writer_never_overlaps_readers() {
    let sched = scheduler(4);
    let lock = Arc::new(TaskRwMutex::new());
    let readers = Arc::new(AtomicUsize::new(0));
    let writing = Arc::new(AtomicBool::new(false));
    let max_readers = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let (lock, readers, writing, max_readers, violations) = (
                Arc::clone(&lock),
                Arc::clone(&readers),
                Arc::clone(&writing),
                Arc::clone(&max_readers),
                Arc::clone(&violations),
            );
            Task::builder(callable(move |_| {
                for _ in 0..5 {
                    if i % 5 == 0 {
                        lock.lock()?;
                        writing.store(true, Ordering::SeqCst);
                        if readers.load(Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        this_task::yield_now()?;
                        writing.store(false, Ordering::SeqCst);
                        lock.unlock()?;
                    } else {
                        lock.lock_shared()?;
                        let now = readers.fetch_add(1, Ordering::SeqCst) + 1;
                        max_readers.fetch_max(now, Ordering::SeqCst);
                        if writing.load(Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        this_task::yield_now()?;
                        readers.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock_shared()?;
                    }
                }
                Ok(None)
            }))
            .scheduler(&sched)
            .spawn()
            .unwrap()
        })
        .collect();

    for r in await_results(&handles, false).unwrap() {
        assert_eq!(r, Ok(None));
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(max_readers.load(Ordering::SeqCst) >= 1);
    assert_eq!(lock.reader_count(), 0);
    assert!(!lock.is_write_locked());
    sched.shutdown().unwrap();
}
