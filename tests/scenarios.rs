mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{scheduler, scheduler_with, wait_until};
use fibra::config::{BOUND_THREAD_PREFIX, WORKER_THREAD_PREFIX};
use fibra::event::{subscriber, unhandled_exceptions};
use fibra::{
    await_results, callable, this_task, DispatchMode, Priority, SchedulerConfig, Task, TaskError, TaskLimiter,
    TaskMutex, TaskSemaphore, TaskState, Value,
};

fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_string()
}

#[test]
fn ten_thousand_tasks_share_a_counter() {
    let sched = scheduler_with(SchedulerConfig {
        num_workers: 4,
        max_running_tasks: 256,
        ..SchedulerConfig::default()
    });
    let mutex = Arc::new(TaskMutex::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10_000)
        .map(|_| {
            let (mutex, counter) = (Arc::clone(&mutex), Arc::clone(&counter));
            Task::builder(callable(move |_| {
                mutex.lock()?;
                // 非原子的读改写，只有互斥才能保证结果正确
                let n = counter.load(Ordering::Relaxed);
                counter.store(n + 1, Ordering::Relaxed);
                mutex.unlock()?;
                Ok(None)
            }))
            .scheduler(&sched)
            .spawn()
            .unwrap()
        })
        .collect();

    let results = await_results(&handles, false).unwrap();
    assert!(results.iter().all(|r| *r == Ok(None)));
    assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    assert!(!mutex.is_locked());
    sched.shutdown().unwrap();
}

#[test]
fn cancel_while_parked_on_empty_semaphore() {
    let sched = scheduler(2);
    let sem = Arc::new(TaskSemaphore::new(0));
    let granted = Arc::new(AtomicBool::new(false));

    let task = {
        let (sem, granted) = (Arc::clone(&sem), Arc::clone(&granted));
        Task::builder(callable(move |_| {
            sem.acquire()?;
            granted.store(true, Ordering::SeqCst);
            Ok(None)
        }))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };

    wait_until("task parked", || sem.waiting() == 1);
    task.notify_cancel();

    assert_eq!(task.get_result(), Err(TaskError::Cancelled));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(!granted.load(Ordering::SeqCst));
    assert_eq!(sem.waiting(), 0);

    // 许可没有被消耗
    sem.release();
    assert_eq!(sem.available_permits(), 1);
    sched.shutdown().unwrap();
}

#[test]
fn task_timeout_while_waiting_on_held_mutex() {
    let sched = scheduler(2);
    let mutex = Arc::new(TaskMutex::new());
    mutex.lock().unwrap();

    let start = Instant::now();
    let task = {
        let mutex = Arc::clone(&mutex);
        Task::builder(callable(move |_| {
            mutex.lock()?;
            mutex.unlock()?;
            Ok(Some(Value::Bool(true)))
        }))
        .timeout(Duration::from_millis(50))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };

    assert_eq!(task.get_result(), Err(TaskError::TimedOut));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "woke after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "woke after {:?}", elapsed);
    assert_eq!(task.state(), TaskState::TimedOut);

    // 超时的等待者已离开队列，锁仍由本线程持有
    assert!(mutex.is_own());
    mutex.unlock().unwrap();
    assert!(!mutex.is_locked());
    sched.shutdown().unwrap();
}

#[test]
fn limiter_bounds_concurrency() {
    let sched = scheduler(4);
    let limiter = Arc::new(TaskLimiter::new(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..30)
        .map(|_| {
            let (limiter, active, peak) = (Arc::clone(&limiter), Arc::clone(&active), Arc::clone(&peak));
            Task::builder(callable(move |_| {
                limiter.lock()?;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                this_task::sleep(Duration::from_millis(2))?;
                active.fetch_sub(1, Ordering::SeqCst);
                limiter.unlock()?;
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
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(limiter.holders().is_empty());
    sched.shutdown().unwrap();
}

#[test]
fn unhandled_failure_reaches_fallback_channel() {
    let sched = scheduler(1);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sub = {
        let seen = Arc::clone(&seen);
        subscriber(move |v| {
            if let Some(TaskError::Thrown(Value::Str(s))) = v.as_exception() {
                if &**s == "lost-failure" {
                    seen.lock().push(s.to_string());
                }
            }
            Ok(false)
        })
    };
    unhandled_exceptions().join(Priority::High, DispatchMode::Sync, Arc::clone(&sub));

    let task = Task::builder(callable(|_| Err(TaskError::Thrown(Value::str("lost-failure")))))
        .scheduler(&sched)
        .spawn()
        .unwrap();
    wait_until("task finished", || task.is_finished());
    wait_until("fallback notified", || !seen.lock().is_empty());

    unhandled_exceptions().leave(Priority::High, DispatchMode::Sync, &sub);
    assert_eq!(*seen.lock(), vec!["lost-failure".to_string()]);
    sched.shutdown().unwrap();
}

#[cfg(target_os = "linux")]
fn burn_stack(depth: usize) -> u64 {
    let frame = std::hint::black_box([depth as u8; 1024]);
    if depth == 0 {
        return u64::from(frame[0]);
    }
    burn_stack(depth - 1) + u64::from(std::hint::black_box(frame[depth % frame.len()]))
}

#[cfg(target_os = "linux")]
#[test]
fn runaway_recursion_ends_only_the_task() {
    let sched = scheduler(2);
    let task = Task::builder(callable(|_| Ok(Some(Value::Int(burn_stack(8 * 1024) as i64)))))
        .stack_size(64 * 1024)
        .scheduler(&sched)
        .spawn()
        .unwrap();
    assert_eq!(task.get_result(), Err(TaskError::StackOverflow));
    assert_eq!(task.state(), TaskState::Finished);

    // 栈回到池中后可以正常复用
    let next = Task::builder(callable(|_| Ok(Some(Value::Int(burn_stack(16) as i64)))))
        .stack_size(64 * 1024)
        .scheduler(&sched)
        .spawn()
        .unwrap();
    assert!(matches!(next.get_result(), Ok(Some(Value::Int(_)))));
    wait_until("stacks returned", || sched.stats().stacks.outstanding == 0);
    sched.shutdown().unwrap();
}

#[test]
fn full_planned_queue_suspends_the_starter() {
    let sched = scheduler_with(SchedulerConfig {
        num_workers: 1,
        max_planned_tasks: 1,
        ..SchedulerConfig::default()
    });
    let gate = Arc::new(AtomicBool::new(false));
    let blocker = {
        let gate = Arc::clone(&gate);
        Task::builder(callable(move |_| {
            while !gate.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            Ok(None)
        }))
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };
    wait_until("blocker running", || blocker.state() == TaskState::Running);

    let queued = Task::builder(callable(|_| Ok(None))).scheduler(&sched).spawn().unwrap();
    assert_eq!(sched.stats().planned, 1);

    let late = Task::builder(callable(|_| Ok(Some(Value::Int(3))))).scheduler(&sched).build();
    let started = Arc::new(AtomicBool::new(false));
    let starter = {
        let (late, started) = (late.clone(), Arc::clone(&started));
        std::thread::spawn(move || {
            late.start().unwrap();
            started.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!started.load(Ordering::SeqCst));
    assert_eq!(late.state(), TaskState::Created);

    gate.store(true, Ordering::Release);
    starter.join().unwrap();
    assert!(started.load(Ordering::SeqCst));
    queued.await_task().unwrap();
    assert_eq!(late.get_result(), Ok(Some(Value::Int(3))));
    sched.shutdown().unwrap();
}

#[test]
fn running_limit_bounds_started_tasks() {
    let sched = scheduler_with(SchedulerConfig {
        num_workers: 4,
        max_running_tasks: 2,
        ..SchedulerConfig::default()
    });
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
            Task::builder(callable(move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // 挂起中的任务仍占用运行名额
                this_task::sleep(Duration::from_millis(5))?;
                active.fetch_sub(1, Ordering::SeqCst);
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
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    wait_until("running count to drain", || sched.stats().running == 0);
    sched.shutdown().unwrap();
}

#[test]
fn implicit_start_inherits_bind_only_executor() {
    let sched = scheduler(2);
    let inheriting = sched.create_bind_only_executor(1, true).unwrap();
    let isolated = sched.create_bind_only_executor(1, false).unwrap();

    let spawn_child_from = |executor| {
        let inner = Arc::clone(&sched);
        let parent = Task::builder(callable(move |_| {
            let child = Task::builder(callable(|_| Ok(Some(Value::str(&thread_name())))))
                .scheduler(&inner)
                .spawn()?;
            child.get_result()
        }))
        .scheduler(&sched)
        .build();
        parent.start_on(executor).unwrap();
        match parent.get_result() {
            Ok(Some(Value::Str(name))) => name.to_string(),
            other => panic!("unexpected result {:?}", other),
        }
    };

    assert_eq!(
        spawn_child_from(inheriting),
        format!("{}-{}-0", BOUND_THREAD_PREFIX, inheriting)
    );
    assert!(spawn_child_from(isolated).starts_with(WORKER_THREAD_PREFIX));
    sched.shutdown().unwrap();
}

#[test]
fn auto_bound_task_stays_on_its_first_worker() {
    let sched = scheduler(4);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let task = {
        let seen = Arc::clone(&seen);
        Task::builder(callable(move |_| {
            for _ in 0..20 {
                seen.lock().push(thread_name());
                this_task::yield_now()?;
            }
            Ok(None)
        }))
        .auto_bind_worker()
        .scheduler(&sched)
        .spawn()
        .unwrap()
    };
    task.await_task().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert!(seen[0].starts_with(WORKER_THREAD_PREFIX));
    assert!(seen.iter().all(|name| *name == seen[0]), "moved between workers: {:?}", *seen);
    sched.shutdown().unwrap();
}
