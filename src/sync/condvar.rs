//! 任务条件变量

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{deadline_after, wait_outcome, TaskMutex, TaskRecursiveMutex};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ParkMode, WaitList, WakeReason};

/// 可以配合条件变量使用的锁
pub trait WaitLock {
    /// 完全释放调用者持有的锁，返回恢复时需要的状态
    fn release_for_wait(&self) -> Result<usize, TaskError>;

    /// 重新取得锁，等待不可被打断
    fn reacquire_after_wait(&self, saved: usize) -> Result<(), TaskError>;
}

impl WaitLock for TaskMutex {
    fn release_for_wait(&self) -> Result<usize, TaskError> {
        self.unlock().map(|_| 1)
    }

    fn reacquire_after_wait(&self, _saved: usize) -> Result<(), TaskError> {
        reacquired(self.acquire(ParkMode::uninterruptible()))
    }
}

impl WaitLock for TaskRecursiveMutex {
    fn release_for_wait(&self) -> Result<usize, TaskError> {
        self.relock_begin()
    }

    fn reacquire_after_wait(&self, saved: usize) -> Result<(), TaskError> {
        self.relock_end(saved)
    }
}

/// 不可打断的重新加锁只应以 `Ok(true)` 结束
pub(super) fn reacquired(outcome: Result<bool, TaskError>) -> Result<(), TaskError> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::error!("lock was not reacquired after a wait");
            Err(TaskError::invalid_lock("lock was not reacquired after a wait"))
        }
        Err(err) => {
            tracing::error!(%err, "failed to reacquire lock after a wait");
            Err(err)
        }
    }
}

/// 任务条件变量
///
/// `wait` 原子地释放锁并挂起；被唤醒、到期或被打断后都会先重新取得锁再返回。
#[derive(Debug, Default)]
pub struct TaskCondvar {
    waiters: Mutex<WaitList>,
}

impl TaskCondvar {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待通知
    pub fn wait<L: WaitLock + ?Sized>(&self, lock: &L) -> Result<(), TaskError> {
        self.wait_inner(lock, None).map(|_| ())
    }

    /// 最多等待 `timeout`，到期返回 `Ok(false)`
    pub fn wait_for<L: WaitLock + ?Sized>(&self, lock: &L, timeout: Duration) -> Result<bool, TaskError> {
        self.wait_inner(lock, Some(deadline_after(timeout)))
    }

    pub fn wait_until<L: WaitLock + ?Sized>(&self, lock: &L, deadline: Instant) -> Result<bool, TaskError> {
        self.wait_inner(lock, Some(deadline))
    }

    /// 等到 `condition` 为假
    pub fn wait_while<L, F>(&self, lock: &L, mut condition: F) -> Result<(), TaskError>
    where
        L: WaitLock + ?Sized,
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(lock)?;
        }
        Ok(())
    }

    fn wait_inner<L: WaitLock + ?Sized>(&self, lock: &L, deadline: Option<Instant>) -> Result<bool, TaskError> {
        let waiters = self.waiters.lock();
        // 持有等待队列的锁时释放互斥锁，通知者无法在登记之前发出通知
        let saved = lock.release_for_wait()?;
        let wakeup = park_current(ParkMode::interruptible(deadline), move |parker| {
            let mut waiters = waiters;
            waiters.push(parker);
        });
        if wakeup.reason != WakeReason::Signaled {
            self.waiters.lock().remove(wakeup.token);
        }
        lock.reacquire_after_wait(saved)?;
        wait_outcome(wakeup.reason)
    }

    /// 唤醒一个等待者
    pub fn notify_one(&self) -> bool {
        self.waiters.lock().wake_one(WakeReason::Signaled).is_some()
    }

    /// 唤醒全部等待者，返回唤醒的数量
    pub fn notify_all(&self) -> usize {
        self.waiters.lock().wake_all(WakeReason::Signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_requires_held_lock() {
        let m = TaskMutex::new();
        let cv = TaskCondvar::new();
        assert!(matches!(cv.wait(&m), Err(TaskError::InvalidLock(_))));
    }

    #[test]
    fn test_reacquire_by_current_owner_is_reported() {
        let m = TaskMutex::new();
        m.lock().unwrap();
        assert!(matches!(m.reacquire_after_wait(1), Err(TaskError::InvalidLock(_))));
        assert!(m.is_own());
        m.unlock().unwrap();

        assert_eq!(m.reacquire_after_wait(1), Ok(()));
        assert!(m.is_own());
        m.unlock().unwrap();
    }

    #[test]
    fn test_wait_for_times_out_holding_lock() {
        let m = TaskMutex::new();
        let cv = TaskCondvar::new();
        m.lock().unwrap();
        assert_eq!(cv.wait_for(&m, Duration::from_millis(10)), Ok(false));
        assert!(m.is_own());
        m.unlock().unwrap();
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let pair = Arc::new((TaskMutex::new(), TaskCondvar::new(), AtomicBool::new(false)));
        let pair2 = Arc::clone(&pair);
        let waiter = thread::spawn(move || {
            let (m, cv, ready) = &*pair2;
            m.lock().unwrap();
            cv.wait_while(m, || !ready.load(Ordering::SeqCst)).unwrap();
            let own = m.is_own();
            m.unlock().unwrap();
            own
        });

        let (m, cv, ready) = &*pair;
        while cv.waiters.lock().is_empty() {
            thread::yield_now();
        }
        m.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
        assert!(cv.notify_one());
        m.unlock().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_recursive_mutex_depth_survives_wait() {
        let m = TaskRecursiveMutex::new();
        let cv = TaskCondvar::new();
        m.lock().unwrap();
        m.lock().unwrap();
        assert_eq!(cv.wait_for(&m, Duration::from_millis(5)), Ok(false));
        assert_eq!(m.depth(), 2);
        m.unlock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn test_notify_all_counts() {
        let cv = TaskCondvar::new();
        assert_eq!(cv.notify_all(), 0);
        assert!(!cv.notify_one());
    }
}
