//! 可重入的任务互斥锁

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::condvar::reacquired;
use super::{deadline_after, wait_outcome};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ExecutionId, ParkMode, WaitList, WakeReason};

#[derive(Debug, Default)]
struct RecursiveState {
    owner: Option<ExecutionId>,
    depth: usize,
    waiters: WaitList,
}

/// 可重入的任务互斥锁
///
/// 同一执行体可以多次加锁，需要同样次数的解锁。
/// `relock_begin`/`relock_end` 一次性释放并恢复全部重入深度，供条件变量使用。
#[derive(Debug, Default)]
pub struct TaskRecursiveMutex {
    state: Mutex<RecursiveState>,
}

impl TaskRecursiveMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> Result<(), TaskError> {
        self.acquire(ParkMode::interruptible(None), 1).map(|_| ())
    }

    pub fn try_lock(&self) -> bool {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        match st.owner {
            Some(owner) if owner == me => {
                st.depth += 1;
                true
            }
            None if st.waiters.is_empty() => {
                st.owner = Some(me);
                st.depth = 1;
                true
            }
            _ => false,
        }
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.try_lock_until(deadline_after(timeout))
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire(ParkMode::interruptible(Some(deadline)), 1)
    }

    pub fn lock_guard(&self) -> Result<TaskRecursiveMutexGuard<'_>, TaskError> {
        self.lock()?;
        Ok(TaskRecursiveMutexGuard { mutex: self })
    }

    /// 取得锁并把重入深度设为 `depth`
    fn acquire(&self, mode: ParkMode<'_>, depth: usize) -> Result<bool, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        match st.owner {
            Some(owner) if owner == me => {
                st.depth += depth;
                return Ok(true);
            }
            None => {
                st.owner = Some(me);
                st.depth = depth;
                return Ok(true);
            }
            Some(_) => {}
        }

        let wakeup = park_current(mode, move |parker| {
            let mut st = st;
            st.waiters.push(parker);
        });
        if wakeup.reason == WakeReason::Signaled {
            // 交接时深度为 1
            self.state.lock().depth = depth;
        } else {
            self.state.lock().waiters.remove(wakeup.token);
        }
        wait_outcome(wakeup.reason)
    }

    pub fn unlock(&self) -> Result<(), TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        match st.owner {
            Some(owner) if owner == me => {
                st.depth -= 1;
                if st.depth == 0 {
                    Self::hand_over(&mut st);
                }
                Ok(())
            }
            Some(_) => Err(TaskError::invalid_lock("recursive mutex is held by another execution")),
            None => Err(TaskError::invalid_lock("unlock of an unheld recursive mutex")),
        }
    }

    fn hand_over(st: &mut RecursiveState) {
        st.owner = st.waiters.wake_one(WakeReason::Signaled);
        st.depth = usize::from(st.owner.is_some());
    }

    /// 完全释放锁，返回释放前的重入深度
    pub fn relock_begin(&self) -> Result<usize, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.owner != Some(me) {
            return Err(TaskError::invalid_lock("relock of a recursive mutex not held by the caller"));
        }
        let depth = st.depth;
        Self::hand_over(&mut st);
        Ok(depth)
    }

    /// 重新取得锁并恢复重入深度，等待不可被打断
    pub fn relock_end(&self, depth: usize) -> Result<(), TaskError> {
        reacquired(self.acquire(ParkMode::uninterruptible(), depth.max(1)))
    }

    pub fn is_own(&self) -> bool {
        self.state.lock().owner == Some(ExecutionId::current())
    }

    /// 调用者持有时的重入深度，否则为 0
    pub fn depth(&self) -> usize {
        let st = self.state.lock();
        if st.owner == Some(ExecutionId::current()) {
            st.depth
        } else {
            0
        }
    }
}

/// `TaskRecursiveMutex` 的守卫，离开作用域时解锁一层
#[must_use = "if unused the mutex will immediately unlock"]
pub struct TaskRecursiveMutexGuard<'a> {
    mutex: &'a TaskRecursiveMutex,
}

impl Drop for TaskRecursiveMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            tracing::warn!(%err, "recursive mutex guard dropped by a non-owner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reentrant_locking() {
        let m = TaskRecursiveMutex::new();
        m.lock().unwrap();
        m.lock().unwrap();
        assert!(m.try_lock());
        assert_eq!(m.depth(), 3);
        m.unlock().unwrap();
        m.unlock().unwrap();
        assert!(m.is_own());
        m.unlock().unwrap();
        assert!(!m.is_own());
        assert!(matches!(m.unlock(), Err(TaskError::InvalidLock(_))));
    }

    #[test]
    fn test_relock_restores_depth() {
        let m = Arc::new(TaskRecursiveMutex::new());
        m.lock().unwrap();
        m.lock().unwrap();
        let depth = m.relock_begin().unwrap();
        assert_eq!(depth, 2);
        assert!(!m.is_own());

        let m2 = Arc::clone(&m);
        thread::spawn(move || {
            let _g = m2.lock_guard().unwrap();
        })
        .join()
        .unwrap();

        m.relock_end(depth).unwrap();
        assert_eq!(m.depth(), 2);
        m.unlock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn test_waiter_gets_lock_after_full_release() {
        let m = Arc::new(TaskRecursiveMutex::new());
        m.lock().unwrap();
        m.lock().unwrap();
        let m2 = Arc::clone(&m);
        let waiter = thread::spawn(move || {
            m2.lock().unwrap();
            let depth = m2.depth();
            m2.unlock().unwrap();
            depth
        });
        while m.state.lock().waiters.is_empty() {
            thread::yield_now();
        }
        m.unlock().unwrap();
        assert!(m.is_own());
        m.unlock().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
