//! 任务信号量

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{deadline_after, wait_outcome};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ParkMode, WaitList, WakeReason};

#[derive(Debug, Default)]
struct SemaphoreState {
    permits: usize,
    waiters: WaitList,
}

/// 计数信号量
///
/// 释放时有等待者就把许可直接交给等待最久的那个，否则归还计数。
#[derive(Debug)]
pub struct TaskSemaphore {
    state: Mutex<SemaphoreState>,
}

impl TaskSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                waiters: WaitList::new(),
            }),
        }
    }

    /// 取得一个许可，必要时挂起
    pub fn acquire(&self) -> Result<(), TaskError> {
        self.acquire_inner(None).map(|_| ())
    }

    /// 最多等待 `timeout`，到期返回 `Ok(false)`
    pub fn acquire_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.acquire_inner(Some(deadline_after(timeout)))
    }

    pub fn acquire_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire_inner(Some(deadline))
    }

    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock();
        if st.permits > 0 && st.waiters.is_empty() {
            st.permits -= 1;
            true
        } else {
            false
        }
    }

    /// 取得许可并返回自动释放的守卫
    pub fn acquire_guard(&self) -> Result<TaskSemaphoreGuard<'_>, TaskError> {
        self.acquire()?;
        Ok(TaskSemaphoreGuard { semaphore: self })
    }

    fn acquire_inner(&self, deadline: Option<Instant>) -> Result<bool, TaskError> {
        let mut st = self.state.lock();
        if st.permits > 0 && st.waiters.is_empty() {
            st.permits -= 1;
            return Ok(true);
        }
        let wakeup = park_current(ParkMode::interruptible(deadline), move |parker| {
            let mut st = st;
            st.waiters.push(parker);
        });
        if wakeup.reason != WakeReason::Signaled {
            self.state.lock().waiters.remove(wakeup.token);
        }
        wait_outcome(wakeup.reason)
    }

    /// 释放一个许可
    pub fn release(&self) {
        let mut st = self.state.lock();
        if st.waiters.wake_one(WakeReason::Signaled).is_none() {
            st.permits += 1;
        }
    }

    /// 当前可用的许可数
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// 正在等待的执行体数量
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// `TaskSemaphore` 的守卫，离开作用域时释放许可
#[must_use = "if unused the permit will immediately be released"]
pub struct TaskSemaphoreGuard<'a> {
    semaphore: &'a TaskSemaphore,
}

impl Drop for TaskSemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counting() {
        let sem = TaskSemaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available_permits(), 0);
        sem.release();
        assert_eq!(sem.available_permits(), 1);
        {
            let _g = sem.acquire_guard().unwrap();
            assert_eq!(sem.available_permits(), 0);
        }
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_acquire_for_times_out() {
        let sem = TaskSemaphore::new(0);
        assert_eq!(sem.acquire_for(Duration::from_millis(10)), Ok(false));
        assert_eq!(sem.waiting(), 0);
    }

    #[test]
    fn test_release_hands_permit_to_waiter() {
        let sem = Arc::new(TaskSemaphore::new(0));
        let s2 = Arc::clone(&sem);
        let waiter = thread::spawn(move || s2.acquire());
        while sem.waiting() == 0 {
            thread::yield_now();
        }
        sem.release();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(sem.available_permits(), 0);
    }
}
