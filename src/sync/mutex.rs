//! 任务互斥锁

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{deadline_after, wait_outcome};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ExecutionId, ParkMode, WaitList, WakeReason};

#[derive(Debug, Default)]
struct MutexState {
    owner: Option<ExecutionId>,
    waiters: WaitList,
}

/// 任务互斥锁
///
/// 持有者以执行体区分：任务按任务 ID，普通线程按线程 ID。
/// 同一执行体重复加锁、解锁未持有的锁都会返回 `InvalidLock`。
#[derive(Debug, Default)]
pub struct TaskMutex {
    state: Mutex<MutexState>,
}

impl TaskMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加锁，必要时挂起
    pub fn lock(&self) -> Result<(), TaskError> {
        self.acquire(ParkMode::interruptible(None)).map(|_| ())
    }

    /// 尝试加锁，不等待
    pub fn try_lock(&self) -> bool {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.owner.is_none() && st.waiters.is_empty() {
            st.owner = Some(me);
            true
        } else {
            false
        }
    }

    /// 最多等待 `timeout`，到期返回 `Ok(false)`
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.try_lock_until(deadline_after(timeout))
    }

    /// 最多等到 `deadline`
    pub fn try_lock_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire(ParkMode::interruptible(Some(deadline)))
    }

    /// 加锁并返回自动解锁的守卫
    pub fn lock_guard(&self) -> Result<TaskMutexGuard<'_>, TaskError> {
        self.lock()?;
        Ok(TaskMutexGuard { mutex: self })
    }

    pub(crate) fn acquire(&self, mode: ParkMode<'_>) -> Result<bool, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.owner == Some(me) {
            return Err(TaskError::invalid_lock("mutex is already held by the caller"));
        }
        if st.owner.is_none() {
            st.owner = Some(me);
            return Ok(true);
        }

        let wakeup = park_current(mode, move |parker| {
            let mut st = st;
            st.waiters.push(parker);
        });
        if wakeup.reason != WakeReason::Signaled {
            self.state.lock().waiters.remove(wakeup.token);
        }
        // 被唤醒时所有权已经转交给了调用者
        wait_outcome(wakeup.reason)
    }

    /// 解锁，把锁交给等待最久的执行体
    pub fn unlock(&self) -> Result<(), TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        match st.owner {
            Some(owner) if owner == me => {
                st.owner = st.waiters.wake_one(WakeReason::Signaled);
                Ok(())
            }
            Some(_) => Err(TaskError::invalid_lock("mutex is held by another execution")),
            None => Err(TaskError::invalid_lock("unlock of an unheld mutex")),
        }
    }

    /// 调用者是否持有这把锁
    pub fn is_own(&self) -> bool {
        self.state.lock().owner == Some(ExecutionId::current())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

/// `TaskMutex` 的守卫，离开作用域时解锁
#[must_use = "if unused the mutex will immediately unlock"]
pub struct TaskMutexGuard<'a> {
    mutex: &'a TaskMutex,
}

impl TaskMutexGuard<'_> {
    /// 守卫所属的锁
    pub fn mutex(&self) -> &TaskMutex {
        self.mutex
    }
}

impl Drop for TaskMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            tracing::warn!(%err, "mutex guard dropped by a non-owner");
        }
    }
}
