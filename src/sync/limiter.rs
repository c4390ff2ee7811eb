//! 并发限制器
//!
//! 和信号量一样限制同时持有许可的数量，但记住每个许可的持有者，
//! 重复加锁、非持有者解锁都会返回 `InvalidLock`。

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{deadline_after, wait_outcome};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ExecutionId, ParkMode, WaitList, WakeReason};

#[derive(Debug, Default)]
struct LimiterState {
    holders: Vec<ExecutionId>,
    waiters: WaitList,
}

/// 并发限制器
#[derive(Debug)]
pub struct TaskLimiter {
    limit: usize,
    state: Mutex<LimiterState>,
}

impl TaskLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(LimiterState::default()),
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn lock(&self) -> Result<(), TaskError> {
        self.acquire(None).map(|_| ())
    }

    pub fn try_lock(&self) -> Result<bool, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.holders.contains(&me) {
            return Err(TaskError::invalid_lock("limiter is already held by the caller"));
        }
        if st.holders.len() < self.limit && st.waiters.is_empty() {
            st.holders.push(me);
            return Ok(true);
        }
        Ok(false)
    }

    /// 最多等待 `timeout`，到期返回 `Ok(false)`
    pub fn lock_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.acquire(Some(deadline_after(timeout)))
    }

    pub fn lock_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire(Some(deadline))
    }

    fn acquire(&self, deadline: Option<Instant>) -> Result<bool, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.holders.contains(&me) {
            return Err(TaskError::invalid_lock("limiter is already held by the caller"));
        }
        if st.holders.len() < self.limit && st.waiters.is_empty() {
            st.holders.push(me);
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

    /// 释放调用者持有的许可
    pub fn unlock(&self) -> Result<(), TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        let Some(pos) = st.holders.iter().position(|h| *h == me) else {
            return Err(TaskError::invalid_lock("limiter unlocked by a non-holder"));
        };
        st.holders.swap_remove(pos);
        if let Some(next) = st.waiters.wake_one(WakeReason::Signaled) {
            st.holders.push(next);
        }
        Ok(())
    }

    /// 当前持有者
    pub fn holders(&self) -> Vec<ExecutionId> {
        self.state.lock().holders.clone()
    }

    /// 调用者是否持有许可
    pub fn is_held(&self) -> bool {
        self.state.lock().holders.contains(&ExecutionId::current())
    }
}
