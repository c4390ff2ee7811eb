//! 任务感知的同步原语
//!
//! 在任务里等待只挂起任务本身，工作线程继续执行其他任务；
//! 在普通线程里等待则阻塞该线程。所有原语按 FIFO 顺序唤醒等待者，
//! 释放时把所有权直接交给被唤醒的等待者，不会被后来者插队。
//!
//! 等待可以被取消和任务超时打断，此时返回对应的 `TaskError`；
//! 带期限的等待到期时返回 `Ok(false)`。

mod condvar;
mod limiter;
mod mutex;
mod recursive_mutex;
mod rw_mutex;
mod semaphore;

pub use condvar::{TaskCondvar, WaitLock};
pub use limiter::TaskLimiter;
pub use mutex::{TaskMutex, TaskMutexGuard};
pub use recursive_mutex::{TaskRecursiveMutex, TaskRecursiveMutexGuard};
pub use rw_mutex::{TaskRwMutex, TaskRwReadGuard, TaskRwWriteGuard};
pub use semaphore::{TaskSemaphore, TaskSemaphoreGuard};

use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::runtime::park::WakeReason;

/// 把唤醒原因转成带期限等待的结果
fn wait_outcome(reason: WakeReason) -> Result<bool, TaskError> {
    match reason {
        WakeReason::Signaled => Ok(true),
        WakeReason::Deadline => Ok(false),
        other => match other.interrupt() {
            Some(err) => Err(err),
            None => Ok(false),
        },
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}
