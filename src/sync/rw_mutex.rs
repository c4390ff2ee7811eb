//! 任务读写锁
//!
//! 写者优先、按批次 FIFO：
//! - 没有排队者时读者直接进入；一旦有写者在排队，新来的读者排在它后面
//! - 锁空出来时按队列顺序放行：队首是写者就只放行这个写者，
//!   队首是读者就放行从队首开始连续的所有读者

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{deadline_after, wait_outcome};
use crate::error::TaskError;
use crate::runtime::park::{park_current, ExecutionId, ParkMode, ParkToken, Parker, WakeReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug)]
struct RwWaiter {
    access: Access,
    parker: Parker,
}

#[derive(Debug, Default)]
struct RwState {
    /// 当前读者（同一执行体可多次出现）
    readers: Vec<ExecutionId>,
    writer: Option<ExecutionId>,
    queue: VecDeque<RwWaiter>,
}

impl RwState {
    /// 按队列顺序放行等待者
    fn dispatch(&mut self) {
        if self.writer.is_some() {
            return;
        }
        while let Some(front) = self.queue.front() {
            match front.access {
                Access::Write => {
                    if !self.readers.is_empty() {
                        return;
                    }
                    let Some(waiter) = self.queue.pop_front() else {
                        return;
                    };
                    if waiter.parker.wake(WakeReason::Signaled) {
                        self.writer = Some(waiter.parker.id());
                        return;
                    }
                }
                Access::Read => {
                    let Some(waiter) = self.queue.pop_front() else {
                        return;
                    };
                    if waiter.parker.wake(WakeReason::Signaled) {
                        self.readers.push(waiter.parker.id());
                    }
                }
            }
        }
    }

    fn remove(&mut self, token: ParkToken) {
        self.queue.retain(|w| w.parker.token() != token);
    }
}

/// 任务读写锁：任意多个读者，或者一个写者
#[derive(Debug, Default)]
pub struct TaskRwMutex {
    state: Mutex<RwState>,
}

impl TaskRwMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 共享加锁
    pub fn lock_shared(&self) -> Result<(), TaskError> {
        self.acquire(Access::Read, None).map(|_| ())
    }

    pub fn try_lock_shared(&self) -> bool {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.writer.is_none() && st.queue.is_empty() {
            st.readers.push(me);
            true
        } else {
            false
        }
    }

    pub fn lock_shared_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.acquire(Access::Read, Some(deadline_after(timeout)))
    }

    pub fn lock_shared_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire(Access::Read, Some(deadline))
    }

    /// 独占加锁
    pub fn lock(&self) -> Result<(), TaskError> {
        self.acquire(Access::Write, None).map(|_| ())
    }

    pub fn try_lock(&self) -> bool {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.writer.is_none() && st.readers.is_empty() && st.queue.is_empty() {
            st.writer = Some(me);
            true
        } else {
            false
        }
    }

    pub fn lock_for(&self, timeout: Duration) -> Result<bool, TaskError> {
        self.acquire(Access::Write, Some(deadline_after(timeout)))
    }

    pub fn lock_until(&self, deadline: Instant) -> Result<bool, TaskError> {
        self.acquire(Access::Write, Some(deadline))
    }

    pub fn read_guard(&self) -> Result<TaskRwReadGuard<'_>, TaskError> {
        self.lock_shared()?;
        Ok(TaskRwReadGuard { lock: self })
    }

    pub fn write_guard(&self) -> Result<TaskRwWriteGuard<'_>, TaskError> {
        self.lock()?;
        Ok(TaskRwWriteGuard { lock: self })
    }

    fn acquire(&self, access: Access, deadline: Option<Instant>) -> Result<bool, TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        if st.writer == Some(me) {
            return Err(TaskError::invalid_lock("rw mutex is already write-locked by the caller"));
        }
        match access {
            Access::Read => {
                if st.writer.is_none() && st.queue.is_empty() {
                    st.readers.push(me);
                    return Ok(true);
                }
            }
            Access::Write => {
                if st.readers.contains(&me) {
                    return Err(TaskError::invalid_lock("cannot upgrade a read lock to a write lock"));
                }
                if st.writer.is_none() && st.readers.is_empty() && st.queue.is_empty() {
                    st.writer = Some(me);
                    return Ok(true);
                }
            }
        }

        let wakeup = park_current(ParkMode::interruptible(deadline), move |parker| {
            let mut st = st;
            st.queue.push_back(RwWaiter { access, parker });
        });
        if wakeup.reason != WakeReason::Signaled {
            let mut st = self.state.lock();
            st.remove(wakeup.token);
            // 排在队首的写者离开后，后面的读者可能已经可以进入
            st.dispatch();
        }
        wait_outcome(wakeup.reason)
    }

    /// 释放共享锁
    pub fn unlock_shared(&self) -> Result<(), TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        let Some(pos) = st.readers.iter().position(|r| *r == me) else {
            return Err(TaskError::invalid_lock("unlock_shared by an execution that holds no read lock"));
        };
        st.readers.swap_remove(pos);
        if st.readers.is_empty() {
            st.dispatch();
        }
        Ok(())
    }

    /// 释放独占锁
    pub fn unlock(&self) -> Result<(), TaskError> {
        let me = ExecutionId::current();
        let mut st = self.state.lock();
        match st.writer {
            Some(writer) if writer == me => {
                st.writer = None;
                st.dispatch();
                Ok(())
            }
            Some(_) => Err(TaskError::invalid_lock("rw mutex is write-locked by another execution")),
            None => Err(TaskError::invalid_lock("unlock of an rw mutex that is not write-locked")),
        }
    }

    /// 当前读者数量
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct TaskRwReadGuard<'a> {
    lock: &'a TaskRwMutex,
}

impl Drop for TaskRwReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock_shared() {
            tracing::warn!(%err, "read guard dropped by a non-reader");
        }
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct TaskRwWriteGuard<'a> {
    lock: &'a TaskRwMutex,
}

impl Drop for TaskRwWriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            tracing::warn!(%err, "write guard dropped by a non-owner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_queue(lock: &TaskRwMutex, len: usize) {
        while lock.state.lock().queue.len() < len {
            thread::yield_now();
        }
    }

    #[test]
    fn test_readers_share() {
        let lock = Arc::new(TaskRwMutex::new());
        lock.lock_shared().unwrap();
        let l2 = Arc::clone(&lock);
        thread::spawn(move || {
            assert!(l2.try_lock_shared());
            assert_eq!(l2.reader_count(), 2);
            l2.unlock_shared().unwrap();
        })
        .join()
        .unwrap();
        assert!(!lock.try_lock());
        lock.unlock_shared().unwrap();
        assert!(lock.try_lock());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_misuse() {
        let lock = TaskRwMutex::new();
        assert!(matches!(lock.unlock(), Err(TaskError::InvalidLock(_))));
        assert!(matches!(lock.unlock_shared(), Err(TaskError::InvalidLock(_))));
        lock.lock_shared().unwrap();
        assert!(matches!(lock.lock(), Err(TaskError::InvalidLock(_))));
        lock.unlock_shared().unwrap();
        lock.lock().unwrap();
        assert!(matches!(lock.lock_shared(), Err(TaskError::InvalidLock(_))));
        lock.unlock().unwrap();
    }

    #[test]
    fn test_queued_writer_blocks_new_readers() {
        let lock = Arc::new(TaskRwMutex::new());
        lock.lock_shared().unwrap();

        let l2 = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            l2.lock().unwrap();
            let exclusive = l2.reader_count() == 0;
            l2.unlock().unwrap();
            exclusive
        });
        wait_for_queue(&lock, 1);

        let l3 = Arc::clone(&lock);
        assert!(thread::spawn(move || !l3.try_lock_shared()).join().unwrap());

        lock.unlock_shared().unwrap();
        assert!(writer.join().unwrap());
    }

    #[test]
    fn test_reader_batch_after_writer() {
        let lock = Arc::new(TaskRwMutex::new());
        lock.lock().unwrap();

        let readers: Vec<_> = (0..3)
            .map(|i| {
                let l = Arc::clone(&lock);
                let handle = thread::spawn(move || {
                    l.lock_shared().unwrap();
                    let seen = l.reader_count();
                    while l.reader_count() < 3 {
                        thread::yield_now();
                    }
                    l.unlock_shared().unwrap();
                    seen
                });
                wait_for_queue(&lock, i + 1);
                handle
            })
            .collect();

        lock.unlock().unwrap();
        for r in readers {
            assert!(r.join().unwrap() >= 1);
        }
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_timed_out_writer_lets_readers_in() {
        let lock = Arc::new(TaskRwMutex::new());
        lock.lock_shared().unwrap();

        let l2 = Arc::clone(&lock);
        let writer = thread::spawn(move || l2.lock_for(Duration::from_millis(200)));
        wait_for_queue(&lock, 1);

        let l3 = Arc::clone(&lock);
        let reader = thread::spawn(move || {
            l3.lock_shared().unwrap();
            l3.unlock_shared().unwrap();
        });
        wait_for_queue(&lock, 2);

        assert_eq!(writer.join().unwrap(), Ok(false));
        reader.join().unwrap();
        lock.unlock_shared().unwrap();
    }
}
