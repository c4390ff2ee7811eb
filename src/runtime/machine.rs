//! 工作线程 (Machine)
//!
//! 一个 OS 线程，循环地从所属 Processor 和全局队列取任务执行；
//! 没有任务时在自己的条件变量上休眠，带超时以便重新检查。

use std::io;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use super::processor::{Processor, ProcessorStatus};
use super::scheduler::Scheduler;

/// 工作线程
pub struct Machine {
    /// 线程 ID
    pub id: u64,
    /// 所属执行器
    processor: Arc<Processor>,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 是否正在休眠
    parking: AtomicBool,
    /// 是否应该停止
    should_stop: AtomicBool,
    /// 休眠/唤醒同步
    park_mutex: Mutex<bool>,
    park_cond: Condvar,
    scheduler: Weak<Scheduler>,
    /// 执行过的任务切片数量
    task_count: AtomicU64,
}

impl Machine {
    pub(crate) fn new(id: u64, processor: Arc<Processor>, scheduler: Weak<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            id,
            processor,
            thread: Mutex::new(None),
            parking: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            park_mutex: Mutex::new(false),
            park_cond: Condvar::new(),
            scheduler,
            task_count: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    /// 启动工作线程
    pub(crate) fn start(self: &Arc<Self>, name: Option<String>) -> io::Result<()> {
        let machine = Arc::clone(self);
        let mut builder = thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || machine.run_loop())?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// 主执行循环
    fn run_loop(&self) {
        tracing::debug!(machine = self.id, executor = self.processor.id, "worker started");
        loop {
            if self.should_stop.load(Ordering::Acquire) {
                break;
            }
            let Some(scheduler) = self.scheduler.upgrade() else {
                break;
            };

            if let Some(dispatch) = scheduler.find_work(&self.processor) {
                self.processor.set_status(ProcessorStatus::Running);
                self.task_count.fetch_add(1, Ordering::Relaxed);
                scheduler.execute(dispatch, Some(&self.processor));
                self.processor.set_status(ProcessorStatus::Idle);
            } else {
                let timeout = scheduler.config().idle_park_timeout();
                let has_work = || scheduler.has_work(&self.processor);
                self.park(timeout, has_work);
            }
        }

        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.machine_exited(self);
        }
        tracing::debug!(machine = self.id, "worker stopped");
    }

    /// 休眠等待；先短暂自旋，进入休眠状态后再检查一次是否有工作，避免错过唤醒
    fn park<F: Fn() -> bool>(&self, timeout: Duration, has_work: F) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if has_work() || self.should_stop.load(Ordering::Acquire) {
                return;
            }
            backoff.snooze();
        }

        self.parking.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if has_work() {
            self.parking.store(false, Ordering::Release);
            return;
        }

        let mut guard = self.park_mutex.lock();
        if !*guard && !self.should_stop.load(Ordering::Acquire) {
            self.park_cond.wait_for(&mut guard, timeout);
        }
        *guard = false;

        self.parking.store(false, Ordering::Release);
    }

    /// 唤醒线程
    pub fn unpark(&self) {
        let mut guard = self.park_mutex.lock();
        *guard = true;
        self.park_cond.notify_one();
    }

    /// 检查是否正在休眠
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.parking.load(Ordering::SeqCst)
    }

    /// 请求停止，当前任务切出后生效
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.unpark();
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    /// 等待线程结束（不能在本线程上调用）
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    /// 是否运行在当前线程上
    pub(crate) fn is_current_thread(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    #[inline]
    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("executor", &self.processor.id)
            .field("parking", &self.is_parking())
            .field("task_count", &self.task_count())
            .finish()
    }
}
