//! 执行器队列 (Processor)
//!
//! 每个普通工作线程有一个私有的 Processor，存放绑定到它的任务；
//! 绑定执行器组的若干线程共享同一个 Processor，并且只执行其中的任务。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::queue::TieredQueue;
use super::task::{ExecutorId, Task};

/// 执行器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲
    Idle = 0,
    /// 正在执行任务
    Running = 1,
    /// 已退役，不再接受任务
    Retired = 2,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Running,
            _ => ProcessorStatus::Retired,
        }
    }
}

/// 执行器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// 普通工作线程：先取私有队列，再取全局队列
    Generic,
    /// 只执行显式绑定的任务
    BindOnly {
        /// 在其上运行的任务启动的新任务是否继承绑定
        allow_implicit_start: bool,
    },
}

/// 执行器队列
pub struct Processor {
    /// 执行器 ID
    pub id: ExecutorId,
    kind: ExecutorKind,
    status: AtomicU8,
    retired: AtomicBool,
    /// 入队持读锁、退役持写锁，退役后不会再有任务落进队列
    gate: RwLock<()>,
    /// 绑定任务队列
    queue: TieredQueue,
    /// 调度计数
    schedule_count: AtomicU64,
}

impl Processor {
    pub fn new(id: ExecutorId, kind: ExecutorKind) -> Self {
        Self {
            id,
            kind,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            retired: AtomicBool::new(false),
            gate: RwLock::new(()),
            queue: TieredQueue::new(),
            schedule_count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    #[inline]
    pub fn is_bind_only(&self) -> bool {
        matches!(self.kind, ExecutorKind::BindOnly { .. })
    }

    /// 新任务是否继承这个执行器的绑定
    #[inline]
    pub fn allows_implicit_start(&self) -> bool {
        matches!(self.kind, ExecutorKind::BindOnly { allow_implicit_start: true })
    }

    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_status(&self, status: ProcessorStatus) {
        if !self.is_retired() {
            self.status.store(status as u8, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// 退役并取出剩余任务
    pub(crate) fn retire(&self) -> Vec<Arc<Task>> {
        let _gate = self.gate.write();
        self.retired.store(true, Ordering::Release);
        self.status
            .store(ProcessorStatus::Retired as u8, Ordering::Release);
        self.queue.drain()
    }

    /// 入队；已退役时返回 false，任务原样交回
    pub(crate) fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let _gate = self.gate.read();
        if self.is_retired() {
            return Err(task);
        }
        self.queue.push(task);
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        let task = self.queue.pop()?;
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub(crate) fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}
