//! 分级运行队列
//!
//! 每个优先级一条无锁 FIFO（`Injector`），出队时从最高优先级开始，
//! 同一优先级内严格按到达顺序。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::CachePadded;

use super::task::{Priority, Task};

/// 五级运行队列
pub struct TieredQueue {
    /// 按 `Priority::ALL` 的顺序（高 → 低）
    tiers: [Injector<Arc<Task>>; Priority::COUNT],
    len: CachePadded<AtomicUsize>,
}

impl TieredQueue {
    /// 创建空队列
    pub fn new() -> Self {
        Self {
            tiers: std::array::from_fn(|_| Injector::new()),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 按任务优先级入队
    pub fn push(&self, task: Arc<Task>) {
        let tier = task.priority().tier();
        self.len.fetch_add(1, Ordering::AcqRel);
        self.tiers[tier].push(task);
    }

    /// 取出优先级最高、最早到达的任务
    pub fn pop(&self) -> Option<Arc<Task>> {
        for tier in &self.tiers {
            loop {
                match tier.steal() {
                    Steal::Success(task) => {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                        return Some(task);
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    /// 取出全部任务
    pub fn drain(&self) -> Vec<Arc<Task>> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    /// 队列长度（近似值）
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(Injector::is_empty)
    }
}

impl Default for TieredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TieredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredQueue").field("len", &self.len()).finish()
    }
}
