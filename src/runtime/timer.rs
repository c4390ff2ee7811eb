//! 定时器线程
//!
//! 按截止时间维护一个最小堆，用 `recv_deadline` 等待下一个到期项或新的登记。
//! 到期项要么唤醒一个挂起的任务（纪元不匹配的过期项被忽略），
//! 要么把一个延时启动的任务放入计划队列。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::park::{wake_task, WakeReason};
use super::task::{Task, TaskId};
use crate::config::TIMER_THREAD_NAME;

/// 撤销项达到这个数量且不少于堆大小的一半时压缩堆
const COMPACT_THRESHOLD: usize = 64;

/// 到期时执行的动作
pub(crate) enum TimerAction {
    /// 唤醒挂起的任务；不延长任务的生命周期
    Wake {
        task: Weak<Task>,
        id: TaskId,
        epoch: u64,
        reason: WakeReason,
    },
    /// 启动延时任务
    Start(Arc<Task>),
}

impl TimerAction {
    pub(crate) fn wake(task: &Arc<Task>, epoch: u64, reason: WakeReason) -> Self {
        TimerAction::Wake {
            task: Arc::downgrade(task),
            id: task.id(),
            epoch,
            reason,
        }
    }

    /// 唤醒项对应的挂起
    fn park_key(&self) -> Option<(TaskId, u64)> {
        match self {
            TimerAction::Wake { id, epoch, .. } => Some((*id, *epoch)),
            TimerAction::Start(_) => None,
        }
    }

    fn is_dead(&self) -> bool {
        match self {
            TimerAction::Wake { task, .. } => task.strong_count() == 0,
            TimerAction::Start(_) => false,
        }
    }

    fn fire(self) {
        match self {
            TimerAction::Wake { task, epoch, reason, .. } => {
                let Some(task) = task.upgrade() else {
                    return;
                };
                if wake_task(&task, epoch, reason) {
                    tracing::trace!(task = task.id(), ?reason, "timer woke task");
                }
            }
            TimerAction::Start(task) => task.start_scheduled(),
        }
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    action: TimerAction,
}

// 最小堆：截止时间早的在前，同一时间按登记顺序
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// 定时器线程独占的到期项堆
///
/// 已结束的挂起通过 `cancel` 登记，到期时跳过；撤销项积累到堆规模的一半时整体压缩。
#[derive(Default)]
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<(TaskId, u64)>,
    seq: u64,
}

impl TimerHeap {
    fn add(&mut self, at: Instant, action: TimerAction) {
        self.seq += 1;
        self.heap.push(TimerEntry {
            at,
            seq: self.seq,
            action,
        });
    }

    fn cancel(&mut self, id: TaskId, epoch: u64) {
        self.cancelled.insert((id, epoch));
        let n = self.cancelled.len();
        if n >= COMPACT_THRESHOLD && n * 2 >= self.heap.len() {
            self.compact();
        }
    }

    /// 丢弃已撤销和任务已释放的项
    fn compact(&mut self) {
        let cancelled = &self.cancelled;
        self.heap.retain(|e| {
            !e.action.is_dead() && !e.action.park_key().is_some_and(|k| cancelled.contains(&k))
        });
        // 纪元只增不减，被撤销的挂起不会再登记新项
        self.cancelled.clear();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.at)
    }

    /// 取出一个到期且仍有效的动作
    fn pop_due(&mut self, now: Instant) -> Option<TimerAction> {
        while self.heap.peek().is_some_and(|e| e.at <= now) {
            let entry = self.heap.pop()?;
            if entry.action.park_key().is_some_and(|k| self.cancelled.contains(&k)) {
                continue;
            }
            return Some(entry.action);
        }
        None
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

enum Command {
    Add(Instant, TimerAction),
    Cancel(TaskId, u64),
    Stop,
}

/// 定时器线程句柄
pub(crate) struct Timer {
    sender: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// 启动定时器线程
    pub(crate) fn start(named: bool) -> Result<Self, std::io::Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut builder = thread::Builder::new();
        if named {
            builder = builder.name(TIMER_THREAD_NAME.to_string());
        }
        let handle = builder.spawn(move || run_loop(receiver))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 登记一个到期动作
    pub(crate) fn add(&self, at: Instant, action: TimerAction) {
        if let Err(err) = self.sender.send(Command::Add(at, action)) {
            // 定时器已停止，立即执行
            if let Command::Add(_, action) = err.into_inner() {
                action.fire();
            }
        }
    }

    /// 撤销某次挂起登记的所有唤醒项
    pub(crate) fn cancel(&self, id: TaskId, epoch: u64) {
        let _ = self.sender.send(Command::Cancel(id, epoch));
    }

    /// 停止定时器线程，未到期的项被丢弃
    pub(crate) fn stop(&self) {
        let _ = self.sender.send(Command::Stop);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run_loop(receiver: Receiver<Command>) {
    let mut timers = TimerHeap::default();

    loop {
        while let Some(action) = timers.pop_due(Instant::now()) {
            action.fire();
        }

        let command = match timers.next_deadline() {
            Some(at) => match receiver.recv_deadline(at) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };

        match command {
            Command::Add(at, action) => timers.add(at, action),
            Command::Cancel(id, epoch) => timers.cancel(id, epoch),
            Command::Stop => break,
        }
    }

    tracing::debug!(pending = timers.len(), "timer thread shutting down");
}
