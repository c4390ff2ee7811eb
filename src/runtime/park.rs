//! 挂起与唤醒
//!
//! 同步原语、结果通道和定时器都通过这里挂起调用者：
//! 在任务里调用时挂起任务本身，工作线程立即去执行别的任务；
//! 在普通线程里调用时阻塞该线程（可选地在等待期间充当临时执行器）。
//!
//! 每次挂起都会递增任务的挂起纪元。唤醒者持有 `(task, epoch)`，
//! 只有纪元匹配且任务仍处于挂起阶段时唤醒才会成功，因此同一次挂起
//! 只会有一个唤醒者胜出，过期的唤醒（超时之后的信号、取消之后的定时器）自动失效。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::context::{self, SwitchReason};
use super::scheduler::Scheduler;
use super::task::{deliver_cancel, Task, TaskId, TaskState};
use super::timer::TimerAction;
use crate::error::TaskError;

/// 唤醒原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// 被原语正常唤醒
    Signaled,
    /// 等待期限到达
    Deadline,
    /// 任务被取消
    Cancelled,
    /// 任务自身的超时到达
    TimedOut,
    /// 任务栈溢出待投递
    StackOverflow,
}

impl WakeReason {
    /// 打断类原因对应的错误；取消会被记为已投递
    pub(crate) fn interrupt(self) -> Option<TaskError> {
        match self {
            WakeReason::Signaled | WakeReason::Deadline => None,
            WakeReason::Cancelled => Some(deliver_cancel()),
            WakeReason::TimedOut => Some(TaskError::TimedOut),
            WakeReason::StackOverflow => Some(TaskError::StackOverflow),
        }
    }
}

/// 执行体标识：任务或普通线程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionId {
    Task(TaskId),
    Thread(ThreadId),
}

impl ExecutionId {
    /// 当前执行体
    pub fn current() -> Self {
        match Task::current() {
            Some(task) => ExecutionId::Task(task.id()),
            None => ExecutionId::Thread(thread::current().id()),
        }
    }
}

/// 任务挂起阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkPhase {
    /// 正在运行或已排队
    Running,
    /// 已登记到等待队列，尚未完成切出
    Parking,
    /// 已切出，等待唤醒
    Parked,
    /// 在切出完成前就被唤醒
    Woken,
}

/// 任务的挂起状态，由任务自身的锁保护
#[derive(Debug)]
pub(crate) struct ParkState {
    pub(crate) epoch: u64,
    pub(crate) phase: ParkPhase,
    pub(crate) reason: WakeReason,
    pub(crate) interruptible: bool,
}

impl Default for ParkState {
    fn default() -> Self {
        Self {
            epoch: 0,
            phase: ParkPhase::Running,
            reason: WakeReason::Signaled,
            interruptible: false,
        }
    }
}

/// 用于从等待队列中移除某次挂起的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkToken {
    Task(TaskId, u64),
    Thread(usize),
}

/// 挂起的普通线程
pub(crate) struct ThreadParker {
    thread: ThreadId,
    woken: Mutex<Option<WakeReason>>,
    cond: Condvar,
    /// 等待期间可以代为执行任务的调度器
    executor: Option<Weak<Scheduler>>,
}

impl ThreadParker {
    fn new(executor: Option<&Arc<Scheduler>>) -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current().id(),
            woken: Mutex::new(None),
            cond: Condvar::new(),
            executor: executor.map(Arc::downgrade),
        })
    }

    fn wake(&self, reason: WakeReason) -> bool {
        let mut woken = self.woken.lock();
        if woken.is_some() {
            return false;
        }
        *woken = Some(reason);
        self.cond.notify_all();
        true
    }

    /// 阻塞直到被唤醒或期限到达
    fn wait(&self, deadline: Option<Instant>) -> WakeReason {
        const HELPER_POLL: Duration = Duration::from_millis(1);

        loop {
            let executor = self.executor.as_ref().and_then(Weak::upgrade);
            if let Some(scheduler) = &executor {
                if self.woken.lock().is_none() && scheduler.help_once() {
                    continue;
                }
            }

            let mut woken = self.woken.lock();
            if let Some(reason) = *woken {
                return reason;
            }
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    *woken = Some(WakeReason::Deadline);
                    return WakeReason::Deadline;
                }
            }
            let until = match (deadline, executor.is_some()) {
                (Some(d), true) => Some(d.min(now + HELPER_POLL)),
                (None, true) => Some(now + HELPER_POLL),
                (d, false) => d,
            };
            match until {
                Some(until) => {
                    self.cond.wait_until(&mut woken, until);
                }
                None => self.cond.wait(&mut woken),
            }
        }
    }
}

/// 等待队列中的一项
#[derive(Clone)]
pub(crate) enum Parker {
    Task { task: Arc<Task>, epoch: u64 },
    Thread(Arc<ThreadParker>),
}

impl Parker {
    /// 唤醒；同一次挂起只有第一个唤醒者返回 true
    pub(crate) fn wake(&self, reason: WakeReason) -> bool {
        match self {
            Parker::Task { task, epoch } => wake_task(task, *epoch, reason),
            Parker::Thread(parker) => parker.wake(reason),
        }
    }

    /// 挂起者的执行体标识
    pub(crate) fn id(&self) -> ExecutionId {
        match self {
            Parker::Task { task, .. } => ExecutionId::Task(task.id()),
            Parker::Thread(parker) => ExecutionId::Thread(parker.thread),
        }
    }

    pub(crate) fn token(&self) -> ParkToken {
        match self {
            Parker::Task { task, epoch } => ParkToken::Task(task.id(), *epoch),
            Parker::Thread(parker) => ParkToken::Thread(Arc::as_ptr(parker) as usize),
        }
    }
}

impl std::fmt::Debug for Parker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Parker").field(&self.token()).finish()
    }
}

pub(crate) fn wake_task(task: &Arc<Task>, epoch: u64, reason: WakeReason) -> bool {
    let mut st = task.park.lock();
    if st.epoch != epoch {
        return false;
    }
    match st.phase {
        ParkPhase::Parking => {
            st.phase = ParkPhase::Woken;
            st.reason = reason;
            true
        }
        ParkPhase::Parked => {
            st.phase = ParkPhase::Running;
            st.reason = reason;
            drop(st);
            task.reschedule();
            true
        }
        ParkPhase::Running | ParkPhase::Woken => false,
    }
}

/// FIFO 等待队列
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    waiters: VecDeque<Parker>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, parker: Parker) {
        self.waiters.push_back(parker);
    }

    pub(crate) fn pop(&mut self) -> Option<Parker> {
        self.waiters.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&Parker> {
        self.waiters.front()
    }

    pub(crate) fn remove(&mut self, token: ParkToken) {
        self.waiters.retain(|p| p.token() != token);
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// 按 FIFO 顺序唤醒第一个仍在等待的挂起者
    pub(crate) fn wake_one(&mut self, reason: WakeReason) -> Option<ExecutionId> {
        while let Some(parker) = self.waiters.pop_front() {
            if parker.wake(reason) {
                return Some(parker.id());
            }
        }
        None
    }

    /// 唤醒全部挂起者，返回成功唤醒的数量
    pub(crate) fn wake_all(&mut self, reason: WakeReason) -> usize {
        self.waiters.drain(..).filter(|p| p.wake(reason)).count()
    }
}

/// 一次挂起的方式
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParkMode<'a> {
    /// 等待期限
    pub(crate) deadline: Option<Instant>,
    /// 是否可被取消和任务超时打断
    pub(crate) interruptible: bool,
    /// 普通线程等待期间代为执行任务
    pub(crate) executor: Option<&'a Arc<Scheduler>>,
}

impl<'a> ParkMode<'a> {
    pub(crate) fn interruptible(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            interruptible: true,
            executor: None,
        }
    }

    pub(crate) fn uninterruptible() -> Self {
        Self::default()
    }

    pub(crate) fn with_executor(mut self, executor: Option<&'a Arc<Scheduler>>) -> Self {
        self.executor = executor;
        self
    }
}

/// 挂起结果
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wakeup {
    pub(crate) reason: WakeReason,
    pub(crate) token: ParkToken,
}

/// 挂起当前执行体
///
/// `register` 拿到本次挂起的 `Parker`，负责把它放进等待队列并释放原语的锁；
/// 它在挂起状态建立之后、真正切出之前被调用，因此不会丢失唤醒。
/// 可打断的挂起在登记前发现已有取消请求或任务已超时，会直接返回而不登记。
pub(crate) fn park_current<F>(mode: ParkMode<'_>, register: F) -> Wakeup
where
    F: FnOnce(Parker),
{
    match Task::current() {
        Some(task) => park_task(task, mode, register),
        None => park_thread(mode, register),
    }
}

fn park_task<F>(task: Arc<Task>, mode: ParkMode<'_>, register: F) -> Wakeup
where
    F: FnOnce(Parker),
{
    if mode.interruptible && task.take_overflow() {
        let epoch = task.park.lock().epoch;
        return Wakeup {
            reason: WakeReason::StackOverflow,
            token: ParkToken::Task(task.id(), epoch),
        };
    }

    let epoch = {
        let mut st = task.park.lock();
        st.epoch += 1;
        let epoch = st.epoch;
        let token = ParkToken::Task(task.id(), epoch);
        if mode.interruptible {
            if task.is_cancellation_requested() {
                return Wakeup { reason: WakeReason::Cancelled, token };
            }
            if task.deadline().is_some_and(|d| Instant::now() >= d) {
                return Wakeup { reason: WakeReason::TimedOut, token };
            }
        }
        st.phase = ParkPhase::Parking;
        st.interruptible = mode.interruptible;
        epoch
    };

    register(Parker::Task {
        task: Arc::clone(&task),
        epoch,
    });

    let mut timed = false;
    if let Some(scheduler) = task.scheduler() {
        if let Some(deadline) = mode.deadline {
            scheduler
                .timer()
                .add(deadline, TimerAction::wake(&task, epoch, WakeReason::Deadline));
            timed = true;
        }
        if mode.interruptible {
            if let Some(deadline) = task.deadline() {
                scheduler
                    .timer()
                    .add(deadline, TimerAction::wake(&task, epoch, WakeReason::TimedOut));
                timed = true;
            }
        }
    }

    task.set_state(TaskState::Suspended);
    unsafe { context::suspend(task.sp_ptr(), SwitchReason::Park) };

    if timed {
        if let Some(scheduler) = task.scheduler() {
            scheduler.timer().cancel(task.id(), epoch);
        }
    }
    let reason = task.park.lock().reason;
    Wakeup {
        reason,
        token: ParkToken::Task(task.id(), epoch),
    }
}

fn park_thread<F>(mode: ParkMode<'_>, register: F) -> Wakeup
where
    F: FnOnce(Parker),
{
    let parker = ThreadParker::new(mode.executor);
    let token = ParkToken::Thread(Arc::as_ptr(&parker) as usize);
    register(Parker::Thread(Arc::clone(&parker)));
    let reason = parker.wait(mode.deadline);
    Wakeup { reason, token }
}

/// 任务切出后由工作线程调用：完成挂起，或者把已被提前唤醒的任务重新排队
pub(crate) fn finish_park(task: &Arc<Task>) {
    let mut st = task.park.lock();
    match st.phase {
        ParkPhase::Parking => st.phase = ParkPhase::Parked,
        ParkPhase::Woken => {
            st.phase = ParkPhase::Running;
            drop(st);
            task.reschedule();
        }
        ParkPhase::Running | ParkPhase::Parked => {
            tracing::error!(task = task.id(), phase = ?st.phase, "unexpected park phase after switch");
        }
    }
}

/// 取消请求：任务正处于可打断的挂起中时立即唤醒它
pub(crate) fn interrupt(task: &Arc<Task>, reason: WakeReason) -> bool {
    let epoch = {
        let st = task.park.lock();
        if !st.interruptible || !matches!(st.phase, ParkPhase::Parking | ParkPhase::Parked) {
            return false;
        }
        st.epoch
    };
    wake_task(task, epoch, reason)
}
