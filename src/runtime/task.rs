//! 任务 (Task)
//!
//! 调度的基本单位：可调用对象 + 参数 + 超时 + 优先级 + 执行器亲和性 +
//! 取消标记 + 独立调用栈。调用栈在第一次被调度执行时才分配。
//!
//! 状态机：
//! `Created → Planned → Running → {Suspended, Yielded} ⇄ Running → Finished`，
//! 取消和超时的最终状态分别是 `Cancelled` 和 `TimedOut`。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::context::{self, SwitchReason};
use super::park::ParkState;
use super::result::TaskResult;
use super::scheduler::Scheduler;
use super::stack::{approximate_sp, StackAllocator, StackRegion};
use crate::error::{TaskError, TaskResultValue};
use crate::value::{Callable, ExceptionHandler, Value};

/// 任务 ID
pub type TaskId = u64;

/// 执行器 ID：普通工作线程的私有队列或绑定执行器组
pub type ExecutorId = usize;

const NO_BINDING: usize = usize::MAX;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// 优先级（任务与事件订阅共用的五级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    LowerAvg = 1,
    #[default]
    Avg = 2,
    UpperAvg = 3,
    High = 4,
}

impl Priority {
    /// 级数
    pub const COUNT: usize = 5;

    /// 从高到低
    pub const ALL: [Priority; Priority::COUNT] = [
        Priority::High,
        Priority::UpperAvg,
        Priority::Avg,
        Priority::LowerAvg,
        Priority::Low,
    ];

    /// 在 `ALL` 中的位置，0 为最高
    #[inline]
    pub fn tier(self) -> usize {
        Priority::High as usize - self as usize
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// 已创建，尚未启动
    Created = 0,
    /// 在计划队列中等待第一次执行
    Planned = 1,
    /// 正在某个工作线程上运行
    Running = 2,
    /// 挂起在原语、定时器或结果通道上
    Suspended = 3,
    /// 主动让出，等待重新调度
    Yielded = 4,
    /// 正常结束（包括以异常结束）
    Finished = 5,
    /// 因取消而结束
    Cancelled = 6,
    /// 因超时而结束
    TimedOut = 7,
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Planned,
            2 => TaskState::Running,
            3 => TaskState::Suspended,
            4 => TaskState::Yielded,
            5 => TaskState::Finished,
            6 => TaskState::Cancelled,
            7 => TaskState::TimedOut,
            _ => TaskState::Finished,
        }
    }
}

impl TaskState {
    /// 是否是终止状态
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled | TaskState::TimedOut)
    }
}

/// 任务
pub struct Task {
    id: TaskId,
    name: Option<String>,
    /// 可调用对象与参数，第一次执行时取走
    body: Mutex<Option<(Callable, Vec<Value>)>>,
    exception_handler: Option<ExceptionHandler>,
    deadline: Option<Instant>,
    priority: Priority,
    binding: AtomicUsize,
    auto_bind: bool,
    stack_size: usize,
    state: AtomicU8,
    scheduled: AtomicBool,
    cancel_requested: AtomicBool,
    /// 取消已经以错误形式交给了任务体
    cancel_delivered: AtomicBool,
    result: TaskResult,
    pub(crate) park: Mutex<ParkState>,
    /// 任务切出时保存的栈指针
    sp: AtomicUsize,
    stack: Mutex<Option<StackRegion>>,
    /// 任务体的原始结果，由纤程写入、工作线程取走
    outcome: Mutex<Option<TaskResultValue>>,
    scheduler: Weak<Scheduler>,
}

impl Task {
    /// 用默认选项在全局调度器上创建任务
    pub fn create(callable: Callable, args: Vec<Value>) -> TaskHandle {
        TaskBuilder::new(callable).args(args).build()
    }

    /// 任务构建器
    pub fn builder(callable: Callable) -> TaskBuilder {
        TaskBuilder::new(callable)
    }

    /// 当前线程上正在运行的任务
    pub(crate) fn current() -> Option<Arc<Task>> {
        let ptr = context::current_task_ptr();
        if ptr.is_null() {
            None
        } else {
            // 运行期间工作线程持有一个强引用
            unsafe {
                Arc::increment_strong_count(ptr);
                Some(Arc::from_raw(ptr))
            }
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cas_state(&self, expected: TaskState, new: TaskState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 绑定的执行器
    #[inline]
    pub fn binding(&self) -> Option<ExecutorId> {
        match self.binding.load(Ordering::Acquire) {
            NO_BINDING => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_binding(&self, executor: Option<ExecutorId>) {
        self.binding
            .store(executor.unwrap_or(NO_BINDING), Ordering::Release);
    }

    #[inline]
    pub(crate) fn auto_bind(&self) -> bool {
        self.auto_bind
    }

    #[inline]
    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_delivered(&self) -> bool {
        self.cancel_delivered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancel_delivered(&self) {
        self.cancel_delivered.store(true, Ordering::Release);
    }

    /// 吞掉已投递的取消
    pub(crate) fn suppress_cancel(&self) {
        self.cancel_requested.store(false, Ordering::Release);
        self.cancel_delivered.store(false, Ordering::Release);
    }

    #[inline]
    pub fn result(&self) -> &TaskResult {
        &self.result
    }

    pub(crate) fn exception_handler(&self) -> Option<&ExceptionHandler> {
        self.exception_handler.as_ref()
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    #[inline]
    pub(crate) fn sp_ptr(&self) -> *mut usize {
        self.sp.as_ptr()
    }

    #[inline]
    pub(crate) fn saved_sp(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }

    /// 分配调用栈并写入引导帧
    pub(crate) fn attach_stack(self: &Arc<Self>, stacks: &StackAllocator) -> Result<(), TaskError> {
        let size = match self.stack_size {
            0 => stacks.default_stack_size(),
            n => n,
        };
        let region = stacks.allocate(size)?;
        let sp = unsafe { context::init_stack(region.top(), task_entry, Arc::as_ptr(self) as usize) };
        self.sp.store(sp, Ordering::Release);
        *self.stack.lock() = Some(region);
        Ok(())
    }

    /// 在任务栈上执行前发布当前栈给故障处理器
    pub(crate) fn enter_stack(&self) -> Option<super::stack::ActiveRegion> {
        self.stack.lock().as_ref().map(super::stack::enter_region)
    }

    pub(crate) fn take_stack(&self) -> Option<StackRegion> {
        self.stack.lock().take()
    }

    pub(crate) fn take_outcome(&self) -> Option<TaskResultValue> {
        self.outcome.lock().take()
    }

    /// 栈溢出是否待投递；栈指针已离开故障保留区时顺带重新布置保护
    pub(crate) fn take_overflow(&self) -> bool {
        let stack = self.stack.lock();
        let Some(region) = stack.as_ref() else {
            return false;
        };
        if !region.is_overflowed() {
            return false;
        }
        if let Some(scheduler) = self.scheduler() {
            let stacks = scheduler.stacks();
            if approximate_sp() > region.usable_bottom() + stacks.page_size() {
                stacks.rearm(region);
            }
        }
        true
    }

    /// 预先提交当前栈指针以下 `bytes` 字节
    pub(crate) fn prepare_stack(&self, bytes: usize) -> Result<(), TaskError> {
        let stack = self.stack.lock();
        let (Some(region), Some(scheduler)) = (stack.as_ref(), self.scheduler()) else {
            return Ok(());
        };
        scheduler.stacks().prepare(region, approximate_sp(), bytes)
    }

    /// 取消提交当前栈指针以下超出 `threshold` 字节的页
    pub(crate) fn shrink_stack(&self, threshold: usize) -> bool {
        let stack = self.stack.lock();
        let (Some(region), Some(scheduler)) = (stack.as_ref(), self.scheduler()) else {
            return false;
        };
        scheduler.stacks().shrink(region, approximate_sp(), threshold)
    }

    /// 让挂起结束的任务重新进入运行队列
    pub(crate) fn reschedule(self: &Arc<Self>) {
        if let Some(scheduler) = self.scheduler() {
            scheduler.enqueue_resumed(Arc::clone(self));
        }
    }

    /// 定时器到期：启动延时任务
    pub(crate) fn start_scheduled(self: &Arc<Self>) {
        if let Some(scheduler) = self.scheduler() {
            scheduler.start_scheduled(self);
        }
    }

    /// 检查挂起点上待投递的中断
    pub(crate) fn check_interrupts(&self) -> Result<(), TaskError> {
        if self.take_overflow() {
            return Err(TaskError::StackOverflow);
        }
        if self.is_cancellation_requested() {
            self.mark_cancel_delivered();
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// 在任务栈上执行任务体，结果留给工作线程处理
    fn run_body(&self) {
        let body = self.body.lock().take();
        let outcome = match body {
            Some((callable, args)) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callable(&args))) {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                }
            }
            None => Err(TaskError::invalid_operation("task body already consumed")),
        };
        *self.outcome.lock() = Some(outcome);
    }

    /// 请求取消：设置标记，任务正处于可打断的挂起中时立即唤醒它
    pub(crate) fn request_cancel(self: &Arc<Self>) {
        self.cancel_requested.store(true, Ordering::Release);
        super::park::interrupt(self, super::park::WakeReason::Cancelled);
        tracing::trace!(task = self.id, "cancellation requested");
    }

    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn detached_for_test() -> Arc<Task> {
        TaskBuilder::new(crate::value::callable(|_| Ok(None))).build_detached()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// 纤程入口：执行任务体后切回工作线程，不会返回
extern "C" fn task_entry(arg: usize) -> ! {
    // 工作线程在任务运行期间持有强引用
    let task = unsafe { &*(arg as *const Task) };
    task.run_body();
    unsafe { context::suspend(task.sp_ptr(), SwitchReason::Finished) };
    std::process::abort()
}

/// 栈越过故障保留区后的着陆点
///
/// 故障处理器把任务的执行重定向到栈顶的这里，任务体剩余的栈帧被放弃。
pub(crate) extern "C" fn overflow_landing() -> ! {
    let task = context::current_task_ptr();
    if task.is_null() {
        std::process::abort();
    }
    let task = unsafe { &*task };
    *task.outcome.lock() = Some(Err(TaskError::StackOverflow));
    unsafe { context::suspend(task.sp_ptr(), SwitchReason::Finished) };
    std::process::abort()
}

/// 把取消记为已投递并返回对应错误
pub(crate) fn deliver_cancel() -> TaskError {
    if let Some(task) = Task::current() {
        task.mark_cancel_delivered();
    }
    TaskError::Cancelled
}

/// 任务构建器
pub struct TaskBuilder {
    callable: Callable,
    args: Vec<Value>,
    name: Option<String>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    priority: Priority,
    exception_handler: Option<ExceptionHandler>,
    binding: Option<ExecutorId>,
    auto_bind: bool,
    stack_size: usize,
    scheduler: Option<Arc<Scheduler>>,
}

impl TaskBuilder {
    pub fn new(callable: Callable) -> Self {
        Self {
            callable,
            args: Vec::new(),
            name: None,
            timeout: None,
            deadline: None,
            priority: Priority::default(),
            exception_handler: None,
            binding: None,
            auto_bind: false,
            stack_size: 0,
            scheduler: None,
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 从创建时刻起计算的超时
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 绝对截止时间
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// 固定在指定执行器上运行
    pub fn bind_to_worker_id(mut self, executor: ExecutorId) -> Self {
        self.binding = Some(executor);
        self
    }

    /// 第一次执行时绑定到当时的工作线程
    pub fn auto_bind_worker(mut self) -> Self {
        self.auto_bind = true;
        self
    }

    /// 调用栈大小，0 表示使用调度器默认值
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// 创建在指定调度器上，默认是全局调度器
    pub fn scheduler(mut self, scheduler: &Arc<Scheduler>) -> Self {
        self.scheduler = Some(Arc::clone(scheduler));
        self
    }

    fn into_task(self, scheduler: Weak<Scheduler>) -> Task {
        let deadline = match (self.timeout, self.deadline) {
            (Some(t), Some(d)) => Some(d.min(Instant::now() + t)),
            (Some(t), None) => Some(Instant::now() + t),
            (None, d) => d,
        };
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            body: Mutex::new(Some((self.callable, self.args))),
            exception_handler: self.exception_handler,
            deadline,
            priority: self.priority,
            binding: AtomicUsize::new(self.binding.unwrap_or(NO_BINDING)),
            auto_bind: self.auto_bind,
            stack_size: self.stack_size,
            state: AtomicU8::new(TaskState::Created as u8),
            scheduled: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel_delivered: AtomicBool::new(false),
            result: TaskResult::new(),
            park: Mutex::new(ParkState::default()),
            sp: AtomicUsize::new(0),
            stack: Mutex::new(None),
            outcome: Mutex::new(None),
            scheduler,
        }
    }

    /// 创建任务（尚未启动）
    pub fn build(mut self) -> TaskHandle {
        let scheduler = self
            .scheduler
            .take()
            .unwrap_or_else(|| Arc::clone(Scheduler::global()));
        let task = Arc::new(self.into_task(Arc::downgrade(&scheduler)));
        scheduler.register(&task);
        TaskHandle(task)
    }

    /// 创建并立即启动
    pub fn spawn(self) -> Result<TaskHandle, TaskError> {
        let handle = self.build();
        handle.start()?;
        Ok(handle)
    }

    /// 不属于任何调度器的任务
    #[cfg(test)]
    pub(crate) fn build_detached(self) -> Arc<Task> {
        Arc::new(self.into_task(Weak::new()))
    }
}

/// 任务句柄
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<Task>);

impl TaskHandle {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.0.name()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.0.state()
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.0.priority()
    }

    /// 结果通道
    #[inline]
    pub fn result(&self) -> &TaskResult {
        self.0.result()
    }

    fn scheduler(&self) -> Result<Arc<Scheduler>, TaskError> {
        self.0.scheduler().ok_or(TaskError::Shutdown)
    }

    /// 放入计划队列
    ///
    /// 计划队列已满时挂起调用者直到有空位。
    pub fn start(&self) -> Result<(), TaskError> {
        self.scheduler()?.start_task(&self.0)
    }

    /// 固定到指定执行器后启动
    pub fn start_on(&self, executor: ExecutorId) -> Result<(), TaskError> {
        if self.state() != TaskState::Created {
            return Err(TaskError::invalid_operation("task already started"));
        }
        self.0.set_binding(Some(executor));
        self.start()
    }

    /// 延时启动
    pub fn schedule(&self, delay: Duration) -> Result<(), TaskError> {
        self.schedule_until(Instant::now() + delay)
    }

    /// 在指定时刻启动
    pub fn schedule_until(&self, at: Instant) -> Result<(), TaskError> {
        self.scheduler()?.schedule_task(&self.0, at)
    }

    /// 请求取消，在任务的下一个挂起点生效
    pub fn notify_cancel(&self) {
        self.0.request_cancel();
    }

    #[inline]
    pub fn is_cancellation_requested(&self) -> bool {
        self.0.is_cancellation_requested()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    fn executor(&self, be_executor: bool) -> Result<Option<Arc<Scheduler>>, TaskError> {
        if let Some(current) = Task::current() {
            if current.id() == self.id() {
                return Err(TaskError::invalid_operation("a task cannot await itself"));
            }
            return Ok(None);
        }
        Ok(if be_executor { self.0.scheduler() } else { None })
    }

    /// 等待任务结束
    pub fn await_task(&self) -> Result<(), TaskError> {
        self.await_task_with(false)
    }

    /// 等待任务结束；在普通线程上 `be_executor` 让调用者在等待期间执行任务
    pub fn await_task_with(&self, be_executor: bool) -> Result<(), TaskError> {
        let executor = self.executor(be_executor)?;
        self.0.result.wait_final(executor.as_ref()).map(|_| ())
    }

    /// 等待并返回最终值
    pub fn get_result(&self) -> TaskResultValue {
        self.get_result_with(false)
    }

    pub fn get_result_with(&self, be_executor: bool) -> TaskResultValue {
        let executor = self.executor(be_executor)?;
        self.0.result.wait_final(executor.as_ref())?
    }

    /// 第 `n` 个产出值，最终值排在所有中间值之后
    pub fn get_result_at(&self, n: usize) -> TaskResultValue {
        let executor = self.executor(false)?;
        self.0.result.get(n, executor.as_ref())?
    }

    /// 等待结束并报告是否有最终值
    pub fn has_result(&self) -> Result<bool, TaskError> {
        let executor = self.executor(false)?;
        let value = self.0.result.wait_final(executor.as_ref())?;
        Ok(matches!(value, Ok(Some(_))))
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}

/// 等待所有任务结束
pub fn await_multiple(handles: &[TaskHandle], be_executor: bool) -> Result<(), TaskError> {
    for handle in handles {
        handle.await_task_with(be_executor)?;
    }
    Ok(())
}

/// 等待所有任务结束并按输入顺序返回最终值
pub fn await_results(handles: &[TaskHandle], be_executor: bool) -> Result<Vec<TaskResultValue>, TaskError> {
    await_multiple(handles, be_executor)?;
    Ok(handles
        .iter()
        .map(|h| h.0.result.try_final().unwrap_or(Ok(None)))
        .collect())
}
