//! 调度器
//!
//! 一组工作线程协作地复用任意数量的任务。队列分三类：
//! - 每个执行器自己的绑定队列（`Processor`）
//! - 全局恢复队列：从挂起或让出中恢复的任务
//! - 全局计划队列：尚未运行过的任务，受 `max_running_tasks` 限制
//!
//! 工作线程依次查找：自己的绑定队列 → 恢复队列 → 计划队列。
//! 绑定执行器组只查找自己的队列。

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::context::{self, RunSlot, SwitchReason};
use super::machine::Machine;
use super::park::{self, park_current, ParkMode, WaitList, WakeReason};
use super::processor::{ExecutorKind, Processor};
use super::queue::TieredQueue;
use super::stack::{StackAllocator, StackConfig, StackStats};
use super::task::{ExecutorId, Task, TaskHandle, TaskId, TaskState};
use super::timer::{Timer, TimerAction};
use crate::config::{BOUND_THREAD_PREFIX, WORKER_THREAD_PREFIX};
use crate::error::{TaskError, TaskResultValue};
use crate::event;
use crate::value::Value;

/// 全局调度器单例
static GLOBAL: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 普通工作线程数量（默认为 CPU 核心数）
    pub num_workers: usize,
    /// 同时处于运行中（已开始且未结束）的计划任务上限，0 表示不限
    pub max_running_tasks: usize,
    /// 计划队列上限，0 表示不限
    pub max_planned_tasks: usize,
    /// 是否给工作线程命名
    pub thread_naming: bool,
    /// 空闲工作线程的休眠超时
    pub idle_park_timeout: Duration,
    /// 任务栈配置
    pub stack: StackConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            max_running_tasks: 0,
            max_planned_tasks: 0,
            thread_naming: true,
            idle_park_timeout: Duration::from_millis(10),
            stack: StackConfig::default(),
        }
    }
}

/// 运行期可修改的配置
pub struct ConfigHandle {
    max_running_tasks: AtomicUsize,
    max_planned_tasks: AtomicUsize,
    thread_naming: AtomicBool,
    idle_park_timeout_us: AtomicU64,
    stacks: Arc<StackAllocator>,
}

impl ConfigHandle {
    fn new(config: &SchedulerConfig, stacks: Arc<StackAllocator>) -> Self {
        Self {
            max_running_tasks: AtomicUsize::new(config.max_running_tasks),
            max_planned_tasks: AtomicUsize::new(config.max_planned_tasks),
            thread_naming: AtomicBool::new(config.thread_naming),
            idle_park_timeout_us: AtomicU64::new(config.idle_park_timeout.as_micros() as u64),
            stacks,
        }
    }

    #[inline]
    pub fn max_running_tasks(&self) -> usize {
        self.max_running_tasks.load(Ordering::Relaxed)
    }

    pub fn set_max_running_tasks(&self, max: usize) {
        self.max_running_tasks.store(max, Ordering::Relaxed);
    }

    #[inline]
    pub fn max_planned_tasks(&self) -> usize {
        self.max_planned_tasks.load(Ordering::Relaxed)
    }

    pub fn set_max_planned_tasks(&self, max: usize) {
        self.max_planned_tasks.store(max, Ordering::Relaxed);
    }

    #[inline]
    pub fn thread_naming(&self) -> bool {
        self.thread_naming.load(Ordering::Relaxed)
    }

    /// 只影响之后创建的线程
    pub fn set_thread_naming(&self, enabled: bool) {
        self.thread_naming.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn idle_park_timeout(&self) -> Duration {
        Duration::from_micros(self.idle_park_timeout_us.load(Ordering::Relaxed))
    }

    pub fn set_idle_park_timeout(&self, timeout: Duration) {
        self.idle_park_timeout_us
            .store(timeout.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn reserved_fault_stack_size(&self) -> usize {
        self.stacks.reserved_fault_stack_size()
    }

    pub fn set_reserved_fault_stack_size(&self, size: usize) {
        self.stacks.set_reserved_fault_stack_size(size);
    }

    pub fn flush_on_reuse(&self) -> bool {
        self.stacks.flush_on_reuse()
    }

    pub fn set_flush_on_reuse(&self, flush: bool) {
        self.stacks.set_flush_on_reuse(flush);
    }

    /// 栈池最多缓存的栈数量：0 不限，`NEVER_POOL` 不缓存
    pub fn max_buffer_size(&self) -> usize {
        self.stacks.max_buffer_size()
    }

    pub fn set_max_buffer_size(&self, max: usize) {
        self.stacks.set_max_buffer_size(max);
    }

    pub fn default_stack_size(&self) -> usize {
        self.stacks.default_stack_size()
    }

    pub fn set_default_stack_size(&self, size: usize) {
        self.stacks.set_default_stack_size(size);
    }
}

impl fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("max_running_tasks", &self.max_running_tasks())
            .field("max_planned_tasks", &self.max_planned_tasks())
            .field("thread_naming", &self.thread_naming())
            .field("idle_park_timeout", &self.idle_park_timeout())
            .field("max_buffer_size", &self.max_buffer_size())
            .finish()
    }
}

/// 调度器统计快照
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// 存活的工作线程数（含绑定执行器线程）
    pub executors: usize,
    /// 绑定执行器组数量
    pub bind_only_groups: usize,
    /// 计划中尚未开始的任务数
    pub planned: usize,
    /// 已开始且未结束的任务数（含挂起中的）
    pub running: usize,
    /// 等待定时启动的任务数
    pub scheduled: usize,
    /// 恢复队列长度
    pub resumed_queue: usize,
    /// 登记表中的任务数
    pub registered: usize,
    /// 运行时长
    pub uptime: Duration,
    /// 栈分配器统计
    pub stacks: StackStats,
}

/// 一次派发
pub(crate) struct Dispatch {
    task: Arc<Task>,
    /// 已为它预占了一个运行名额
    reserved: bool,
}

impl Dispatch {
    fn new(task: Arc<Task>) -> Self {
        Self { task, reserved: false }
    }
}

/// 调度器
pub struct Scheduler {
    config: ConfigHandle,
    stacks: Arc<StackAllocator>,
    timer: Timer,
    /// 尚未运行过的任务
    planned: TieredQueue,
    /// 从挂起或让出中恢复的任务
    resumed: TieredQueue,
    /// 所有执行器，下标即 ExecutorId
    processors: RwLock<Vec<Arc<Processor>>>,
    /// 存活的工作线程
    machines: Mutex<Vec<Arc<Machine>>>,
    /// 尚未结束的任务，任务结束时移除
    registry: DashMap<TaskId, Arc<Task>>,
    planned_count: CachePadded<AtomicUsize>,
    running_count: CachePadded<AtomicUsize>,
    scheduled_count: CachePadded<AtomicUsize>,
    /// 等待计划队列空位的启动者
    capacity: Mutex<WaitList>,
    /// 等待调度器空闲的调用者
    idle: Mutex<WaitList>,
    next_machine_id: AtomicU64,
    shutdown: AtomicBool,
    start_time: Instant,
}

impl Scheduler {
    /// 创建调度器并启动工作线程
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>, TaskError> {
        let stacks = Arc::new(StackAllocator::new(&config.stack));
        let timer = Timer::start(config.thread_naming).map_err(spawn_error)?;
        let scheduler = Arc::new(Self {
            config: ConfigHandle::new(&config, Arc::clone(&stacks)),
            stacks,
            timer,
            planned: TieredQueue::new(),
            resumed: TieredQueue::new(),
            processors: RwLock::new(Vec::new()),
            machines: Mutex::new(Vec::new()),
            registry: DashMap::new(),
            planned_count: CachePadded::new(AtomicUsize::new(0)),
            running_count: CachePadded::new(AtomicUsize::new(0)),
            scheduled_count: CachePadded::new(AtomicUsize::new(0)),
            capacity: Mutex::new(WaitList::new()),
            idle: Mutex::new(WaitList::new()),
            next_machine_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            start_time: Instant::now(),
        });
        scheduler.create_executor(config.num_workers)?;
        tracing::debug!(workers = config.num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// 全局调度器，第一次使用时以默认配置创建
    pub fn global() -> &'static Arc<Scheduler> {
        GLOBAL.get_or_init(|| match Scheduler::new(SchedulerConfig::default()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                tracing::error!(%err, "failed to start the global scheduler");
                std::process::abort();
            }
        })
    }

    #[inline]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    #[inline]
    pub fn stacks(&self) -> &StackAllocator {
        &self.stacks
    }

    #[inline]
    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// 登记新建的任务
    pub(crate) fn register(&self, task: &Arc<Task>) {
        self.registry.insert(task.id(), Arc::clone(task));
    }

    /// 按 ID 查找尚未结束的任务
    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.registry.get(&id).map(|t| TaskHandle(Arc::clone(t.value())))
    }

    fn processor(&self, id: ExecutorId) -> Option<Arc<Processor>> {
        self.processors.read().get(id).cloned()
    }

    // ==================== 执行器管理 ====================

    /// 增加 `n` 个普通工作线程
    pub fn create_executor(self: &Arc<Self>, n: usize) -> Result<(), TaskError> {
        for _ in 0..n {
            let processor = {
                let mut processors = self.processors.write();
                let p = Arc::new(Processor::new(processors.len(), ExecutorKind::Generic));
                processors.push(Arc::clone(&p));
                p
            };
            let name = self
                .config
                .thread_naming()
                .then(|| format!("{}-{}", WORKER_THREAD_PREFIX, processor.id));
            if let Err(err) = self.spawn_machine(&processor, name) {
                processor.retire();
                return Err(err);
            }
        }
        Ok(())
    }

    /// 减少最多 `n` 个普通工作线程，返回实际减少的数量
    ///
    /// 线程在当前任务切出后退出，其绑定队列里的任务转入全局队列。
    pub fn reduce_executor(&self, n: usize) -> usize {
        let victims: Vec<Arc<Machine>> = {
            let mut machines = self.machines.lock();
            let mut victims = Vec::new();
            let mut i = machines.len();
            while i > 0 && victims.len() < n {
                i -= 1;
                if !machines[i].processor().is_bind_only() {
                    victims.push(machines.remove(i));
                }
            }
            victims
        };
        for machine in &victims {
            machine.stop();
        }
        tracing::debug!(count = victims.len(), "executors reduced");
        victims.len()
    }

    /// 存活的工作线程总数（含绑定执行器线程）
    pub fn total_executors(&self) -> usize {
        self.machines.lock().len()
    }

    /// 创建只执行绑定任务的执行器组，返回其 ID
    ///
    /// `allow_implicit_start` 为真时，在该组上运行的任务启动的新任务默认绑定到同一组。
    pub fn create_bind_only_executor(
        self: &Arc<Self>,
        fixed_count: usize,
        allow_implicit_start: bool,
    ) -> Result<ExecutorId, TaskError> {
        if fixed_count == 0 {
            return Err(TaskError::invalid_operation("bind-only executor needs at least one thread"));
        }
        let processor = {
            let mut processors = self.processors.write();
            let p = Arc::new(Processor::new(
                processors.len(),
                ExecutorKind::BindOnly { allow_implicit_start },
            ));
            processors.push(Arc::clone(&p));
            p
        };
        for i in 0..fixed_count {
            let name = self
                .config
                .thread_naming()
                .then(|| format!("{}-{}-{}", BOUND_THREAD_PREFIX, processor.id, i));
            if let Err(err) = self.spawn_machine(&processor, name) {
                self.retire_processor(&processor);
                return Err(err);
            }
        }
        tracing::debug!(executor = processor.id, fixed_count, "bind-only executor created");
        Ok(processor.id)
    }

    fn spawn_machine(self: &Arc<Self>, processor: &Arc<Processor>, name: Option<String>) -> Result<(), TaskError> {
        let id = self.next_machine_id.fetch_add(1, Ordering::Relaxed);
        let machine = Machine::new(id, Arc::clone(processor), Arc::downgrade(self));
        self.machines.lock().push(Arc::clone(&machine));
        if let Err(err) = machine.start(name) {
            self.machines.lock().retain(|m| m.id != id);
            return Err(spawn_error(err));
        }
        Ok(())
    }

    /// 工作线程退出时调用
    pub(crate) fn machine_exited(&self, machine: &Machine) {
        let processor = machine.processor();
        let still_served = {
            let mut machines = self.machines.lock();
            machines.retain(|m| m.id != machine.id);
            machines.iter().any(|m| Arc::ptr_eq(m.processor(), processor))
        };
        if !still_served {
            self.retire_processor(processor);
        }
    }

    /// 退役执行器，其队列中的任务解除绑定后转入全局队列
    fn retire_processor(&self, processor: &Processor) {
        let leftovers = processor.retire();
        if !leftovers.is_empty() {
            tracing::debug!(executor = processor.id, count = leftovers.len(), "rerouting tasks of retired executor");
        }
        for task in leftovers {
            task.set_binding(None);
            self.reroute(task);
        }
    }

    // ==================== 入队 ====================

    /// 启动任务：放入计划队列，队列已满时挂起调用者
    pub(crate) fn start_task(&self, task: &Arc<Task>) -> Result<(), TaskError> {
        if self.is_shutdown() {
            return Err(TaskError::Shutdown);
        }
        if task.state() != TaskState::Created {
            return Err(TaskError::invalid_operation("task already started"));
        }
        self.inherit_binding(task);
        if let Some(id) = task.binding() {
            if !self.processor(id).is_some_and(|p| !p.is_retired()) {
                return Err(TaskError::invalid_operation(format!("no executor with id {}", id)));
            }
        }

        self.reserve_planned_slot()?;
        if !task.cas_state(TaskState::Created, TaskState::Planned) {
            self.planned_count.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskError::invalid_operation("task already started"));
        }
        tracing::trace!(task = task.id(), priority = ?task.priority(), "task planned");
        self.enqueue_planned(Arc::clone(task));
        Ok(())
    }

    /// 在绑定执行器组上运行的任务启动的新任务继承绑定
    fn inherit_binding(&self, task: &Task) {
        if task.binding().is_some() {
            return;
        }
        let Some(current) = Task::current() else {
            return;
        };
        if let Some(id) = current.binding() {
            if self.processor(id).is_some_and(|p| p.allows_implicit_start()) {
                task.set_binding(Some(id));
            }
        }
    }

    /// 占用一个计划名额；满时挂起直到有任务被派发
    fn reserve_planned_slot(&self) -> Result<(), TaskError> {
        loop {
            let waiters = self.capacity.lock();
            if self.is_shutdown() {
                return Err(TaskError::Shutdown);
            }
            let max = self.config.max_planned_tasks();
            if max == 0 || self.planned_count.load(Ordering::SeqCst) < max {
                self.planned_count.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            let wakeup = park_current(ParkMode::interruptible(None), move |parker| {
                let mut waiters = waiters;
                waiters.push(parker);
            });
            if let Some(err) = wakeup.reason.interrupt() {
                self.capacity.lock().remove(wakeup.token);
                return Err(err);
            }
        }
    }

    /// 延时启动
    pub(crate) fn schedule_task(&self, task: &Arc<Task>, at: Instant) -> Result<(), TaskError> {
        if self.is_shutdown() {
            return Err(TaskError::Shutdown);
        }
        if task.state() != TaskState::Created || !task.mark_scheduled() {
            return Err(TaskError::invalid_operation("task already started or scheduled"));
        }
        self.scheduled_count.fetch_add(1, Ordering::SeqCst);
        self.timer.add(at, TimerAction::Start(Arc::clone(task)));
        tracing::trace!(task = task.id(), "task scheduled");
        Ok(())
    }

    /// 定时器到期：延时任务进入计划队列（不等待计划队列空位）
    pub(crate) fn start_scheduled(&self, task: &Arc<Task>) {
        if !self.is_shutdown() {
            self.planned_count.fetch_add(1, Ordering::SeqCst);
            if task.cas_state(TaskState::Created, TaskState::Planned) {
                self.inherit_binding(task);
                self.enqueue_planned(Arc::clone(task));
            } else {
                self.planned_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.scheduled_count.fetch_sub(1, Ordering::SeqCst);
        self.notify_idle();
    }

    fn enqueue_planned(&self, task: Arc<Task>) {
        self.route(task, &self.planned);
    }

    /// 恢复的任务重新排队
    pub(crate) fn enqueue_resumed(&self, task: Arc<Task>) {
        self.route(task, &self.resumed);
    }

    /// 退役执行器的任务：按是否运行过放入对应的全局队列
    fn reroute(&self, task: Arc<Task>) {
        if task.state() == TaskState::Planned {
            self.enqueue_planned(task);
        } else {
            self.enqueue_resumed(task);
        }
    }

    fn route(&self, task: Arc<Task>, global: &TieredQueue) {
        if self.is_shutdown() {
            return;
        }
        let task = match task.binding() {
            Some(id) => {
                let pushed = match self.processor(id) {
                    Some(p) => p.push(task),
                    None => Err(task),
                };
                match pushed {
                    Ok(()) => {
                        self.wake_worker(Some(id));
                        return;
                    }
                    Err(task) => {
                        tracing::warn!(task = task.id(), executor = id, "bound executor is gone, clearing binding");
                        task.set_binding(None);
                        task
                    }
                }
            }
            None => task,
        };
        global.push(task);
        self.wake_worker(None);
    }

    /// 唤醒一个正在休眠的工作线程
    fn wake_worker(&self, executor: Option<ExecutorId>) {
        fence(Ordering::SeqCst);
        let machines = self.machines.lock();
        let candidate = machines.iter().find(|m| {
            m.is_parking()
                && match executor {
                    Some(id) => m.processor().id == id,
                    None => !m.processor().is_bind_only(),
                }
        });
        if let Some(machine) = candidate {
            machine.unpark();
        }
    }

    // ==================== 取任务 ====================

    /// 工作线程取下一个任务
    pub(crate) fn find_work(&self, processor: &Processor) -> Option<Dispatch> {
        if let Some(task) = processor.pop() {
            return Some(Dispatch::new(task));
        }
        if processor.is_bind_only() {
            return None;
        }
        self.find_shared_work()
    }

    fn find_shared_work(&self) -> Option<Dispatch> {
        if let Some(task) = self.resumed.pop() {
            return Some(Dispatch::new(task));
        }
        self.take_planned()
    }

    /// 从计划队列取任务，受 `max_running_tasks` 限制
    fn take_planned(&self) -> Option<Dispatch> {
        let max = self.config.max_running_tasks();
        if max == 0 {
            return self.planned.pop().map(Dispatch::new);
        }
        if self.planned.is_empty() {
            return None;
        }
        let prev = self.running_count.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            self.release_running();
            return None;
        }
        match self.planned.pop() {
            Some(task) => Some(Dispatch { task, reserved: true }),
            None => {
                self.release_running();
                None
            }
        }
    }

    /// 工作线程休眠前的最后检查
    pub(crate) fn has_work(&self, processor: &Processor) -> bool {
        if processor.has_work() {
            return true;
        }
        if processor.is_bind_only() || self.is_shutdown() {
            return false;
        }
        if !self.resumed.is_empty() {
            return true;
        }
        let max = self.config.max_running_tasks();
        !self.planned.is_empty() && (max == 0 || self.running_count.load(Ordering::SeqCst) < max)
    }

    /// 普通线程等待期间代为执行一个任务
    pub(crate) fn help_once(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        match self.find_shared_work() {
            Some(dispatch) => {
                self.execute(dispatch, None);
                true
            }
            None => false,
        }
    }

    // ==================== 执行 ====================

    /// 在当前线程上运行任务直到它切出
    pub(crate) fn execute(&self, dispatch: Dispatch, processor: Option<&Arc<Processor>>) {
        let Dispatch { task, reserved } = dispatch;

        if task.state() == TaskState::Planned {
            self.admit(reserved);
            if let Some(p) = processor {
                if task.auto_bind() && task.binding().is_none() && !p.is_bind_only() {
                    task.set_binding(Some(p.id));
                }
            }
            if task.is_cancellation_requested() {
                tracing::trace!(task = task.id(), "cancelled before first run");
                self.complete(&task, Err(TaskError::Cancelled));
                return;
            }
            if let Err(err) = task.attach_stack(&self.stacks) {
                tracing::warn!(task = task.id(), %err, "failed to allocate task stack");
                self.complete(&task, Err(err));
                return;
            }
        }

        task.set_state(TaskState::Running);
        let reason = {
            let _active = task.enter_stack();
            let mut slot = RunSlot::new(Arc::as_ptr(&task));
            unsafe { context::resume(task.saved_sp(), &mut slot) }
        };

        match reason {
            SwitchReason::Yield => {
                task.set_state(TaskState::Yielded);
                self.enqueue_resumed(task);
            }
            SwitchReason::Park => park::finish_park(&task),
            SwitchReason::Finished => {
                let outcome = task.take_outcome().unwrap_or(Ok(None));
                self.complete(&task, outcome);
            }
            SwitchReason::None => {
                tracing::error!(task = task.id(), "task switched out without a reason");
                self.complete(&task, Err(TaskError::invalid_operation("task switched out without a reason")));
            }
        }
    }

    /// 第一次派发：从计划转为运行中
    fn admit(&self, reserved: bool) {
        if !reserved {
            self.running_count.fetch_add(1, Ordering::SeqCst);
        }
        self.planned_count.fetch_sub(1, Ordering::SeqCst);
        let mut waiters = self.capacity.lock();
        if !waiters.is_empty() {
            waiters.wake_one(WakeReason::Signaled);
        }
    }

    /// 任务结束：归还栈、发布最终结果、更新计数
    fn complete(&self, task: &Arc<Task>, mut outcome: TaskResultValue) {
        if let Some(region) = task.take_stack() {
            if region.is_overflowed() && outcome.is_ok() {
                outcome = Err(TaskError::StackOverflow);
            }
            self.stacks.deallocate(region);
        }

        if task.cancel_delivered() && !matches!(outcome, Err(TaskError::Cancelled)) {
            tracing::warn!(task = task.id(), "delivered cancellation was not propagated, finishing as cancelled");
            outcome = Err(TaskError::Cancelled);
        }

        let handled = match (&outcome, task.exception_handler()) {
            (Err(err), Some(handler)) if *err != TaskError::Cancelled => {
                Some(match panic::catch_unwind(AssertUnwindSafe(|| handler(err))) {
                    Ok(replacement) => replacement,
                    Err(_) => Err(TaskError::Panicked("exception handler panicked".to_string())),
                })
            }
            _ => None,
        };
        let has_handler = handled.is_some();
        if let Some(replacement) = handled {
            outcome = replacement;
        }

        let state = match &outcome {
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(TaskError::TimedOut) => TaskState::TimedOut,
            _ => TaskState::Finished,
        };
        let unhandled = match &outcome {
            Err(err)
                if *err != TaskError::Cancelled
                    && !has_handler
                    && task.result().waiter_count() == 0 =>
            {
                Some(err.clone())
            }
            _ => None,
        };

        task.set_state(state);
        task.result().final_result(outcome);
        self.registry.remove(&task.id());
        tracing::trace!(task = task.id(), ?state, "task completed");
        self.release_running();

        if let Some(err) = unhandled {
            tracing::warn!(task = task.id(), %err, "unhandled task exception");
            let value = Value::Exception(Arc::new(err));
            if let Err(err) = event::unhandled_exceptions().sync_notify(&value) {
                tracing::warn!(%err, "unhandled exception subscriber failed");
            }
        }
    }

    fn release_running(&self) {
        let prev = self.running_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify_idle();
        }
        if !self.planned.is_empty() {
            self.wake_worker(None);
        }
    }

    // ==================== 等待空闲 ====================

    fn pending(&self, include_scheduled: bool) -> usize {
        let mut n = self.planned_count.load(Ordering::SeqCst) + self.running_count.load(Ordering::SeqCst);
        if include_scheduled {
            n += self.scheduled_count.load(Ordering::SeqCst);
        }
        n
    }

    fn notify_idle(&self) {
        if self.pending(false) == 0 {
            self.idle.lock().wake_all(WakeReason::Signaled);
        }
    }

    /// 阻塞直到没有计划中或运行中的任务
    ///
    /// `be_executor` 让调用线程在等待期间执行任务。不能在任务内调用。
    pub fn await_no_tasks(self: &Arc<Self>, be_executor: bool) -> Result<(), TaskError> {
        self.await_idle(false, be_executor)
    }

    /// 同 `await_no_tasks`，并且等待所有延时启动的任务也结束
    pub fn await_end_tasks(self: &Arc<Self>, be_executor: bool) -> Result<(), TaskError> {
        self.await_idle(true, be_executor)
    }

    fn await_idle(self: &Arc<Self>, include_scheduled: bool, be_executor: bool) -> Result<(), TaskError> {
        if context::on_task_stack() {
            return Err(TaskError::invalid_operation("cannot await the scheduler from inside a task"));
        }
        let helper = be_executor.then_some(self);
        loop {
            let waiters = self.idle.lock();
            if self.pending(include_scheduled) == 0 || self.is_shutdown() {
                return Ok(());
            }
            park_current(
                ParkMode::uninterruptible().with_executor(helper),
                move |parker| {
                    let mut waiters = waiters;
                    waiters.push(parker);
                },
            );
        }
    }

    // ==================== 维护 ====================

    /// 回收句柄已被丢弃、再也不会运行的任务，清空栈池，返回回收的任务数
    ///
    /// 结束的任务在完成时已离开登记表；这里回收的是创建后从未启动的任务。
    pub fn clean_up(&self) -> usize {
        let before = self.registry.len();
        self.registry.retain(|_, task| {
            let state = task.state();
            let dead = state.is_terminal() || state == TaskState::Created;
            !(dead && Arc::strong_count(task) == 1)
        });
        let removed = before.saturating_sub(self.registry.len());
        let freed = self.stacks.clear_pool();
        tracing::debug!(removed, freed_stacks = freed, "scheduler cleaned up");
        removed
    }

    /// 统计快照
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executors: self.total_executors(),
            bind_only_groups: self
                .processors
                .read()
                .iter()
                .filter(|p| p.is_bind_only() && !p.is_retired())
                .count(),
            planned: self.planned_count.load(Ordering::SeqCst),
            running: self.running_count.load(Ordering::SeqCst),
            scheduled: self.scheduled_count.load(Ordering::SeqCst),
            resumed_queue: self.resumed.len(),
            registered: self.registry.len(),
            uptime: self.start_time.elapsed(),
            stacks: self.stacks.stats(),
        }
    }

    /// 关闭调度器：停止所有线程，未结束的任务以 `Shutdown` 结束
    ///
    /// 不能在任务内调用。
    pub fn shutdown(&self) -> Result<(), TaskError> {
        if context::on_task_stack() {
            return Err(TaskError::invalid_operation("cannot shut down the scheduler from inside a task"));
        }
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let machines: Vec<Arc<Machine>> = self.machines.lock().drain(..).collect();
        for machine in &machines {
            machine.stop();
        }
        for machine in &machines {
            if !machine.is_current_thread() {
                machine.join();
            }
        }
        self.timer.stop();

        self.planned.drain();
        self.resumed.drain();
        for processor in self.processors.read().iter() {
            processor.retire();
        }

        let mut abandoned = 0usize;
        for entry in self.registry.iter() {
            let task = entry.value();
            if task.state().is_terminal() {
                continue;
            }
            if let Some(region) = task.take_stack() {
                self.stacks.deallocate(region);
            }
            task.set_state(TaskState::Cancelled);
            task.result().final_result(Err(TaskError::Shutdown));
            abandoned += 1;
        }
        self.registry.clear();

        self.planned_count.store(0, Ordering::SeqCst);
        self.running_count.store(0, Ordering::SeqCst);
        self.scheduled_count.store(0, Ordering::SeqCst);
        self.capacity.lock().wake_all(WakeReason::Signaled);
        self.idle.lock().wake_all(WakeReason::Signaled);

        tracing::debug!(abandoned, "scheduler shut down");
        Ok(())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("executors", &self.total_executors())
            .field("planned", &self.planned_count.load(Ordering::Relaxed))
            .field("running", &self.running_count.load(Ordering::Relaxed))
            .field("scheduled", &self.scheduled_count.load(Ordering::Relaxed))
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for machine in self.machines.get_mut().drain(..) {
            machine.stop();
        }
        self.timer.stop();
    }
}

fn spawn_error(err: std::io::Error) -> TaskError {
    TaskError::Allocation(format!("failed to spawn thread: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::callable;

    fn scheduler(workers: usize) -> Arc<Scheduler> {
        Scheduler::new(SchedulerConfig {
            num_workers: workers,
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_run_single_task() {
        let s = scheduler(2);
        let handle = Task::builder(callable(|args| Ok(args.first().cloned())))
            .args(vec![Value::Int(42)])
            .scheduler(&s)
            .spawn()
            .unwrap();
        assert_eq!(handle.get_result(), Ok(Some(Value::Int(42))));
        assert_eq!(handle.state(), TaskState::Finished);
        s.shutdown().unwrap();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let s = scheduler(1);
        let handle = Task::builder(callable(|_| Ok(None))).scheduler(&s).build();
        handle.start().unwrap();
        assert!(matches!(handle.start(), Err(TaskError::InvalidOperation(_))));
        handle.await_task().unwrap();
        s.shutdown().unwrap();
    }

    #[test]
    fn test_executor_resizing() {
        let s = scheduler(2);
        assert_eq!(s.total_executors(), 2);
        s.create_executor(2).unwrap();
        assert_eq!(s.total_executors(), 4);
        assert_eq!(s.reduce_executor(3), 3);
        assert_eq!(s.total_executors(), 1);

        let handle = Task::builder(callable(|_| Ok(Some(Value::Bool(true)))))
            .scheduler(&s)
            .spawn()
            .unwrap();
        assert_eq!(handle.get_result(), Ok(Some(Value::Bool(true))));
        s.shutdown().unwrap();
    }

    #[test]
    fn test_bind_only_executor_runs_bound_tasks() {
        let s = scheduler(1);
        let id = s.create_bind_only_executor(1, false).unwrap();
        assert_eq!(s.total_executors(), 2);
        assert_eq!(s.stats().bind_only_groups, 1);

        let handle = Task::builder(callable(|_| {
            let name = std::thread::current().name().map(str::to_string);
            Ok(name.map(|n| Value::str(&n)))
        }))
        .scheduler(&s)
        .build();
        handle.start_on(id).unwrap();
        let expected = format!("{}-{}-0", BOUND_THREAD_PREFIX, id);
        assert_eq!(handle.get_result(), Ok(Some(Value::str(&expected))));
        s.shutdown().unwrap();
    }

    #[test]
    fn test_start_on_unknown_executor() {
        let s = scheduler(1);
        let handle = Task::builder(callable(|_| Ok(None))).scheduler(&s).build();
        assert!(matches!(handle.start_on(99), Err(TaskError::InvalidOperation(_))));
        assert_eq!(handle.state(), TaskState::Created);
        s.shutdown().unwrap();
    }

    #[test]
    fn test_scheduled_start() {
        let s = scheduler(1);
        let start = Instant::now();
        let handle = Task::builder(callable(|_| Ok(None))).scheduler(&s).build();
        handle.schedule(Duration::from_millis(30)).unwrap();
        assert_eq!(s.stats().scheduled, 1);
        assert!(handle.schedule(Duration::from_millis(30)).is_err());

        s.await_end_tasks(false).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(handle.is_finished());
        s.shutdown().unwrap();
    }

    #[test]
    fn test_cancel_before_first_run() {
        let s = scheduler(1);
        s.config().set_max_running_tasks(1);
        let gate = Arc::new(AtomicBool::new(false));
        let gate2 = Arc::clone(&gate);
        let blocker = Task::builder(callable(move |_| {
            while !gate2.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            Ok(None)
        }))
        .scheduler(&s)
        .spawn()
        .unwrap();

        let victim = Task::builder(callable(|_| Ok(Some(Value::Int(1)))))
            .scheduler(&s)
            .spawn()
            .unwrap();
        victim.notify_cancel();
        gate.store(true, Ordering::Release);

        blocker.await_task().unwrap();
        assert_eq!(victim.get_result(), Err(TaskError::Cancelled));
        assert_eq!(victim.state(), TaskState::Cancelled);
        assert_eq!(s.stats().stacks.outstanding, 0);
        s.shutdown().unwrap();
    }

    #[test]
    fn test_exception_handler_replaces_error() {
        let s = scheduler(1);
        let handle = Task::builder(callable(|_| Err(TaskError::Thrown(Value::Int(7)))))
            .exception_handler(Arc::new(|err: &TaskError| match err {
                TaskError::Thrown(v) => Ok(Some(v.clone())),
                other => Err(other.clone()),
            }))
            .scheduler(&s)
            .spawn()
            .unwrap();
        assert_eq!(handle.get_result(), Ok(Some(Value::Int(7))));
        s.shutdown().unwrap();
    }

    #[test]
    fn test_panic_becomes_error() {
        let s = scheduler(1);
        let handle = Task::builder(callable(|_| panic!("boom")))
            .scheduler(&s)
            .spawn()
            .unwrap();
        assert_eq!(handle.get_result(), Err(TaskError::Panicked("boom".to_string())));
        assert_eq!(handle.state(), TaskState::Finished);
        s.shutdown().unwrap();
    }

    fn eventually(what: &str, cond: impl Fn() -> bool) {
        let limit = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < limit, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_finished_tasks_are_freed_without_clean_up() {
        let s = scheduler(2);
        let handles: Vec<_> = (0..200)
            .map(|_| Task::builder(callable(|_| Ok(None))).scheduler(&s).spawn().unwrap())
            .collect();
        crate::runtime::await_multiple(&handles, false).unwrap();
        let weak: Vec<_> = handles.iter().map(|h| Arc::downgrade(&h.0)).collect();
        drop(handles);

        eventually("registry to empty", || s.stats().registered == 0);
        eventually("tasks to be dropped", || weak.iter().all(|w| w.upgrade().is_none()));
        s.shutdown().unwrap();
    }

    #[test]
    fn test_pending_timeout_does_not_pin_finished_task() {
        let s = scheduler(2);
        let mutex = Arc::new(crate::sync::TaskMutex::new());
        mutex.lock().unwrap();

        let handle = {
            let mutex = Arc::clone(&mutex);
            Task::builder(callable(move |_| {
                mutex.lock()?;
                mutex.unlock()?;
                Ok(None)
            }))
            .timeout(Duration::from_secs(60))
            .scheduler(&s)
            .spawn()
            .unwrap()
        };
        eventually("task to park", || handle.state() == TaskState::Suspended);
        mutex.unlock().unwrap();
        assert_eq!(handle.get_result(), Ok(None));

        let weak = Arc::downgrade(&handle.0);
        drop(handle);
        eventually("task to be dropped", || weak.upgrade().is_none());
        s.shutdown().unwrap();
    }

    #[test]
    fn test_clean_up_reclaims_never_started_tasks() {
        let s = scheduler(1);
        for _ in 0..3 {
            drop(Task::builder(callable(|_| Ok(None))).scheduler(&s).build());
        }
        let kept = Task::builder(callable(|_| Ok(None))).scheduler(&s).build();
        assert_eq!(s.stats().registered, 4);

        assert_eq!(s.clean_up(), 3);
        assert_eq!(s.stats().registered, 1);
        assert!(s.task(kept.id()).is_some());

        kept.start().unwrap();
        kept.await_task().unwrap();
        eventually("finished task to leave the registry", || s.task(kept.id()).is_none());
        s.shutdown().unwrap();
    }

    #[test]
    fn test_await_no_tasks_as_executor() {
        let s = scheduler(0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            Task::builder(callable(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }))
            .scheduler(&s)
            .spawn()
            .unwrap();
        }
        s.await_no_tasks(true).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        s.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_finishes_pending_tasks() {
        let s = scheduler(0);
        let handle = Task::builder(callable(|_| Ok(None))).scheduler(&s).spawn().unwrap();
        s.shutdown().unwrap();
        assert_eq!(handle.get_result(), Err(TaskError::Shutdown));
        assert!(matches!(
            Task::builder(callable(|_| Ok(None))).scheduler(&s).spawn(),
            Err(TaskError::Shutdown)
        ));
    }
}
