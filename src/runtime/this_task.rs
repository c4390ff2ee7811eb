//! 当前任务的操作
//!
//! 这些函数在任务内调用时作用于当前任务；在普通线程上调用时，
//! `sleep` 阻塞线程，`yield_now` 让出时间片，其余要么无操作要么返回错误。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::{self, SwitchReason};
use super::park::{park_current, ExecutionId, ParkMode};
use super::task::{Task, TaskHandle};
use crate::error::TaskError;
use crate::value::Value;

/// 当前任务的句柄
pub fn current() -> Option<TaskHandle> {
    Task::current().map(TaskHandle)
}

/// 当前执行体：任务或普通线程
pub fn execution_id() -> ExecutionId {
    ExecutionId::current()
}

/// 挂起当前任务至少 `duration`
///
/// 期间收到取消或任务超时会提前返回对应错误。
pub fn sleep(duration: Duration) -> Result<(), TaskError> {
    sleep_until(Instant::now() + duration)
}

/// 挂起到指定时刻
pub fn sleep_until(deadline: Instant) -> Result<(), TaskError> {
    let wakeup = park_current(ParkMode::interruptible(Some(deadline)), |_| {});
    match wakeup.reason.interrupt() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// 让出执行权，任务重新排到恢复队列末尾
pub fn yield_now() -> Result<(), TaskError> {
    let Some(task) = Task::current() else {
        std::thread::yield_now();
        return Ok(());
    };
    task.check_interrupts()?;
    let sp = task.sp_ptr();
    drop(task);
    unsafe { context::suspend(sp, SwitchReason::Yield) };
    Ok(())
}

/// 检查待投递的取消或栈溢出
pub fn check_cancellation() -> Result<(), TaskError> {
    match Task::current() {
        Some(task) => task.check_interrupts(),
        None => Ok(()),
    }
}

/// 取消当前任务，返回应当向上传播的取消错误
pub fn self_cancel() -> TaskError {
    match Task::current() {
        Some(task) => {
            task.request_cancel();
            task.mark_cancel_delivered();
            TaskError::Cancelled
        }
        None => TaskError::invalid_operation("self_cancel called outside of a task"),
    }
}

/// 产出一个中间结果
pub fn yield_result(value: Value) -> Result<(), TaskError> {
    let task = Task::current()
        .ok_or_else(|| TaskError::invalid_operation("yield_result called outside of a task"))?;
    task.result().yield_value(value)
}

/// 预先提交当前栈指针以下 `bytes` 字节
pub fn prepare_stack(bytes: usize) -> Result<(), TaskError> {
    match Task::current() {
        Some(task) => task.prepare_stack(bytes),
        None => Ok(()),
    }
}

/// 释放当前栈指针以下超出 `threshold` 字节的已提交页，返回是否释放了内存
pub fn shrink_stack(threshold: usize) -> bool {
    match Task::current() {
        Some(task) => task.shrink_stack(threshold),
        None => false,
    }
}

/// 进入取消着陆区
pub fn enter_landing_pad() -> LandingPad {
    LandingPad { task: Task::current() }
}

/// 取消着陆区
///
/// 已投递给任务的取消必须继续向上传播；只有在着陆区里显式调用
/// `suppress` 才能吞掉它，任务随后可以正常结束。
pub struct LandingPad {
    task: Option<Arc<Task>>,
}

impl LandingPad {
    /// 是否有已投递的取消
    pub fn has_cancellation(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.cancel_delivered())
    }

    /// 吞掉已投递的取消，并清除取消请求
    pub fn suppress(self) {
        if let Some(task) = &self.task {
            task.suppress_cancel();
            tracing::debug!(task = task.id(), "cancellation suppressed in landing pad");
        }
    }
}

impl std::fmt::Debug for LandingPad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LandingPad")
            .field("task", &self.task.as_ref().map(|t| t.id()))
            .finish()
    }
}
