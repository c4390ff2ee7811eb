//! 运行时错误类型
//!
//! `TaskError` 同时充当任务的异常对象：可以被抛出、携带在 TaskResult 中并被检查。

use crate::value::Value;

/// 任务最终结果：返回值或异常
pub type TaskResultValue = Result<Option<Value>, TaskError>;

/// 任务异常
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// 任务被取消（在挂起点投递）
    #[error("task cancelled")]
    Cancelled,

    /// 任务在挂起期间超时
    #[error("task timed out")]
    TimedOut,

    /// 任务栈溢出（保护页被触发）
    #[error("stack overflow")]
    StackOverflow,

    /// 锁的误用：重复解锁、非持有者解锁、非递归锁重入
    #[error("invalid lock operation: {0}")]
    InvalidLock(String),

    /// 其他非法操作
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// 栈内存分配失败
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// 计划队列已满
    #[error("planned queue is full")]
    QueueFull,

    /// 用户代码抛出的异常
    #[error("exception thrown: {0:?}")]
    Thrown(Value),

    /// 任务体发生 panic
    #[error("task panicked: {0}")]
    Panicked(String),

    /// 调度器已关闭
    #[error("scheduler is shut down")]
    Shutdown,
}

impl TaskError {
    /// 是否是协作式中断（取消、超时、栈溢出）
    #[inline]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::TimedOut | TaskError::StackOverflow)
    }

    /// 构造锁误用错误
    pub(crate) fn invalid_lock(msg: impl Into<String>) -> Self {
        TaskError::InvalidLock(msg.into())
    }

    /// 构造非法操作错误
    pub(crate) fn invalid_operation(msg: impl Into<String>) -> Self {
        TaskError::InvalidOperation(msg.into())
    }
}
