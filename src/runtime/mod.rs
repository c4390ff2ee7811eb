//! 任务运行时
//!
//! 协作式 M:N 调度：任意数量的任务在一组工作线程上复用，
//! 每个任务有自己的调用栈，只在挂起点交出执行权。
//!
//! 核心组件：
//! - Task: 任务，包含可调用对象、结果通道和按需分配的调用栈
//! - Processor: 执行器队列，普通工作线程私有或由绑定执行器组共享
//! - Machine: 操作系统线程，执行任务
//! - Scheduler: 全局队列、计数、定时器和任务登记表

mod context;
pub mod machine;
pub(crate) mod park;
pub mod processor;
pub mod queue;
pub mod result;
pub mod scheduler;
pub mod stack;
pub mod task;
pub mod this_task;
mod timer;

pub use park::{ExecutionId, WakeReason};
pub use processor::{ExecutorKind, Processor, ProcessorStatus};
pub use queue::TieredQueue;
pub use result::TaskResult;
pub use scheduler::{ConfigHandle, Scheduler, SchedulerConfig, SchedulerStats};
pub use stack::{StackAllocator, StackBackend, StackConfig, StackRegion, StackStats, NEVER_POOL};
pub use task::{
    await_multiple, await_results, ExecutorId, Priority, Task, TaskBuilder, TaskHandle, TaskId, TaskState,
};
pub use this_task::LandingPad;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
