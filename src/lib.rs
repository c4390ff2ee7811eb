//! fibra：协作式任务调度器
//!
//! 任意数量的任务在一组工作线程上复用，每个任务拥有带保护页的独立调用栈，
//! 只在挂起点（加锁、等待、睡眠、让出）交出执行权。
//!
//! - `runtime`：栈分配器、任务状态机、调度器与执行器
//! - `sync`：感知任务的互斥锁、读写锁、条件变量、信号量和限制器
//! - `event`：五级优先级的事件分发
//!
//! ```no_run
//! use fibra::{callable, Task, Value};
//!
//! let task = Task::builder(callable(|args| Ok(args.first().cloned())))
//!     .args(vec![Value::Int(42)])
//!     .spawn()?;
//! assert_eq!(task.get_result()?, Some(Value::Int(42)));
//! # Ok::<(), fibra::TaskError>(())
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod runtime;
pub mod sync;
pub mod value;

pub use error::{TaskError, TaskResultValue};
pub use event::{DispatchMode, EventSystem, Subscriber};
pub use runtime::{
    await_results, this_task, ExecutorId, Priority, Scheduler, SchedulerConfig, Task, TaskBuilder, TaskHandle,
    TaskId, TaskState,
};
pub use sync::{
    TaskCondvar, TaskLimiter, TaskMutex, TaskRecursiveMutex, TaskRwMutex, TaskSemaphore,
};
pub use value::{callable, Callable, ExceptionHandler, Value};
