//! 事件系统
//!
//! 五级优先级的发布/订阅分发器。每一级有同步和异步两个订阅列表：
//! - `notify`：按级别顺序调用同步订阅者，遇到第一个返回“已处理”的就停止
//! - `sync_notify`：调用全部同步订阅者
//! - `async_notify`：启动一个任务依次调用全部异步订阅者
//! - `await_notify`：每个异步订阅者一个任务，等待全部结束
//!
//! 分发前先复制订阅列表，订阅者在回调中 join/leave 不会死锁。

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::TaskError;
use crate::runtime::{await_results, Priority, Scheduler, Task, TaskBuilder, TaskHandle};
use crate::value::{callable, Callable, Value};

/// 订阅者：返回 `Ok(true)` 表示事件已处理
pub type Subscriber = Arc<dyn Fn(&Value) -> Result<bool, TaskError> + Send + Sync>;

/// 把闭包包装成订阅者
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&Value) -> Result<bool, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sync,
    Async,
}

#[derive(Default)]
struct Tier {
    sync: Vec<Subscriber>,
    asynchronous: Vec<Subscriber>,
}

impl Tier {
    fn list_mut(&mut self, mode: DispatchMode) -> &mut Vec<Subscriber> {
        match mode {
            DispatchMode::Sync => &mut self.sync,
            DispatchMode::Async => &mut self.asynchronous,
        }
    }

    fn list(&self, mode: DispatchMode) -> &[Subscriber] {
        match mode {
            DispatchMode::Sync => &self.sync,
            DispatchMode::Async => &self.asynchronous,
        }
    }
}

/// 事件系统
pub struct EventSystem {
    tiers: RwLock<[Tier; Priority::COUNT]>,
    scheduler: Option<Arc<Scheduler>>,
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSystem {
    /// 异步分发使用全局调度器
    pub fn new() -> Self {
        Self {
            tiers: RwLock::new(Default::default()),
            scheduler: None,
        }
    }

    /// 异步分发使用指定调度器
    pub fn with_scheduler(scheduler: &Arc<Scheduler>) -> Self {
        Self {
            tiers: RwLock::new(Default::default()),
            scheduler: Some(Arc::clone(scheduler)),
        }
    }

    /// 加入订阅
    pub fn join(&self, priority: Priority, mode: DispatchMode, subscriber: Subscriber) {
        self.tiers.write()[priority.tier()].list_mut(mode).push(subscriber);
    }

    /// 移除订阅，不是成员时什么也不做
    pub fn leave(&self, priority: Priority, mode: DispatchMode, subscriber: &Subscriber) -> bool {
        let mut tiers = self.tiers.write();
        let list = tiers[priority.tier()].list_mut(mode);
        match list.iter().position(|s| Arc::ptr_eq(s, subscriber)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 从所有级别和列表中移除该订阅者，返回移除的数量
    pub fn leave_all(&self, subscriber: &Subscriber) -> usize {
        let mut tiers = self.tiers.write();
        let mut removed = 0;
        for tier in tiers.iter_mut() {
            for mode in [DispatchMode::Sync, DispatchMode::Async] {
                let list = tier.list_mut(mode);
                let before = list.len();
                list.retain(|s| !Arc::ptr_eq(s, subscriber));
                removed += before - list.len();
            }
        }
        removed
    }

    /// 订阅者数量
    pub fn len(&self, mode: DispatchMode) -> usize {
        self.tiers.read().iter().map(|t| t.list(mode).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len(DispatchMode::Sync) == 0 && self.len(DispatchMode::Async) == 0
    }

    /// 按级别从高到低复制订阅列表
    fn snapshot(&self, mode: DispatchMode) -> Vec<Subscriber> {
        let tiers = self.tiers.read();
        tiers.iter().flat_map(|t| t.list(mode).iter().cloned()).collect()
    }

    /// 依次调用同步订阅者，直到有一个处理了事件
    pub fn notify(&self, value: &Value) -> Result<bool, TaskError> {
        for sub in self.snapshot(DispatchMode::Sync) {
            if sub(value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 调用全部同步订阅者，返回第一个错误
    pub fn sync_notify(&self, value: &Value) -> Result<(), TaskError> {
        let mut first_err = None;
        for sub in self.snapshot(DispatchMode::Sync) {
            if let Err(err) = sub(value) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn task_builder(&self, body: Callable) -> TaskBuilder {
        let builder = Task::builder(body).name("event-dispatch");
        match &self.scheduler {
            Some(s) => builder.scheduler(s),
            None => builder,
        }
    }

    /// 启动一个任务依次调用全部异步订阅者
    ///
    /// 任务的最终值是 `Bool`，表示是否有订阅者处理了事件；
    /// 订阅者出错时继续调用其余订阅者，任务以第一个错误结束。
    pub fn async_notify(&self, value: Value) -> Result<TaskHandle, TaskError> {
        let subs = self.snapshot(DispatchMode::Async);
        let body = callable(move |_| {
            let mut handled = false;
            let mut first_err = None;
            for sub in &subs {
                match sub(&value) {
                    Ok(h) => handled |= h,
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(Some(Value::Bool(handled))),
            }
        });
        self.task_builder(body).spawn()
    }

    /// 每个异步订阅者一个任务，等待全部结束
    ///
    /// 按级别顺序返回各订阅者的“已处理”标志；任一订阅者出错则返回该错误。
    pub fn await_notify(&self, value: Value) -> Result<Vec<bool>, TaskError> {
        let handles = self
            .snapshot(DispatchMode::Async)
            .into_iter()
            .map(|sub| {
                let value = value.clone();
                let body = callable(move |_| sub(&value).map(|h| Some(Value::Bool(h))));
                self.task_builder(body).spawn()
            })
            .collect::<Result<Vec<_>, _>>()?;

        await_results(&handles, true)?
            .into_iter()
            .map(|r| r.map(|v| v.and_then(|v| v.as_bool()).unwrap_or(false)))
            .collect()
    }
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("sync", &self.len(DispatchMode::Sync))
            .field("async", &self.len(DispatchMode::Async))
            .finish()
    }
}

/// 进程级的未处理异常通道
///
/// 没有异常处理器、也没有等待者的任务失败时，以 `Value::Exception` 同步通知这里的订阅者。
pub fn unhandled_exceptions() -> &'static EventSystem {
    static CHANNEL: OnceLock<EventSystem> = OnceLock::new();
    CHANNEL.get_or_init(EventSystem::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SchedulerConfig;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str, handled: bool) -> Subscriber {
        let log = Arc::clone(log);
        subscriber(move |_| {
            log.lock().push(tag);
            Ok(handled)
        })
    }

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::new(SchedulerConfig {
            num_workers: 2,
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_notify_order_and_short_circuit() {
        let events = EventSystem::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        events.join(Priority::Low, DispatchMode::Sync, recorder(&log, "low", true));
        events.join(Priority::High, DispatchMode::Sync, recorder(&log, "high", false));
        events.join(Priority::Avg, DispatchMode::Sync, recorder(&log, "avg", true));

        assert_eq!(events.notify(&Value::Null), Ok(true));
        assert_eq!(*log.lock(), vec!["high", "avg"]);

        log.lock().clear();
        events.sync_notify(&Value::Null).unwrap();
        assert_eq!(*log.lock(), vec!["high", "avg", "low"]);
    }

    #[test]
    fn test_sync_notify_reports_first_error_after_calling_all() {
        let events = EventSystem::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        events.join(
            Priority::High,
            DispatchMode::Sync,
            subscriber(|_| Err(TaskError::Thrown(Value::Int(1)))),
        );
        events.join(Priority::Low, DispatchMode::Sync, recorder(&log, "low", false));
        assert_eq!(events.sync_notify(&Value::Null), Err(TaskError::Thrown(Value::Int(1))));
        assert_eq!(*log.lock(), vec!["low"]);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let events = EventSystem::new();
        let sub = subscriber(|_| Ok(false));
        events.join(Priority::Avg, DispatchMode::Sync, Arc::clone(&sub));
        events.join(Priority::Low, DispatchMode::Async, Arc::clone(&sub));
        assert!(events.leave(Priority::Avg, DispatchMode::Sync, &sub));
        assert!(!events.leave(Priority::Avg, DispatchMode::Sync, &sub));
        assert!(!events.leave(Priority::High, DispatchMode::Async, &subscriber(|_| Ok(true))));
        assert_eq!(events.leave_all(&sub), 1);
        assert!(events.is_empty());
    }

    #[test]
    fn test_async_notify_runs_in_task() {
        let sched = scheduler();
        let events = EventSystem::with_scheduler(&sched);
        let log = Arc::new(Mutex::new(Vec::new()));
        events.join(Priority::UpperAvg, DispatchMode::Async, recorder(&log, "a", false));
        events.join(Priority::LowerAvg, DispatchMode::Async, recorder(&log, "b", true));

        let handle = events.async_notify(Value::Int(7)).unwrap();
        assert_eq!(handle.get_result(), Ok(Some(Value::Bool(true))));
        assert_eq!(*log.lock(), vec!["a", "b"]);
        sched.shutdown().unwrap();
    }

    #[test]
    fn test_await_notify_collects_flags() {
        let sched = scheduler();
        let events = EventSystem::with_scheduler(&sched);
        events.join(Priority::Low, DispatchMode::Async, subscriber(|v| Ok(v.as_int() == Some(1))));
        events.join(Priority::High, DispatchMode::Async, subscriber(|_| Ok(false)));

        assert_eq!(events.await_notify(Value::Int(1)), Ok(vec![false, true]));
        assert_eq!(events.await_notify(Value::Int(2)), Ok(vec![false, false]));
        sched.shutdown().unwrap();
    }
}
