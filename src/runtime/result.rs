//! 任务结果通道
//!
//! 一个任务可以先产出若干中间值（生成器式），最后给出最终值或异常。
//! 最终值写入后通道进入生命周期终点：不再接受新值，所有等待者都被唤醒。
//! 多个消费者可以同时等待同一个任务。

use std::sync::Arc;

use parking_lot::Mutex;

use super::park::{park_current, ParkMode, WaitList, WakeReason};
use super::scheduler::Scheduler;
use crate::error::{TaskError, TaskResultValue};
use crate::value::Value;

#[derive(Debug, Default)]
struct ResultInner {
    yielded: Vec<Value>,
    final_value: Option<TaskResultValue>,
    end_of_life: bool,
    waiters: WaitList,
}

/// 任务结果通道
#[derive(Debug, Default)]
pub struct TaskResult {
    inner: Mutex<ResultInner>,
}

impl TaskResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加中间值并唤醒等待者
    pub fn yield_value(&self, value: Value) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        if inner.end_of_life {
            return Err(TaskError::invalid_operation("yield after the final result"));
        }
        inner.yielded.push(value);
        inner.waiters.wake_all(WakeReason::Signaled);
        Ok(())
    }

    /// 写入最终值，结束通道；重复调用被忽略
    pub fn final_result(&self, value: TaskResultValue) -> bool {
        let mut inner = self.inner.lock();
        if inner.end_of_life {
            return false;
        }
        inner.final_value = Some(value);
        inner.end_of_life = true;
        inner.waiters.wake_all(WakeReason::Signaled);
        true
    }

    /// 是否已结束
    pub fn is_end_of_life(&self) -> bool {
        self.inner.lock().end_of_life
    }

    /// 已产出的中间值数量
    pub fn yielded_len(&self) -> usize {
        self.inner.lock().yielded.len()
    }

    /// 当前挂在通道上的等待者数量
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// 不等待地读取最终值
    pub fn try_final(&self) -> Option<TaskResultValue> {
        self.inner.lock().final_value.clone()
    }

    /// 等待通道结束并返回最终值
    ///
    /// 外层错误表示等待者自身被取消或超时，内层是任务的最终值。
    pub fn wait_final(&self, executor: Option<&Arc<Scheduler>>) -> Result<TaskResultValue, TaskError> {
        self.wait_until(executor, |inner| {
            inner
                .end_of_life
                .then(|| inner.final_value.clone().unwrap_or(Ok(None)))
        })
    }

    /// 第 `n` 个值：先是中间值，紧接着是最终值；超出范围得到 `None`
    pub fn get(&self, n: usize, executor: Option<&Arc<Scheduler>>) -> Result<TaskResultValue, TaskError> {
        self.wait_until(executor, |inner| {
            if let Some(value) = inner.yielded.get(n) {
                return Some(Ok(Some(value.clone())));
            }
            if !inner.end_of_life {
                return None;
            }
            if n == inner.yielded.len() {
                Some(inner.final_value.clone().unwrap_or(Ok(None)))
            } else {
                Some(Ok(None))
            }
        })
    }

    /// 挂起直到 `ready` 给出值；等待者被取消或超时时返回对应错误
    fn wait_until<T, F>(&self, executor: Option<&Arc<Scheduler>>, ready: F) -> Result<T, TaskError>
    where
        F: Fn(&ResultInner) -> Option<T>,
    {
        loop {
            let inner = self.inner.lock();
            if let Some(value) = ready(&*inner) {
                return Ok(value);
            }
            let wakeup = park_current(
                ParkMode::interruptible(None).with_executor(executor),
                move |parker| {
                    let mut inner = inner;
                    inner.waiters.push(parker);
                },
            );
            if let Some(err) = wakeup.reason.interrupt() {
                self.inner.lock().waiters.remove(wakeup.token);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_yield_then_final() {
        let result = TaskResult::new();
        result.yield_value(Value::Int(1)).unwrap();
        result.yield_value(Value::Int(2)).unwrap();
        assert!(result.final_result(Ok(Some(Value::Int(3)))));

        assert_eq!(result.get(0, None), Ok(Ok(Some(Value::Int(1)))));
        assert_eq!(result.get(2, None), Ok(Ok(Some(Value::Int(3)))));
        assert_eq!(result.get(5, None), Ok(Ok(None)));
        assert_eq!(result.wait_final(None), Ok(Ok(Some(Value::Int(3)))));
    }

    #[test]
    fn test_no_yield_after_end_of_life() {
        let result = TaskResult::new();
        assert!(result.final_result(Err(TaskError::Cancelled)));
        assert!(!result.final_result(Ok(None)));
        assert!(matches!(
            result.yield_value(Value::Null),
            Err(TaskError::InvalidOperation(_))
        ));
        assert_eq!(result.wait_final(None), Ok(Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_final_wakes_every_waiter() {
        let result = Arc::new(TaskResult::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&result);
                thread::spawn(move || r.wait_final(None))
            })
            .collect();

        while result.waiter_count() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        result.final_result(Ok(Some(Value::str("done"))));
        for w in waiters {
            assert_eq!(w.join().unwrap(), Ok(Ok(Some(Value::str("done")))));
        }
    }

    #[test]
    fn test_get_parks_until_yield() {
        let result = Arc::new(TaskResult::new());
        let r = Arc::clone(&result);
        let reader = thread::spawn(move || r.get(0, None));
        while result.waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        result.yield_value(Value::Int(9)).unwrap();
        assert_eq!(reader.join().unwrap(), Ok(Ok(Some(Value::Int(9)))));
    }
}
