//! 值与可调用对象
//!
//! 动态值系统由外部提供，这里只保留调度核心需要的最小表示。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{TaskError, TaskResultValue};

/// 运行时值
#[derive(Clone)]
pub enum Value {
    /// 空值
    Null,
    /// 布尔值
    Bool(bool),
    /// 整数
    Int(i64),
    /// 浮点数
    Float(f64),
    /// 字符串
    Str(Arc<str>),
    /// 列表（多返回值也用它承载）
    List(Arc<Vec<Value>>),
    /// 异常对象
    Exception(Arc<TaskError>),
    /// 外部不透明对象
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// 构造字符串值
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    /// 构造列表值
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    /// 取整数
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// 取布尔值
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 取异常
    pub fn as_exception(&self) -> Option<&TaskError> {
        match self {
            Value::Exception(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Exception(e) => write!(f, "Exception({})", e),
            Value::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

/// 任务可调用对象：接收参数向量，返回可选的结果值
pub type Callable = Arc<dyn Fn(&[Value]) -> TaskResultValue + Send + Sync>;

/// 异常处理器：先于结果通道接收异常，可以给出替代结果
pub type ExceptionHandler = Arc<dyn Fn(&TaskError) -> TaskResultValue + Send + Sync>;

/// 把闭包包装成 Callable
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&[Value]) -> TaskResultValue + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Int(3), Value::from(3));
        assert_eq!(Value::str("a"), Value::from("a"));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Null]),
            Value::list(vec![Value::Int(1), Value::Null])
        );
    }

    #[test]
    fn test_opaque_identity() {
        let inner: Arc<dyn Any + Send + Sync> = Arc::new(5u32);
        let a = Value::Opaque(Arc::clone(&inner));
        let b = Value::Opaque(inner);
        let c = Value::Opaque(Arc::new(5u32));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_callable_invoke() {
        let add = callable(|args| {
            let sum: i64 = args.iter().filter_map(Value::as_int).sum();
            Ok(Some(Value::Int(sum)))
        });
        assert_eq!(add(&[Value::Int(2), Value::Int(40)]).unwrap(), Some(Value::Int(42)));
    }
}
