//! 错误与拒绝原因
//!

use std::any::{Any, type_name};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use thiserror::Error;

///
/// 异步承诺运行时的错误
///
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// 状态错误，例如重复完成或在未保留时重复消费
    #[error("Invalid state, reason: {0}")]
    InvalidState(&'static str),
    /// 对象已释放，例如在已释放的取消源上注册回调
    #[error("Object disposed, reason: {0}")]
    Disposed(&'static str),
    /// 参数错误
    #[error("Invalid argument, reason: {0}")]
    InvalidArgument(&'static str),
    /// 多个异常的聚合
    #[error(transparent)]
    Aggregate(#[from] AggregateException),
}

// 可以作为拒绝原因的值
trait ReasonValue: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<E: Any + Debug + Send + Sync> ReasonValue for E {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

///
/// 拒绝原因，可以是任意满足Debug + Send + Sync的值，克隆的代价很小
///
#[derive(Clone)]
pub struct RejectReason {
    inner:      Arc<dyn ReasonValue>,   //原因
    type_name:  &'static str,           //原因的类型名
}

impl RejectReason {
    /// 用指定的值构建拒绝原因，如果值本身就是拒绝原因，则直接使用
    pub fn new<E: Any + Debug + Send + Sync>(reason: E) -> Self {
        if let Some(reason) = (&reason as &dyn Any).downcast_ref::<RejectReason>() {
            return reason.clone();
        }

        RejectReason {
            inner: Arc::new(reason),
            type_name: type_name::<E>(),
        }
    }

    /// 用捕获的panic负载构建拒绝原因
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        //以拒绝原因或聚合异常展开的panic，保留原始的值
        if let Some(reason) = payload.downcast_ref::<RejectReason>() {
            return reason.clone();
        }
        if let Some(aggregate) = payload.downcast_ref::<AggregateException>() {
            return RejectReason::new(aggregate.clone());
        }

        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        RejectReason::new(PanicError { message })
    }

    /// 获取原因的类型名
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 判断原因是否是指定类型
    pub fn is<E: Any>(&self) -> bool {
        self.inner.as_any().is::<E>()
    }

    /// 获取指定类型的原因的引用
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.inner.as_any().downcast_ref::<E>()
    }

    /// 判断两个拒绝原因是否共享同一个值
    pub fn ptr_eq(&self, other: &RejectReason) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.inner, f)
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = self.downcast_ref::<&'static str>() {
            return f.write_str(message);
        }
        if let Some(message) = self.downcast_ref::<String>() {
            return f.write_str(message);
        }
        if let Some(error) = self.downcast_ref::<PromiseError>() {
            return Display::fmt(error, f);
        }
        if let Some(error) = self.downcast_ref::<AggregateException>() {
            return Display::fmt(error, f);
        }
        if let Some(error) = self.downcast_ref::<PanicError>() {
            return Display::fmt(error, f);
        }

        Debug::fmt(&*self.inner, f)
    }
}

///
/// 用户回调中发生的panic，被捕获后作为拒绝原因
///
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Callback panicked, reason: {message}")]
pub struct PanicError {
    pub message: String,
}

///
/// 聚合异常，按优先级顺序保存所有内部原因
///
#[derive(Debug, Clone, Error)]
#[error("One or more errors occurred, count: {}", inner.len())]
pub struct AggregateException {
    inner: Vec<RejectReason>,
}

impl PartialEq for AggregateException {
    fn eq(&self, other: &Self) -> bool {
        self.inner.len() == other.inner.len()
            && self.inner.iter().zip(other.inner.iter()).all(|(a, b)| a.ptr_eq(b))
    }
}

impl Eq for AggregateException {}

impl AggregateException {
    /// 用指定的内部原因构建聚合异常
    pub fn new(inner: Vec<RejectReason>) -> Self {
        AggregateException {
            inner,
        }
    }

    /// 获取所有内部原因
    pub fn inner(&self) -> &[RejectReason] {
        &self.inner
    }

    /// 获取内部原因数量
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 判断是否没有内部原因
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 转换为内部原因列表
    pub fn into_inner(self) -> Vec<RejectReason> {
        self.inner
    }
}
