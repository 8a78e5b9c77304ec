//! 生产者，负责完成一个承诺
//!

use std::fmt;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::{cancel::CancelationToken,
            error::{PromiseError, RejectReason}};

use super::{Promise, PromiseResult, PromiseState, node::PromiseCore};

///
/// 延迟完成的承诺的生产者，克隆后共享同一个承诺，
/// 完成、拒绝和取消只有第一次调用会成功
///
pub struct Deferred<T> {
    core: Arc<PromiseCore<T>>,  //承诺核心
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// 构建未完成的承诺的生产者
    pub fn new() -> Self {
        Deferred {
            core: Arc::new(PromiseCore::new()),
        }
    }

    /// 构建与指定取消令牌关联的承诺的生产者，令牌被取消时如果承诺未完成，则承诺被取消
    pub fn new_with_token(token: &CancelationToken) -> Self {
        let deferred = Deferred::new();
        if token.can_be_canceled() {
            let deferred_copy = deferred.clone();
            if let Some(registration) = token.try_register(move || {
                deferred_copy.try_cancel();
            }) {
                deferred.core.set_registration(registration);
            }
        }

        deferred
    }

    /// 获取承诺，承诺只能被消费一次
    pub fn promise(&self) -> Promise<T> {
        Promise::from_core(self.core.clone())
    }

    /// 获取承诺的唯一id
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// 获取承诺的状态
    pub fn state(&self) -> PromiseState {
        self.core.state()
    }

    /// 判断承诺是否未完成
    pub fn is_pending(&self) -> bool {
        self.core.state() == PromiseState::Pending
    }

    /// 用指定的结果完成承诺，已完成则返回状态错误
    pub fn settle(&self, result: PromiseResult<T>) -> Result<(), PromiseError> {
        self.core.settle(result)
    }

    /// 尝试用指定的结果完成承诺，返回是否成功
    pub fn try_settle(&self, result: PromiseResult<T>) -> bool {
        self.core.try_settle(result).is_ok()
    }

    // 尝试完成承诺，失败时取回结果
    pub(crate) fn settle_or_return(&self, result: PromiseResult<T>) -> Result<(), PromiseResult<T>> {
        self.core.try_settle(result)
    }

    /// 完成承诺
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.settle(PromiseResult::Resolved(value))
    }

    /// 尝试完成承诺
    pub fn try_resolve(&self, value: T) -> bool {
        self.try_settle(PromiseResult::Resolved(value))
    }

    /// 拒绝承诺
    pub fn reject<E>(&self, reason: E) -> Result<(), PromiseError>
        where E: Any + Debug + Send + Sync {
        self.settle(PromiseResult::Rejected(RejectReason::new(reason)))
    }

    /// 尝试拒绝承诺
    pub fn try_reject<E>(&self, reason: E) -> bool
        where E: Any + Debug + Send + Sync {
        self.try_settle(PromiseResult::Rejected(RejectReason::new(reason)))
    }

    /// 取消承诺
    pub fn cancel(&self) -> Result<(), PromiseError> {
        self.settle(PromiseResult::Canceled)
    }

    /// 尝试取消承诺
    pub fn try_cancel(&self) -> bool {
        self.try_settle(PromiseResult::Canceled)
    }
}
