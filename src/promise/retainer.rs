//! 保留的承诺，可以被多次等待
//!

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::report_uncaught;

use super::{Deferred, Promise, PromiseResult, PromiseState};

// 保留的状态
struct RetainState<T> {
    result:     Option<PromiseResult<T>>,   //底层承诺的结果
    waiters:    Vec<Deferred<T>>,           //等待底层承诺完成的派生承诺，按等待顺序
    waited:     bool,                       //是否有过派生承诺
    released:   bool,                       //保留计数是否已归零
}

// 保留的共享部分
struct RetainerInner<T> {
    retain_count:   AtomicUsize,            //保留计数
    state:          Mutex<RetainState<T>>,  //保留的状态
}

///
/// 保留的承诺，每次等待都会生成新的派生承诺，所有派生承诺共享底层承诺的同一个结果；
/// 克隆会增加保留计数，释放会减少保留计数，计数归零时释放底层结果
///
pub struct Retainer<T> {
    inner: Arc<RetainerInner<T>>,   //共享部分
}

impl<T> fmt::Debug for Retainer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retainer")
            .field("retain_count", &self.inner.retain_count.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Clone for Retainer<T> {
    fn clone(&self) -> Self {
        self.inner.retain_count.fetch_add(1, Ordering::AcqRel);
        Retainer {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Retainer<T> {
    fn drop(&mut self) {
        if self.inner.retain_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let unobserved = {
            let mut state = self.inner.state.lock();
            state.released = true;
            let result = state.result.take();
            if state.waited {
                None
            } else {
                result
            }
        };

        if let Some(PromiseResult::Rejected(reason)) = unobserved {
            //没有任何派生承诺，则底层的拒绝没有观察者
            report_uncaught(reason);
        }
    }
}

impl<T: Clone + Send + 'static> Retainer<T> {
    // 保留指定的承诺
    pub(crate) fn new(promise: Promise<T>) -> Self {
        let inner = Arc::new(RetainerInner {
            retain_count: AtomicUsize::new(1),
            state: Mutex::new(RetainState {
                result: None,
                waiters: Vec::new(),
                waited: false,
                released: false,
            }),
        });

        let inner_copy = inner.clone();
        promise.subscribe(move |result| {
            let (waiters, unobserved) = {
                let mut state = inner_copy.state.lock();
                let waiters = mem::take(&mut state.waiters);
                if state.released {
                    //已释放，则不再保留结果
                    (waiters, if state.waited { None } else { Some(result.clone()) })
                } else {
                    state.result = Some(result.clone());
                    (waiters, None)
                }
            };

            for waiter in waiters {
                waiter.try_settle(result.clone());
            }

            if let Some(PromiseResult::Rejected(reason)) = unobserved {
                report_uncaught(reason);
            }
        });

        Retainer {
            inner,
        }
    }

    /// 获取底层承诺的状态
    pub fn state(&self) -> PromiseState {
        match &self.inner.state.lock().result {
            None => PromiseState::Pending,
            Some(result) => result.state(),
        }
    }

    /// 获取当前的保留计数
    pub fn retain_count(&self) -> usize {
        self.inner.retain_count.load(Ordering::Acquire)
    }

    /// 等待底层承诺完成，每次调用都返回新的派生承诺
    pub fn wait_async(&self) -> Promise<T> {
        let mut state = self.inner.state.lock();
        state.waited = true;
        if let Some(result) = &state.result {
            return Promise::settled(result.clone());
        }

        let deferred = Deferred::new();
        state.waiters.push(deferred.clone());
        deferred.promise()
    }

    /// 释放当前保留
    pub fn dispose(self) {
        mem::drop(self);
    }
}
