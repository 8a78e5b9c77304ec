//! 承诺核心，单次赋值的状态机
//!

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{cancel::CancelationRegistration,
            config::report_uncaught,
            error::PromiseError,
            rt::ScheduleTarget};

use super::{PromiseResult, PromiseState};

// 延续回调
pub(crate) type Callback<T> = Box<dyn FnOnce(PromiseResult<T>) + Send + 'static>;

static CORE_UID: AtomicU64 = AtomicU64::new(1);

// 已附加的延续
struct Continuation<T> {
    target:     ScheduleTarget, //调度目标
    callback:   Callback<T>,    //回调
}

// 承诺核心的内部状态
struct CoreInner<T> {
    result:         Option<PromiseResult<T>>,           //尚未被消费的结果
    continuation:   Option<Continuation<T>>,            //等待结果的延续
    budget:         usize,                              //剩余的可消费次数
    registration:   Option<CancelationRegistration>,    //取消回调的注册
}

///
/// 承诺核心
///
pub(crate) struct PromiseCore<T> {
    id:     u64,                    //唯一id
    state:  AtomicU8,               //状态，只允许从Pending迁移一次
    inner:  Mutex<CoreInner<T>>,    //结果和延续
}

impl<T> fmt::Debug for PromiseCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> PromiseCore<T> {
    // 获取唯一id
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    // 获取当前状态
    pub(crate) fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl<T> Drop for PromiseCore<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.continuation.is_some() {
            log::warn!("Promise dropped before settled, id: {}", self.id);
        }

        if let Some(PromiseResult::Rejected(reason)) = inner.result.take() {
            //被回收时仍然没有观察者，则报告未捕获的拒绝
            report_uncaught(reason);
        }
    }
}

impl<T: Send + 'static> PromiseCore<T> {
    // 构建未完成的承诺核心
    pub(crate) fn new() -> Self {
        PromiseCore {
            id: CORE_UID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(PromiseState::Pending as u8),
            inner: Mutex::new(CoreInner {
                result: None,
                continuation: None,
                budget: 1,
                registration: None,
            }),
        }
    }

    // 构建已完成的承诺核心
    pub(crate) fn with_result(result: PromiseResult<T>) -> Self {
        let mut core = PromiseCore::new();
        *core.state.get_mut() = result.state() as u8;
        core.inner.get_mut().result = Some(result);
        core
    }

    // 保存取消回调的注册，承诺完成时自动注销
    pub(crate) fn set_registration(&self, registration: CancelationRegistration) {
        let registration = {
            let mut inner = self.inner.lock();
            if self.state() == PromiseState::Pending {
                inner.registration = Some(registration);
                return;
            }
            registration
        };

        //已完成，则在锁外注销
        registration.unregister();
    }

    // 完成承诺，并发调用时只有一个调用者成功，失败的调用者取回自己的结果
    pub(crate) fn try_settle(&self, result: PromiseResult<T>) -> Result<(), PromiseResult<T>> {
        if self
            .state
            .compare_exchange(PromiseState::Pending as u8,
                              result.state() as u8,
                              Ordering::AcqRel,
                              Ordering::Acquire)
            .is_err() {
            //已完成，则返回结果
            return Err(result);
        }

        let (continuation, registration) = {
            let mut inner = self.inner.lock();
            let registration = inner.registration.take();
            match inner.continuation.take() {
                None => {
                    //没有等待的延续，则保存结果
                    inner.result = Some(result);
                    (None, registration)
                },
                Some(continuation) => {
                    (Some((continuation, result)), registration)
                },
            }
        };

        if let Some(registration) = registration {
            registration.unregister();
        }

        if let Some((Continuation { target, callback }, result)) = continuation {
            target.dispatch_on_settle(Box::new(move || callback(result)));
        }

        Ok(())
    }

    // 完成承诺，已完成则返回状态错误
    pub(crate) fn settle(&self, result: PromiseResult<T>) -> Result<(), PromiseError> {
        self.try_settle(result)
            .map_err(|_| PromiseError::InvalidState("promise already settled"))
    }

    // 附加延续，消费一次可消费次数，超出可消费次数则返回错误和未被执行的回调
    pub(crate) fn attach(&self,
                         target: ScheduleTarget,
                         callback: Callback<T>) -> Result<(), (PromiseError, Callback<T>)> {
        let mut inner = self.inner.lock();
        if inner.budget == 0 {
            return Err((PromiseError::InvalidState("promise already consumed, retain it before awaiting more than once"), callback));
        }
        inner.budget -= 1;

        match inner.result.take() {
            None => {
                //未完成，则等待完成时调度
                inner.continuation = Some(Continuation {
                    target,
                    callback,
                });
                Ok(())
            },
            Some(result) => {
                //已完成，则在锁外立即调度
                drop(inner);
                target.dispatch_settled(Box::new(move || callback(result)));
                Ok(())
            },
        }
    }
}
