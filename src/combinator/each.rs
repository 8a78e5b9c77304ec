//! 按完成顺序遍历
//!

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::collections::VecDeque;

use futures::stream::{BoxStream, StreamExt};
use async_stream::stream;
use parking_lot::Mutex;

use crate::{cancel::{CancelationRegistration, CancelationToken},
            config::report_uncaught,
            error::PromiseError,
            promise::{Deferred, Promise, PromiseResult}};

///
/// 遍历记录，包括源承诺的输入序号和结果
///
pub type EachRecord<T> = (usize, PromiseResult<T>);

// 遍历的共享状态
struct EachShared<T> {
    ready:      VecDeque<EachRecord<T>>,                    //已结束但未被取走的记录，按完成顺序
    waiter:     Option<Deferred<Option<EachRecord<T>>>>,    //等待下一个记录的承诺
    remaining:  usize,                                      //尚未结束的源数量
    canceled:   bool,                                       //是否已取消
    disposed:   bool,                                       //是否已释放
}

///
/// 按完成顺序遍历多个承诺的结果，每个源的结果只会被返回一次，
/// 同时只允许有一个未完成的下一个记录的承诺
///
pub struct Each<T: Send + 'static> {
    shared:         Arc<Mutex<EachShared<T>>>,          //共享状态
    registration:   Option<CancelationRegistration>,    //取消令牌的注册
}

impl<T: Send + 'static> fmt::Debug for Each<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Each")
            .field("ready", &shared.ready.len())
            .field("remaining", &shared.remaining)
            .field("canceled", &shared.canceled)
            .finish()
    }
}

impl<T: Send + 'static> Drop for Each<T> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.unregister();
        }

        let (ready, waiter) = {
            let mut shared = self.shared.lock();
            shared.disposed = true;
            (mem::take(&mut shared.ready), shared.waiter.take())
        };

        if let Some(waiter) = waiter {
            waiter.try_cancel();
        }
        for (_, result) in ready {
            if let PromiseResult::Rejected(reason) = result {
                //未被取走的拒绝没有观察者
                report_uncaught(reason);
            }
        }
    }
}

/// 按完成顺序遍历多个承诺
pub fn each<T, I>(promises: I) -> Each<T>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    each_with_token(promises, &CancelationToken::none())
}

/// 带取消令牌的按完成顺序遍历，令牌被取消后，未完成和之后的下一个记录的承诺都会被取消
pub fn each_with_token<T, I>(promises: I, token: &CancelationToken) -> Each<T>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    let shared = Arc::new(Mutex::new(EachShared {
        ready: VecDeque::with_capacity(promises.len()),
        waiter: None,
        remaining: promises.len(),
        canceled: false,
        disposed: false,
    }));

    for (index, source) in promises.into_iter().enumerate() {
        let shared = Arc::downgrade(&shared);
        source.subscribe(move |result| on_source_settled(&shared, index, result));
    }

    let registration = if token.can_be_canceled() {
        let shared_copy = Arc::downgrade(&shared);
        token.try_register(move || {
            if let Some(shared) = shared_copy.upgrade() {
                let waiter = {
                    let mut shared = shared.lock();
                    shared.canceled = true;
                    shared.waiter.take()
                };

                if let Some(waiter) = waiter {
                    waiter.try_cancel();
                }
            }
        })
    } else {
        None
    };

    Each {
        shared,
        registration,
    }
}

// 记录源的结果，有等待者则直接交给等待者
fn on_source_settled<T>(shared: &Weak<Mutex<EachShared<T>>>,
                        index: usize,
                        result: PromiseResult<T>)
    where T: Send + 'static {
    let shared = match shared.upgrade() {
        None => {
            //遍历已释放
            if let PromiseResult::Rejected(reason) = result {
                report_uncaught(reason);
            }
            return;
        },
        Some(shared) => shared,
    };

    let mut locked = shared.lock();
    locked.remaining -= 1;
    if locked.disposed {
        drop(locked);
        if let PromiseResult::Rejected(reason) = result {
            report_uncaught(reason);
        }
        return;
    }

    match locked.waiter.take() {
        Some(waiter) => {
            drop(locked);
            waiter.try_resolve(Some((index, result)));
        },
        None => locked.ready.push_back((index, result)),
    }
}

impl<T: Send + 'static> Each<T> {
    /// 获取下一个记录的承诺，所有记录都已返回时完成为空；
    /// 已取消时返回已取消的承诺，上一个承诺未完成时返回状态错误
    pub fn move_next(&mut self) -> Promise<Option<EachRecord<T>>> {
        let mut shared = self.shared.lock();
        if shared.canceled {
            return Promise::canceled();
        }

        if let Some(record) = shared.ready.pop_front() {
            return Promise::resolved(Some(record));
        }

        if shared.remaining == 0 {
            return Promise::resolved(None);
        }

        if shared.waiter.is_some() {
            return Promise::rejected(PromiseError::InvalidState("previous move_next still pending"));
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();
        shared.waiter = Some(deferred);
        promise
    }

    /// 获取尚未返回的记录数量
    pub fn remaining(&self) -> usize {
        let shared = self.shared.lock();
        shared.remaining + shared.ready.len()
    }

    /// 释放遍历，未完成的下一个记录的承诺会被取消，未被取走的拒绝会报告为未捕获
    pub fn dispose(self) {
        mem::drop(self);
    }

    /// 转换为按完成顺序产生记录的流，取消时流结束
    pub fn into_stream(mut self) -> BoxStream<'static, EachRecord<T>> {
        let records = stream! {
            loop {
                match self.move_next().await {
                    PromiseResult::Resolved(Some(record)) => yield record,
                    _ => break,
                }
            }
        };

        records.boxed()
    }
}
