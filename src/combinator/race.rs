//! 竞争和首个完成
//!

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{error::PromiseError,
            promise::{Deferred, Promise, PromiseResult}};

use super::settle_or_report;

/// 返回第一个结束的承诺的结果，之后其它承诺的拒绝会报告为未捕获；没有任何承诺时返回参数错误
pub fn race<T, I>(promises: I) -> Promise<T>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    race_with_index(promises).then(|(_, value)| value)
}

/// 返回第一个结束的承诺的序号和结果
pub fn race_with_index<T, I>(promises: I) -> Promise<(usize, T)>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::rejected(PromiseError::InvalidArgument("race requires at least one promise"));
    }

    let deferred = Deferred::new();
    let promise = deferred.promise();
    for (index, source) in promises.into_iter().enumerate() {
        let deferred = deferred.clone();
        source.subscribe(move |result| {
            settle_or_report(&deferred, result.map(|value| (index, value)));
        });
    }

    promise
}

// 首个完成的状态
struct FirstState<T> {
    remaining:  AtomicUsize,                            //尚未结束的源数量
    failure:    Mutex<Option<PromiseResult<(usize, T)>>>,   //最后一个失败
    deferred:   Deferred<(usize, T)>,                   //首个完成的承诺
}

/// 返回第一个完成的承诺的值，所有承诺都失败时返回最后一个失败；
/// 非获胜承诺的拒绝被视为已处理；没有任何承诺时返回参数错误
pub fn first<T, I>(promises: I) -> Promise<T>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    first_with_index(promises).then(|(_, value)| value)
}

/// 返回第一个完成的承诺的序号和值
pub fn first_with_index<T, I>(promises: I) -> Promise<(usize, T)>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::rejected(PromiseError::InvalidArgument("first requires at least one promise"));
    }

    let deferred = Deferred::new();
    let promise = deferred.promise();
    let state = Arc::new(FirstState {
        remaining: AtomicUsize::new(promises.len()),
        failure: Mutex::new(None),
        deferred,
    });
    for (index, source) in promises.into_iter().enumerate() {
        let state = state.clone();
        source.subscribe(move |result| {
            match result {
                PromiseResult::Resolved(value) => {
                    state.deferred.try_settle(PromiseResult::Resolved((index, value)));
                },
                failure => {
                    *state.failure.lock() = Some(failure.map(|value| (index, value)));
                },
            }

            if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                //所有源都已结束，没有获胜者则用最后一个失败结束
                let failure = state.failure.lock().take();
                if let Some(failure) = failure {
                    state.deferred.try_settle(failure);
                }
            }
        });
    }

    promise
}
