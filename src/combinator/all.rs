//! 全部完成、全部结束和定长合并
//!

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::promise::{Deferred, Promise, PromiseResult};

use super::settle_or_report;

// 汇聚的状态
struct FanIn<S, R> {
    remaining:  AtomicUsize,    //尚未完成的源数量
    slots:      Mutex<S>,       //已完成的源的值
    deferred:   Deferred<R>,    //汇聚的承诺
}

impl<S, R: Send + 'static> FanIn<S, R> {
    fn new(len: usize, slots: S) -> (Arc<Self>, Promise<R>) {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let fan_in = Arc::new(FanIn {
            remaining: AtomicUsize::new(len),
            slots: Mutex::new(slots),
            deferred,
        });

        (fan_in, promise)
    }

    // 记录一个源的值，返回是否是最后一个源
    fn fill<F: FnOnce(&mut S)>(&self, f: F) -> bool {
        f(&mut *self.slots.lock());
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    // 第一个失败结束汇聚，之后的拒绝报告为未捕获
    fn fail<T>(&self, result: PromiseResult<T>) {
        match result {
            PromiseResult::Rejected(reason) => settle_or_report(&self.deferred, PromiseResult::Rejected(reason)),
            PromiseResult::Canceled => {
                self.deferred.try_settle(PromiseResult::Canceled);
            },
            PromiseResult::Resolved(_) => (),
        }
    }
}

/// 等待所有承诺完成，按输入顺序返回所有值；
/// 任意承诺被拒绝或取消时立即结束，之后其它承诺的拒绝会报告为未捕获
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    let len = promises.len();
    if len == 0 {
        return Promise::resolved(Vec::new());
    }

    let slots: Vec<Option<T>> = (0..len).map(|_| None).collect();
    let (fan_in, promise) = FanIn::new(len, slots);
    for (index, source) in promises.into_iter().enumerate() {
        let fan_in = fan_in.clone();
        source.subscribe(move |result| {
            match result {
                PromiseResult::Resolved(value) => {
                    if fan_in.fill(move |slots| slots[index] = Some(value)) {
                        let values: Vec<T> = mem::take(&mut *fan_in.slots.lock())
                            .into_iter()
                            .flatten()
                            .collect();
                        fan_in.deferred.try_settle(PromiseResult::Resolved(values));
                    }
                },
                failure => fan_in.fail(failure),
            }
        });
    }

    promise
}

/// 等待所有承诺结束，按输入顺序返回所有结果，不会提前结束，也不会报告任何未捕获的拒绝
pub fn all_settled<T, I>(promises: I) -> Promise<Vec<PromiseResult<T>>>
    where T: Send + 'static,
          I: IntoIterator<Item = Promise<T>> {
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    let len = promises.len();
    if len == 0 {
        return Promise::resolved(Vec::new());
    }

    let slots: Vec<Option<PromiseResult<T>>> = (0..len).map(|_| None).collect();
    let (fan_in, promise) = FanIn::new(len, slots);
    for (index, source) in promises.into_iter().enumerate() {
        let fan_in = fan_in.clone();
        source.subscribe(move |result| {
            if fan_in.fill(move |slots| slots[index] = Some(result)) {
                let results: Vec<PromiseResult<T>> = mem::take(&mut *fan_in.slots.lock())
                    .into_iter()
                    .flatten()
                    .collect();
                fan_in.deferred.try_settle(PromiseResult::Resolved(results));
            }
        });
    }

    promise
}

// 生成指定元数的合并和合并结束
macro_rules! impl_merge {
    ($merge:ident, $merge_settled:ident, $len:expr; $($T:ident $p:ident $idx:tt),+) => {
        /// 等待所有不同类型的承诺完成，返回所有值的元组；
        /// 任意承诺被拒绝或取消时立即结束，之后其它承诺的拒绝会报告为未捕获
        pub fn $merge<$($T),+>($($p: Promise<$T>),+) -> Promise<($($T,)+)>
            where $($T: Send + 'static),+ {
            let finish: fn(&mut ($(Option<$T>,)+)) -> Option<($($T,)+)> = |slots| {
                match ($(slots.$idx.take(),)+) {
                    ($(Some($p),)+) => Some(($($p,)+)),
                    _ => None,
                }
            };

            let (fan_in, promise) = FanIn::new($len, ($(None::<$T>,)+));
            $(
                let fan_in_copy = fan_in.clone();
                $p.subscribe(move |result| {
                    match result {
                        PromiseResult::Resolved(value) => {
                            if fan_in_copy.fill(move |slots| slots.$idx = Some(value)) {
                                let values = finish(&mut *fan_in_copy.slots.lock());
                                if let Some(values) = values {
                                    fan_in_copy.deferred.try_settle(PromiseResult::Resolved(values));
                                }
                            }
                        },
                        failure => fan_in_copy.fail(failure),
                    }
                });
            )+

            promise
        }

        /// 等待所有不同类型的承诺结束，返回所有结果的元组，不会提前结束
        pub fn $merge_settled<$($T),+>($($p: Promise<$T>),+) -> Promise<($(PromiseResult<$T>,)+)>
            where $($T: Send + 'static),+ {
            let finish: fn(&mut ($(Option<PromiseResult<$T>>,)+)) -> Option<($(PromiseResult<$T>,)+)> = |slots| {
                match ($(slots.$idx.take(),)+) {
                    ($(Some($p),)+) => Some(($($p,)+)),
                    _ => None,
                }
            };

            let (fan_in, promise) = FanIn::new($len, ($(None::<PromiseResult<$T>>,)+));
            $(
                let fan_in_copy = fan_in.clone();
                $p.subscribe(move |result| {
                    if fan_in_copy.fill(move |slots| slots.$idx = Some(result)) {
                        let results = finish(&mut *fan_in_copy.slots.lock());
                        if let Some(results) = results {
                            fan_in_copy.deferred.try_settle(PromiseResult::Resolved(results));
                        }
                    }
                });
            )+

            promise
        }
    };
}

impl_merge!(merge2, merge_settled2, 2; T1 p1 0, T2 p2 1);
impl_merge!(merge3, merge_settled3, 3; T1 p1 0, T2 p2 1, T3 p3 2);
impl_merge!(merge4, merge_settled4, 4; T1 p1 0, T2 p2 1, T3 p3 2, T4 p4 3);
impl_merge!(merge5, merge_settled5, 5; T1 p1 0, T2 p2 1, T3 p3 2, T4 p4 3, T5 p5 4);
impl_merge!(merge6, merge_settled6, 6; T1 p1 0, T2 p2 1, T3 p3 2, T4 p4 3, T5 p5 4, T6 p6 5);
impl_merge!(merge7, merge_settled7, 7; T1 p1 0, T2 p2 1, T3 p3 2, T4 p4 3, T5 p5 4, T6 p6 5, T7 p7 6);
