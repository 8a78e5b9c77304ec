//! # 组合器
//!
//! 所有组合器都是对N个源承诺的计数汇聚，组合器本身也是一个承诺的生产者。
//!
//! - [全部完成](fn.all.html)和[合并](fn.merge2.html)：第一个失败立即结束，之后的拒绝报告为未捕获
//! - [全部结束](fn.all_settled.html)和[合并结束](fn.merge_settled2.html)：等待所有源，按输入顺序返回所有结果
//! - [竞争](fn.race.html)：第一个结束的源获胜，之后的拒绝报告为未捕获
//! - [首个完成](fn.first.html)：第一个完成的源获胜，所有源都失败时返回最后一个失败
//! - [顺序执行](fn.sequence.html)：逐个执行生产者
//! - [按完成顺序遍历](fn.each.html)：按完成顺序返回所有源的结果
//! - [并行循环](fn.parallel_for_each.html)：限制并发度的异步循环
//!

use crate::{config::report_uncaught,
            promise::{Deferred, PromiseResult}};

mod all;
mod race;
mod sequence;
mod each;
mod parallel;

pub use all::*;
pub use race::*;
pub use sequence::*;
pub use each::*;
pub use parallel::*;

// 尝试完成汇聚的承诺，已完成则将拒绝报告为未捕获
pub(crate) fn settle_or_report<R: Send + 'static>(deferred: &Deferred<R>, result: PromiseResult<R>) {
    if let Err(PromiseResult::Rejected(reason)) = deferred.settle_or_return(result) {
        report_uncaught(reason);
    }
}
