//! # 基于延续的异步承诺运行时，用于为外部提供可组合的延迟值、协作式取消和延续调度
//!
//! ## 主要特征
//! - 一次性完成的[承诺]，由[生产者]完成，结果只会是完成、拒绝或取消之一，
//! - 附加的延续按[调度选项]在指定的[调度上下文]中执行，
//! - [协作式取消]，取消令牌可以取消未完成的承诺和组合器，
//! - 结构化的[组合器]，包括全部完成、竞争、首个完成、合并、顺序执行、按完成顺序遍历和并行循环，
//! - 没有观察者的拒绝会被报告给[未捕获拒绝处理器]。
//!
//! [承诺]: promise/struct.Promise.html
//! [生产者]: promise/struct.Deferred.html
//! [调度选项]: rt/struct.ContinuationOptions.html
//! [调度上下文]: rt/trait.ScheduleContext.html
//! [协作式取消]: cancel/index.html
//! [组合器]: combinator/index.html
//! [未捕获拒绝处理器]: config/fn.set_uncaught_rejection_handler.html
//!
//! # Examples
//!
//! 生产者与延续:
//! ```
//! use pi_promise::prelude::Deferred;
//!
//! let deferred = Deferred::new();
//! let promise = deferred.promise().then(|value: usize| value + 1);
//! deferred.resolve(1).unwrap();
//! assert_eq!(promise.wait().unwrap().into_value(), Some(2));
//! ```
//!
//! 组合器:
//! ```
//! use pi_promise::prelude::{Promise, all, race};
//!
//! let promise = all(vec![Promise::resolved(1usize), Promise::resolved(2)]);
//! assert_eq!(promise.wait().unwrap().into_value(), Some(vec![1, 2]));
//!
//! let promise = race(vec![Promise::resolved(3usize), Promise::canceled()]);
//! assert_eq!(promise.wait().unwrap().into_value(), Some(3));
//! ```
//!
//! 单线程调度上下文:
//! ```
//! use std::sync::Arc;
//! use pi_promise::prelude::{Deferred, SingleContextRunner};
//!
//! let runner = SingleContextRunner::default();
//! let context = runner.startup().unwrap();
//! let deferred = Deferred::new();
//! let promise = deferred.promise().schedule_on(Arc::new(context)).then(|value: usize| value * 2);
//! deferred.resolve(21).unwrap();
//! assert_eq!(runner.run().unwrap(), 1);
//! assert_eq!(promise.wait().unwrap().into_value(), Some(42));
//! ```
//!

pub mod error;
pub mod config;
pub mod cancel;
pub mod rt;
pub mod promise;
pub mod combinator;
pub mod prelude;

#[cfg(test)]
mod tests;
