//! 顺序执行
//!

use crate::{cancel::CancelationToken,
            promise::{invoke_guarded, Deferred, Promise, PromiseResult}};

/// 逐个调用生产者，前一个生产者返回的承诺完成后才调用下一个，
/// 任意承诺被拒绝或取消时立即结束，之后的生产者不会被调用
pub fn sequence<I, F>(producers: I) -> Promise<()>
    where I: IntoIterator<Item = F>,
          I::IntoIter: Send + 'static,
          F: FnOnce() -> Promise<()> + Send + 'static {
    sequence_with_token(producers, CancelationToken::none())
}

/// 带取消令牌的顺序执行，每次调用生产者前检查令牌，令牌被取消则结束为已取消
pub fn sequence_with_token<I, F>(producers: I, token: CancelationToken) -> Promise<()>
    where I: IntoIterator<Item = F>,
          I::IntoIter: Send + 'static,
          F: FnOnce() -> Promise<()> + Send + 'static {
    let deferred = Deferred::new();
    let promise = deferred.promise();
    sequence_next(producers.into_iter(), token, deferred);
    promise
}

// 调用下一个生产者，已完成的生产者的延续会经过蹦床，不会增加调用栈深度
fn sequence_next<It, F>(mut producers: It,
                        token: CancelationToken,
                        deferred: Deferred<()>)
    where It: Iterator<Item = F> + Send + 'static,
          F: FnOnce() -> Promise<()> + Send + 'static {
    if token.is_cancelation_requested() {
        deferred.try_cancel();
        return;
    }

    let producer = match invoke_guarded(|| producers.next()) {
        Err(reason) => {
            deferred.try_settle(PromiseResult::Rejected(reason));
            return;
        },
        Ok(None) => {
            deferred.try_resolve(());
            return;
        },
        Ok(Some(producer)) => producer,
    };

    match invoke_guarded(producer) {
        Err(reason) => {
            deferred.try_settle(PromiseResult::Rejected(reason));
        },
        Ok(promise) => {
            promise.subscribe(move |result| {
                match result {
                    PromiseResult::Resolved(()) => sequence_next(producers, token, deferred),
                    failure => {
                        deferred.try_settle(failure);
                    },
                }
            });
        },
    }
}
