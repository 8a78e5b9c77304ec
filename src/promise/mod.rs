//! # 承诺
//!
//! 单次赋值的延迟值，最终进入完成、拒绝或取消三种终止状态之一。
//!
//! - 承诺默认只能被消费一次，消费时返回新的承诺，形成延续链
//! - 需要多次消费时，使用[保留](struct.Promise.html#method.retain)
//! - 被回收时仍未被观察的拒绝，会报告给未捕获拒绝处理器
//!

use std::fmt;
use std::any::Any;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::future::{Future, IntoFuture};
use std::task::{Context, Poll};
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::channel::oneshot;
use crossbeam_channel::TryRecvError;

use crate::{cancel::CancelationToken,
            config::report_uncaught,
            error::{PromiseError, RejectReason},
            rt::{run_pending_once, ContinuationOptions, ScheduleContext}};

pub(crate) mod node;
mod deferred;
mod retainer;

pub use deferred::Deferred;
pub use retainer::Retainer;

use self::node::PromiseCore;

///
/// 承诺的状态
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PromiseState {
    Pending = 0,
    Resolved = 1,
    Rejected = 2,
    Canceled = 3,
}

impl PromiseState {
    pub(crate) fn from_u8(state: u8) -> Self {
        match state {
            0 => PromiseState::Pending,
            1 => PromiseState::Resolved,
            2 => PromiseState::Rejected,
            _ => PromiseState::Canceled,
        }
    }
}

///
/// 承诺的结果
///
#[derive(Debug, Clone)]
pub enum PromiseResult<T> {
    Resolved(T),
    Rejected(RejectReason),
    Canceled,
}

impl<T> PromiseResult<T> {
    /// 获取结果对应的状态
    pub fn state(&self) -> PromiseState {
        match self {
            PromiseResult::Resolved(_) => PromiseState::Resolved,
            PromiseResult::Rejected(_) => PromiseState::Rejected,
            PromiseResult::Canceled => PromiseState::Canceled,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PromiseResult::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseResult::Rejected(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, PromiseResult::Canceled)
    }

    /// 获取完成值的引用
    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseResult::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// 获取拒绝原因的引用
    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            PromiseResult::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// 转换为完成值
    pub fn into_value(self) -> Option<T> {
        match self {
            PromiseResult::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// 映射完成值
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> PromiseResult<U> {
        match self {
            PromiseResult::Resolved(value) => PromiseResult::Resolved(f(value)),
            PromiseResult::Rejected(reason) => PromiseResult::Rejected(reason),
            PromiseResult::Canceled => PromiseResult::Canceled,
        }
    }
}

// 执行用户回调，并将panic捕获为拒绝原因
pub(crate) fn invoke_guarded<R, F: FnOnce() -> R>(f: F) -> Result<R, RejectReason> {
    catch_unwind(AssertUnwindSafe(f)).map_err(RejectReason::from_panic)
}

///
/// 承诺，消费者通过附加延续获取结果
///
pub struct Promise<T> {
    core:       Arc<PromiseCore<T>>,    //承诺核心
    options:    ContinuationOptions,    //附加延续时使用的调度选项
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn from_core(core: Arc<PromiseCore<T>>) -> Self {
        Promise {
            core,
            options: ContinuationOptions::default(),
        }
    }

    /// 构建承诺，并立即用生产者执行指定的解析器，解析器中的panic会拒绝承诺
    pub fn new<F>(resolver: F) -> Self
        where F: FnOnce(Deferred<T>) {
        let deferred = Deferred::new();
        let promise = deferred.promise();

        let deferred_copy = deferred.clone();
        if let Err(reason) = invoke_guarded(move || resolver(deferred_copy)) {
            if let Err(PromiseResult::Rejected(reason)) = deferred.settle_or_return(PromiseResult::Rejected(reason)) {
                //承诺已被解析器完成，则报告未捕获的panic
                report_uncaught(reason);
            }
        }

        promise
    }

    /// 构建已完成的承诺
    pub fn settled(result: PromiseResult<T>) -> Self {
        Promise::from_core(Arc::new(PromiseCore::with_result(result)))
    }

    /// 构建已完成的承诺
    pub fn resolved(value: T) -> Self {
        Promise::settled(PromiseResult::Resolved(value))
    }

    /// 构建已拒绝的承诺
    pub fn rejected<E>(reason: E) -> Self
        where E: Any + Debug + Send + Sync {
        Promise::settled(PromiseResult::Rejected(RejectReason::new(reason)))
    }

    /// 构建已取消的承诺
    pub fn canceled() -> Self {
        Promise::settled(PromiseResult::Canceled)
    }

    /// 获取承诺的唯一id
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// 获取承诺的当前状态
    pub fn state(&self) -> PromiseState {
        self.core.state()
    }

    /// 设置后续附加延续时使用的调度选项
    pub fn with_options(mut self, options: ContinuationOptions) -> Self {
        self.options = options;
        self
    }

    /// 设置后续附加的延续在指定的调度上下文中执行
    pub fn schedule_on(self, context: Arc<dyn ScheduleContext>) -> Self {
        let completion = self.options.completion;
        let mut options = ContinuationOptions::on(context);
        options.completion = completion;
        self.with_options(options)
    }

    /// 设置后续附加的延续总是经过调度上下文执行
    pub fn force_async(self) -> Self {
        let options = self.options.clone().force_async();
        self.with_options(options)
    }

    // 消费承诺并附加延续，所有延续共享这一个调度路径
    pub(crate) fn subscribe<F>(self, callback: F)
        where F: FnOnce(PromiseResult<T>) + Send + 'static {
        let Promise { core, options } = self;
        if let Err((e, callback)) = core.attach(options.resolve(), Box::new(callback)) {
            if cfg!(debug_assertions) {
                panic!("{}, promise id: {}", e, core.id());
            }

            log::warn!("{}, promise id: {}", e, core.id());
            callback(PromiseResult::Rejected(RejectReason::new(e)));
        }
    }

    // 消费承诺，并用回调的结果完成新的承诺
    fn chain<U, F>(self, f: F) -> Promise<U>
        where U: Send + 'static,
              F: FnOnce(PromiseResult<T>, Deferred<U>) + Send + 'static {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        self.subscribe(move |result| f(result, deferred));
        promise
    }

    /// 完成时用回调映射完成值，拒绝和取消会被传递
    pub fn then<U, F>(self, f: F) -> Promise<U>
        where U: Send + 'static,
              F: FnOnce(T) -> U + Send + 'static {
        self.chain(move |result, deferred| {
            let result = match result {
                PromiseResult::Resolved(value) => match invoke_guarded(move || f(value)) {
                    Ok(value) => PromiseResult::Resolved(value),
                    Err(reason) => PromiseResult::Rejected(reason),
                },
                PromiseResult::Rejected(reason) => PromiseResult::Rejected(reason),
                PromiseResult::Canceled => PromiseResult::Canceled,
            };
            deferred.try_settle(result);
        })
    }

    /// 完成时用回调返回的承诺继续，新的承诺采用返回的承诺的结果
    pub fn then_promise<U, F>(self, f: F) -> Promise<U>
        where U: Send + 'static,
              F: FnOnce(T) -> Promise<U> + Send + 'static {
        self.chain(move |result, deferred| {
            match result {
                PromiseResult::Resolved(value) => match invoke_guarded(move || f(value)) {
                    Ok(inner) => inner.subscribe(move |result| {
                        deferred.try_settle(result);
                    }),
                    Err(reason) => {
                        deferred.try_settle(PromiseResult::Rejected(reason));
                    },
                },
                PromiseResult::Rejected(reason) => {
                    deferred.try_settle(PromiseResult::Rejected(reason));
                },
                PromiseResult::Canceled => {
                    deferred.try_settle(PromiseResult::Canceled);
                },
            }
        })
    }

    /// 完成或拒绝时用对应的回调生成新的完成值，取消会被传递
    pub fn then_or_catch<U, F, R>(self, on_resolved: F, on_rejected: R) -> Promise<U>
        where U: Send + 'static,
              F: FnOnce(T) -> U + Send + 'static,
              R: FnOnce(RejectReason) -> U + Send + 'static {
        self.chain(move |result, deferred| {
            let result = match result {
                PromiseResult::Resolved(value) => invoke_guarded(move || on_resolved(value)),
                PromiseResult::Rejected(reason) => invoke_guarded(move || on_rejected(reason)),
                PromiseResult::Canceled => {
                    deferred.try_settle(PromiseResult::Canceled);
                    return;
                },
            };
            match result {
                Ok(value) => deferred.try_settle(PromiseResult::Resolved(value)),
                Err(reason) => deferred.try_settle(PromiseResult::Rejected(reason)),
            };
        })
    }

    /// 拒绝时用回调生成完成值，完成和取消会被传递
    pub fn catch<F>(self, f: F) -> Promise<T>
        where F: FnOnce(RejectReason) -> T + Send + 'static {
        self.chain(move |result, deferred| {
            let result = match result {
                PromiseResult::Rejected(reason) => match invoke_guarded(move || f(reason)) {
                    Ok(value) => PromiseResult::Resolved(value),
                    Err(reason) => PromiseResult::Rejected(reason),
                },
                other => other,
            };
            deferred.try_settle(result);
        })
    }

    /// 取消时用回调生成完成值，完成和拒绝会被传递
    pub fn catch_cancelation<F>(self, f: F) -> Promise<T>
        where F: FnOnce() -> T + Send + 'static {
        self.chain(move |result, deferred| {
            let result = match result {
                PromiseResult::Canceled => match invoke_guarded(f) {
                    Ok(value) => PromiseResult::Resolved(value),
                    Err(reason) => PromiseResult::Rejected(reason),
                },
                other => other,
            };
            deferred.try_settle(result);
        })
    }

    /// 无论结果如何，都用回调生成新的完成值
    pub fn continue_with<U, F>(self, f: F) -> Promise<U>
        where U: Send + 'static,
              F: FnOnce(PromiseResult<T>) -> U + Send + 'static {
        self.chain(move |result, deferred| {
            match invoke_guarded(move || f(result)) {
                Ok(value) => deferred.try_settle(PromiseResult::Resolved(value)),
                Err(reason) => deferred.try_settle(PromiseResult::Rejected(reason)),
            };
        })
    }

    /// 无论结果如何都执行回调，并传递原结果；回调panic时新的承诺被拒绝，被替换的拒绝会报告为未捕获
    pub fn finally<F>(self, f: F) -> Promise<T>
        where F: FnOnce() + Send + 'static {
        self.chain(move |result, deferred| {
            match invoke_guarded(f) {
                Ok(()) => {
                    deferred.try_settle(result);
                },
                Err(reason) => {
                    if let PromiseResult::Rejected(replaced) = result {
                        report_uncaught(replaced);
                    }
                    deferred.try_settle(PromiseResult::Rejected(reason));
                },
            }
        })
    }

    /// 在指定令牌被取消时提前取消的等待，原承诺之后的拒绝会报告为未捕获
    pub fn wait_with_token(self, token: &CancelationToken) -> Promise<T> {
        let deferred = Deferred::new_with_token(token);
        let promise = deferred.promise();
        self.subscribe(move |result| {
            if let Err(PromiseResult::Rejected(reason)) = deferred.settle_or_return(result) {
                report_uncaught(reason);
            }
        });
        promise
    }

    /// 保留承诺，使其可以被多次等待
    pub fn retain(self) -> Retainer<T>
        where T: Clone {
        Retainer::new(self)
    }

    /// 阻塞当前线程等待承诺完成，等待时会先执行当前线程蹦床上待执行的延续；
    /// 不要在承诺的延续将要执行的调度上下文所在的线程上调用
    pub fn wait(self) -> Result<PromiseResult<T>, PromiseError> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.subscribe(move |result| {
            let _ = sender.send(result);
        });

        loop {
            match receiver.try_recv() {
                Ok(result) => return Ok(result),
                Err(TryRecvError::Disconnected) => {
                    return Err(PromiseError::InvalidState("promise dropped before settled"));
                },
                Err(TryRecvError::Empty) => {
                    if !run_pending_once() {
                        //当前线程没有待执行的延续，则阻塞等待其它线程完成承诺
                        return receiver
                            .recv()
                            .map_err(|_| PromiseError::InvalidState("promise dropped before settled"));
                    }
                },
            }
        }
    }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = PromiseResult<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (sender, receiver) = oneshot::channel();
        self.subscribe(move |result| {
            let _ = sender.send(result);
        });

        PromiseFuture {
            receiver,
        }
    }
}

///
/// 等待承诺完成的Future
///
#[must_use = "Futures do nothing unless polled or .awaited"]
pub struct PromiseFuture<T> {
    receiver: oneshot::Receiver<PromiseResult<T>>,  //结果接收器
}

impl<T> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture").finish()
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = PromiseResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                //承诺在完成前被丢弃
                Poll::Ready(PromiseResult::Rejected(RejectReason::new(PromiseError::InvalidState("promise dropped before settled"))))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::executor::block_on;

    use crate::tests::UncaughtCapture;

    #[test]
    fn test_then_chain() {
        let deferred = Deferred::new();
        let promise = deferred
            .promise()
            .then(|value: usize| value + 1)
            .then(|value| value * 2);
        assert_eq!(promise.state(), PromiseState::Pending);

        deferred.resolve(1).unwrap();
        assert_eq!(promise.wait().unwrap().into_value(), Some(4));
    }

    #[test]
    fn test_rejection_propagates_to_catch() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_copy = invoked.clone();
        let result = Promise::<usize>::rejected("Error!")
            .then(move |value| {
                invoked_copy.fetch_add(1, Ordering::SeqCst);
                value
            })
            .catch(|reason| if reason.downcast_ref::<&str>() == Some(&"Error!") { 10 } else { 0 })
            .wait()
            .unwrap();
        assert_eq!(result.into_value(), Some(10));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_propagates_to_catch_cancelation() {
        let result = Promise::<usize>::canceled()
            .then(|value| value + 1)
            .catch(|_| 0)
            .catch_cancelation(|| 7)
            .wait()
            .unwrap();
        assert_eq!(result.into_value(), Some(7));
    }

    #[test]
    fn test_panic_captured_as_rejection() {
        let result = Promise::resolved(1usize)
            .then(|_| -> usize { panic!("body failed") })
            .wait()
            .unwrap();
        let reason = result.reason().cloned().unwrap();
        assert_eq!(reason.downcast_ref::<crate::error::PanicError>().map(|e| e.message.as_str()), Some("body failed"));
    }

    #[test]
    fn test_then_promise_adopts_inner() {
        let inner = Deferred::new();
        let inner_promise = inner.promise();
        let promise = Promise::resolved(2usize).then_promise(move |value| inner_promise.then(move |other: usize| value + other));
        assert_eq!(promise.state(), PromiseState::Pending);
        inner.resolve(3).unwrap();
        assert_eq!(promise.wait().unwrap().into_value(), Some(5));
    }

    #[test]
    fn test_continue_with_and_finally() {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_copy = finished.clone();
        let result = Promise::<usize>::rejected("reject")
            .finally(move || { finished_copy.fetch_add(1, Ordering::SeqCst); })
            .continue_with(|result| result.state())
            .wait()
            .unwrap();
        assert_eq!(result.into_value(), Some(PromiseState::Rejected));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_then_or_catch() {
        let result = Promise::<usize>::rejected("reject")
            .then_or_catch(|value| value.to_string(), |reason| reason.to_string())
            .wait()
            .unwrap();
        assert_eq!(result.into_value(), Some("reject".to_string()));
    }

    #[test]
    fn test_new_resolver() {
        let promise = Promise::new(|deferred| deferred.resolve(5usize).unwrap());
        assert_eq!(promise.wait().unwrap().into_value(), Some(5));

        let promise = Promise::<usize>::new(|_| panic!("resolver failed"));
        assert!(promise.wait().unwrap().is_rejected());
    }

    #[test]
    fn test_await() {
        let deferred = Deferred::new();
        let promise = deferred.promise().then(|value: usize| value + 1);
        deferred.resolve(41).unwrap();
        assert_eq!(block_on(async move { promise.await }).into_value(), Some(42));
    }

    #[test]
    fn test_wait_with_token() {
        let capture = UncaughtCapture::install();
        let source = crate::cancel::CancelationSource::new();
        let deferred = Deferred::<usize>::new();
        let promise = deferred.promise().wait_with_token(&source.token());
        source.cancel().unwrap();
        assert!(promise.wait().unwrap().is_canceled());

        //被提前取消后，原承诺的拒绝没有观察者
        deferred.reject("wait_with_token late").unwrap();
        assert_eq!(capture.count("wait_with_token late"), 1);
    }

    #[test]
    fn test_unobserved_rejection_reported_once() {
        let capture = UncaughtCapture::install();
        let deferred = Deferred::<usize>::new();
        let promise = deferred.promise();
        deferred.reject("unobserved rejection").unwrap();
        drop(promise);
        assert_eq!(capture.count("unobserved rejection"), 0);
        drop(deferred);
        assert_eq!(capture.count("unobserved rejection"), 1);

        //被观察的拒绝不会被报告
        let promise = Promise::<usize>::rejected("observed rejection").catch(|_| 0);
        drop(promise);
        assert_eq!(capture.count("observed rejection"), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "promise already consumed")]
    fn test_double_consume_detected() {
        let deferred = Deferred::<usize>::new();
        let first = deferred.promise();
        let second = deferred.promise();
        let _ = first.then(|value| value);
        let _ = second.then(|value| value);
    }
}
