use std::thread;
use std::sync::Arc;
use std::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, const_mutex};

use crate::prelude::*;

// 所有测试共享的未捕获拒绝记录
static UNCAUGHT: Mutex<Vec<String>> = const_mutex(Vec::new());

// 依赖全局前台上下文的测试需要串行执行
static FOREGROUND_LOCK: Mutex<()> = const_mutex(());

///
/// 记录所有未捕获拒绝的处理器，测试通过唯一的拒绝原因文本计数
///
pub(crate) struct UncaughtCapture;

impl UncaughtCapture {
    // 安装记录处理器
    pub(crate) fn install() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        set_uncaught_rejection_handler(Some(Arc::new(|reason: RejectReason| {
            let reason = reason.to_string();
            let panic = reason.starts_with("panic:");
            UNCAUGHT.lock().push(reason);
            if panic {
                //用于验证处理器的panic被隔离
                panic!("uncaught handler failed");
            }
        })));
        UncaughtCapture
    }

    // 获取指定原因文本被报告的次数
    pub(crate) fn count(&self, marker: &str) -> usize {
        UNCAUGHT
            .lock()
            .iter()
            .filter(|reason| reason.as_str() == marker)
            .count()
    }
}

#[test]
fn test_single_transition() {
    let deferred = Deferred::<usize>::new();
    deferred.reject("single transition").unwrap();
    assert_eq!(deferred.resolve(1), Err(PromiseError::InvalidState("promise already settled")));
    assert!(deferred.cancel().is_err());
    assert!(!deferred.try_reject("other"));

    let result = deferred.promise().wait().unwrap();
    assert_eq!(result.reason().map(|r| r.to_string()), Some("single transition".to_string()));
}

#[test]
fn test_all_settled_scenario() {
    let d1 = Deferred::<usize>::new();
    let d2 = Deferred::<usize>::new();
    let promise = all_settled(vec![d1.promise(), d2.promise()]);

    let d1_copy = d1.clone();
    thread::spawn(move || d1_copy.reject("reject").unwrap()).join().unwrap();
    assert_eq!(promise.state(), PromiseState::Pending);
    thread::spawn(move || d2.resolve(20).unwrap()).join().unwrap();

    let results = promise.wait().unwrap().into_value().unwrap();
    assert_eq!(results[0].state(), PromiseState::Rejected);
    assert_eq!(results[0].reason().and_then(|r| r.downcast_ref::<&str>()), Some(&"reject"));
    assert_eq!(results[1].value(), Some(&20));
}

#[test]
fn test_race_precedence() {
    let canceled = Deferred::<usize>::new();
    let resolved = Deferred::<usize>::new();
    let promise = race(vec![canceled.promise(), resolved.promise()]);
    canceled.cancel().unwrap();
    resolved.resolve(1).unwrap();
    assert!(promise.wait().unwrap().is_canceled());

    let canceled = Deferred::<usize>::new();
    let resolved = Deferred::<usize>::new();
    let promise = race(vec![canceled.promise(), resolved.promise()]);
    resolved.resolve(1).unwrap();
    canceled.cancel().unwrap();
    assert_eq!(promise.wait().unwrap().into_value(), Some(1));
}

#[test]
fn test_first_fallback() {
    let capture = UncaughtCapture::install();
    let rejected = Deferred::<usize>::new();
    let resolved = Deferred::<usize>::new();
    let promise = first(vec![rejected.promise(), resolved.promise()]);

    rejected.reject("first fallback").unwrap();
    assert_eq!(promise.state(), PromiseState::Pending);
    resolved.resolve(5).unwrap();
    assert_eq!(promise.wait().unwrap().into_value(), Some(5));
    assert_eq!(capture.count("first fallback"), 0);
}

#[test]
fn test_each_early_disposal() {
    let capture = UncaughtCapture::install();
    let sources: Vec<Deferred<usize>> = (0..5).map(|_| Deferred::new()).collect();
    let mut iter = each(sources.iter().map(|deferred| deferred.promise()));

    sources[1].resolve(1).unwrap();
    sources[3].resolve(3).unwrap();
    let first = iter.move_next().wait().unwrap().into_value().unwrap().unwrap();
    let second = iter.move_next().wait().unwrap().into_value().unwrap().unwrap();
    assert_eq!(first.0, 1);
    assert_eq!(second.0, 3);
    assert_eq!(iter.remaining(), 3);

    //释放前等待中的读取被取消，不会得到剩余的记录
    let pending = iter.move_next();
    assert_eq!(pending.state(), PromiseState::Pending);
    iter.dispose();
    assert!(pending.wait().unwrap().is_canceled());

    sources[0].resolve(0).unwrap();
    sources[2].cancel().unwrap();
    sources[4].reject("each rejected after dispose").unwrap();
    assert!(sources.iter().all(|deferred| !deferred.is_pending()));

    //完成和取消不会被报告，释放后的拒绝只报告一次
    assert_eq!(capture.count("each rejected after dispose"), 1);
}

#[test]
fn test_idempotent_cancelation() {
    let source = CancelationSource::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count_copy = count.clone();
    let _registration = source
        .token()
        .register(move || {
            count_copy.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    source.cancel().unwrap();
    source.cancel().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_continuations_in_attachment_order() {
    let deferred = Deferred::<usize>::new();
    let retainer = deferred.promise().retain();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut promises = Vec::new();
    for index in 0..8 {
        let order = order.clone();
        promises.push(retainer.wait_async().then(move |_| order.lock().push(index)));
    }

    deferred.resolve(1).unwrap();
    assert_eq!(&*order.lock(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(all(promises).wait().unwrap().is_resolved());
}

#[test]
fn test_foreground_context() {
    let _lock = FOREGROUND_LOCK.lock();
    let runner = SingleContextRunner::new();
    let context = runner.startup().unwrap();
    let previous = set_foreground_context(Some(Arc::new(context.clone())));

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_copy = ran.clone();
    let promise = Promise::resolved(1usize)
        .with_options(ContinuationOptions::foreground())
        .then(move |value| {
            ran_copy.fetch_add(1, Ordering::SeqCst);
            value
        });
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    //没有调度上下文的强制异步，使用前台上下文
    let promise_async = Promise::resolved(2usize).force_async().then(|value| value);

    assert_eq!(runner.run().unwrap(), 2);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(promise.wait().unwrap().into_value(), Some(1));
    assert_eq!(promise_async.wait().unwrap().into_value(), Some(2));

    set_foreground_context(previous);
}

#[test]
fn test_force_async_without_context() {
    let _lock = FOREGROUND_LOCK.lock();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_copy = ran.clone();
    let promise = Promise::resolved(1usize)
        .with_options(ContinuationOptions::default().force_async())
        .then(move |value| {
            ran_copy.fetch_add(1, Ordering::SeqCst);
            value + 1
        });

    //附加调用返回前不会执行
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(promise.state(), PromiseState::Pending);

    //等待时推动当前线程被延迟的延续
    assert_eq!(promise.wait().unwrap().into_value(), Some(2));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wait_inside_continuation() {
    let promise = Promise::resolved(1usize).then(|value| {
        Promise::resolved(value + 1)
            .wait()
            .unwrap()
            .into_value()
            .unwrap_or(0)
    });
    assert_eq!(promise.wait().unwrap().into_value(), Some(2));

    let promise = Promise::resolved(3usize).then(|value| {
        LocalContextRunner::new()
            .block_on(Promise::resolved(value * 2))
            .unwrap()
            .into_value()
            .unwrap_or(0)
    });
    assert_eq!(promise.wait().unwrap().into_value(), Some(6));
}

#[test]
fn test_uncaught_handler_panic_isolated() {
    let capture = UncaughtCapture::install();
    let deferred = Deferred::<usize>::new();
    deferred.reject("panic: unobserved").unwrap();
    drop(deferred);
    assert_eq!(capture.count("panic: unobserved"), 1);

    //处理器panic后，后续的报告不受影响
    drop(Promise::<usize>::rejected("after handler panic"));
    assert_eq!(capture.count("after handler panic"), 1);
}

#[test]
fn test_cross_thread_chain() {
    let deferred = Deferred::<usize>::new();
    let promise = deferred
        .promise()
        .then(|value| value + 1)
        .then_promise(|value| {
            let inner = Deferred::new();
            let promise = inner.promise();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                inner.resolve(value * 2).unwrap();
            });
            promise
        })
        .catch(|_| 0);

    thread::spawn(move || deferred.resolve(1).unwrap());
    assert_eq!(promise.wait().unwrap().into_value(), Some(4));
}

#[test]
fn test_parallel_with_local_context() {
    let runner = LocalContextRunner::new();
    let total = Arc::new(AtomicUsize::new(0));
    let total_copy = total.clone();
    let promise = parallel_for(1, 11, move |index, _| {
        total_copy.fetch_add(index, Ordering::SeqCst);
        Promise::resolved(())
    }, ParallelOptions::default()
        .max_degree_of_parallelism(3)
        .context(runner.shared_context()));

    assert!(runner.block_on(promise).unwrap().is_resolved());
    assert_eq!(total.load(Ordering::SeqCst), 55);
}

#[test]
fn test_all_random_completion_order() {
    use rand::seq::SliceRandom;

    for _ in 0..20 {
        let sources: Vec<Deferred<usize>> = (0..16).map(|_| Deferred::new()).collect();
        let promise = all(sources.iter().map(|deferred| deferred.promise()));

        let mut order: Vec<usize> = (0..16).collect();
        order.shuffle(&mut rand::thread_rng());
        let handles: Vec<_> = order
            .into_iter()
            .map(|index| {
                let deferred = sources[index].clone();
                thread::spawn(move || deferred.resolve(index).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(promise.wait().unwrap().into_value(), Some((0..16).collect::<Vec<usize>>()));
    }
}
