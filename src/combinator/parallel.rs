//! # 并行循环
//!
//! 最多同时运行指定数量的循环体，所有工作者从同一个迭代器中取出元素。
//! 任意循环体被拒绝或迭代器panic时，循环会请求取消，已开始的循环体会继续运行直到结束，
//! 所有异常按循环体、迭代器、取消回调的顺序聚合，异常优先于取消。
//!

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{cancel::{CancelationRegistration, CancelationSource, CancelationToken},
            error::{AggregateException, PromiseError, RejectReason},
            promise::{invoke_guarded, Deferred, Promise, PromiseResult},
            rt::{run_on_trampoline, ScheduleContext}};

///
/// 并行循环的选项
///
#[derive(Clone)]
pub struct ParallelOptions {
    max_degree_of_parallelism:  usize,                              //最大并发度
    cancelation_token:          CancelationToken,                   //外部取消令牌
    context:                    Option<Arc<dyn ScheduleContext>>,   //工作者运行的调度上下文
}

impl fmt::Debug for ParallelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelOptions")
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("cancelation_token", &self.cancelation_token)
            .field("context", &self.context.as_ref().map(|context| context.get_id()))
            .finish()
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        ParallelOptions {
            max_degree_of_parallelism: num_cpus::get(),
            cancelation_token: CancelationToken::none(),
            context: None,
        }
    }
}

impl ParallelOptions {
    /// 设置最大并发度，默认为cpu核数
    pub fn max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.max_degree_of_parallelism = max;
        self
    }

    /// 设置外部取消令牌
    pub fn cancelation_token(mut self, token: CancelationToken) -> Self {
        self.cancelation_token = token;
        self
    }

    /// 设置工作者运行的调度上下文，未设置则在当前线程的蹦床上运行
    pub fn context(mut self, context: Arc<dyn ScheduleContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// 获取最大并发度
    pub fn get_max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }
}

// 并行循环的共享状态
struct LoopState<It, F> {
    iter:               Mutex<Option<It>>,                          //共享的迭代器，循环结束时被释放
    body:               F,                                          //循环体
    source:             CancelationSource,                          //内部取消源
    token:              CancelationToken,                           //内部取消令牌
    registration:       Mutex<Option<CancelationRegistration>>,     //外部取消令牌上的注册
    context:            Option<Arc<dyn ScheduleContext>>,           //工作者运行的调度上下文
    max_workers:        usize,                                      //最大并发度
    launched:           AtomicUsize,                                //已启动的工作者数量
    pending:            AtomicUsize,                                //未结束的工作者和取消请求数量
    body_errors:        Mutex<Vec<RejectReason>>,                   //循环体的异常
    iterator_errors:    Mutex<Vec<RejectReason>>,                   //迭代器的异常
    cancel_errors:      Mutex<Vec<RejectReason>>,                   //取消回调的异常
    deferred:           Deferred<()>,                               //循环的承诺
}

/// 对[from, to)区间内的每个序号并行执行循环体
pub fn parallel_for<F>(from: usize,
                       to: usize,
                       body: F,
                       options: ParallelOptions) -> Promise<()>
    where F: Fn(usize, CancelationToken) -> Promise<()> + Send + Sync + 'static {
    parallel_for_each(from..to, body, options)
}

/// 对迭代器的每个元素并行执行循环体，最多同时运行指定数量的循环体；
/// 工作者按需启动，只有取到元素的工作者才会启动下一个工作者
pub fn parallel_for_each<I, F>(source: I,
                               body: F,
                               options: ParallelOptions) -> Promise<()>
    where I: IntoIterator,
          I::IntoIter: Send + 'static,
          I::Item: Send + 'static,
          F: Fn(I::Item, CancelationToken) -> Promise<()> + Send + Sync + 'static {
    let ParallelOptions {
        max_degree_of_parallelism,
        cancelation_token,
        context,
    } = options;
    if max_degree_of_parallelism == 0 {
        return Promise::rejected(PromiseError::InvalidArgument("max degree of parallelism must be greater than 0"));
    }

    let cancel_source = CancelationSource::new();
    let token = cancel_source.token();
    let deferred = Deferred::new();
    let promise = deferred.promise();
    let state = Arc::new(LoopState {
        iter: Mutex::new(Some(source.into_iter())),
        body,
        source: cancel_source,
        token,
        registration: Mutex::new(None),
        context,
        max_workers: max_degree_of_parallelism,
        launched: AtomicUsize::new(1),
        pending: AtomicUsize::new(1),
        body_errors: Mutex::new(Vec::new()),
        iterator_errors: Mutex::new(Vec::new()),
        cancel_errors: Mutex::new(Vec::new()),
        deferred,
    });

    //外部取消时取消内部取消源，并收集取消回调的异常
    let weak = Arc::downgrade(&state);
    if let Some(registration) = cancelation_token.try_register(move || {
        if let Some(state) = weak.upgrade() {
            cancel_loop(&state);
        }
    }) {
        *state.registration.lock() = Some(registration);
    }

    log::debug!("Parallel loop started, max degree: {}", max_degree_of_parallelism);
    schedule_worker(state);

    promise
}

// 调度工作者的下一步
fn schedule_worker<It, F>(state: Arc<LoopState<It, F>>)
    where It: Iterator + Send + 'static,
          It::Item: Send + 'static,
          F: Fn(It::Item, CancelationToken) -> Promise<()> + Send + Sync + 'static {
    match state.context.clone() {
        None => run_on_trampoline(Box::new(move || run_worker(state))),
        Some(context) => context.post(Box::new(move || run_worker(state))),
    }
}

// 未达到最大并发度，则启动下一个工作者
fn launch_worker<It, F>(state: &Arc<LoopState<It, F>>)
    where It: Iterator + Send + 'static,
          It::Item: Send + 'static,
          F: Fn(It::Item, CancelationToken) -> Promise<()> + Send + Sync + 'static {
    let max_workers = state.max_workers;
    if state
        .launched
        .fetch_update(Ordering::AcqRel,
                      Ordering::Acquire,
                      |launched| if launched < max_workers { Some(launched + 1) } else { None })
        .is_ok() {
        state.pending.fetch_add(1, Ordering::AcqRel);
        schedule_worker(state.clone());
    }
}

// 取出下一个元素并执行循环体，循环体完成后继续调度当前工作者
fn run_worker<It, F>(state: Arc<LoopState<It, F>>)
    where It: Iterator + Send + 'static,
          It::Item: Send + 'static,
          F: Fn(It::Item, CancelationToken) -> Promise<()> + Send + Sync + 'static {
    if state.token.is_cancelation_requested() {
        return finish_worker(state);
    }

    let next = {
        let mut iter = state.iter.lock();
        if state.token.is_cancelation_requested() {
            //取得迭代器后再次检查取消
            Ok(None)
        } else {
            match iter.as_mut() {
                None => Ok(None),
                Some(iter) => invoke_guarded(|| iter.next()),
            }
        }
    };

    let item = match next {
        Ok(Some(item)) => item,
        Ok(None) => return finish_worker(state),
        Err(reason) => {
            state.iterator_errors.lock().push(reason);
            cancel_loop(&state);
            return finish_worker(state);
        },
    };

    launch_worker(&state);

    let token = state.token.clone();
    let promise = match invoke_guarded(|| (state.body)(item, token)) {
        Ok(promise) => promise,
        Err(reason) => Promise::settled(PromiseResult::Rejected(reason)),
    };

    promise.subscribe(move |result| {
        match result {
            PromiseResult::Resolved(()) => schedule_worker(state),
            PromiseResult::Rejected(reason) => {
                state.body_errors.lock().push(reason);
                cancel_loop(&state);
                finish_worker(state);
            },
            PromiseResult::Canceled => {
                //循环体被取消，则取消整个循环
                cancel_loop(&state);
                finish_worker(state);
            },
        }
    });
}

// 请求取消循环，收集取消回调的异常；取消期间循环不会结束，循环已结束则忽略
fn cancel_loop<It, F>(state: &Arc<LoopState<It, F>>) {
    if state
        .pending
        .fetch_update(Ordering::AcqRel,
                      Ordering::Acquire,
                      |pending| if pending > 0 { Some(pending + 1) } else { None })
        .is_err() {
        return;
    }

    if let Err(PromiseError::Aggregate(aggregate)) = state.source.cancel() {
        state.cancel_errors.lock().extend(aggregate.into_inner());
    }
    finish_worker(state.clone());
}

// 结束当前工作者或取消请求，最后一个结束的负责释放迭代器并完成循环
fn finish_worker<It, F>(state: Arc<LoopState<It, F>>) {
    if state.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    //在锁外释放迭代器
    let iter = state.iter.lock().take();
    mem::drop(iter);

    let registration = state.registration.lock().take();
    if let Some(registration) = registration {
        registration.unregister();
    }

    let mut errors = mem::take(&mut *state.body_errors.lock());
    errors.extend(mem::take(&mut *state.iterator_errors.lock()));
    errors.extend(mem::take(&mut *state.cancel_errors.lock()));
    let canceled = state.source.is_cancelation_requested();
    state.source.dispose();

    if !errors.is_empty() {
        log::debug!("Parallel loop failed, errors: {}", errors.len());
        state.deferred.try_settle(PromiseResult::Rejected(RejectReason::new(AggregateException::new(errors))));
    } else if canceled {
        state.deferred.try_cancel();
    } else {
        state.deferred.try_resolve(());
    }
}
