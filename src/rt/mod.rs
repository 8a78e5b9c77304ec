//! # 延续调度
//!
//! 决定延续在哪个调度上下文中执行，以及是否可以在当前调用栈中立即执行。
//!
//! - 没有调度上下文的延续，在完成承诺的线程上通过本线程的蹦床队列执行，
//!   嵌套的完成只会入队而不会递归，保证调用栈深度有界
//! - 有调度上下文的延续，在承诺完成时总是投递到调度上下文，
//!   在附加时承诺已完成，且为同步完成行为并且当前线程绑定的就是目标上下文时，才会立即执行
//! - 没有调度上下文的强制异步延续，不会在附加调用中执行，
//!   而是延迟到当前线程下次执行蹦床、阻塞等待承诺或调用[run_deferred](fn.run_deferred.html)时执行
//!

use std::sync::Arc;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{config, error::RejectReason};

pub mod serial_local_thread;
pub mod serial_single_thread;

///
/// 投递到调度上下文的任务
///
pub type ContextTask = Box<dyn FnOnce() + Send + 'static>;

///
/// 调度上下文，由外部提供，负责在合适的线程上执行投递的任务
///
pub trait ScheduleContext: Send + Sync + 'static {
    /// 获取调度上下文的唯一id
    fn get_id(&self) -> usize;

    /// 投递一个任务
    fn post(&self, task: ContextTask);
}

static RT_UID: AtomicUsize = AtomicUsize::new(1);

/// 分配调度上下文的唯一id
pub fn alloc_rt_uid() -> usize {
    RT_UID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<dyn ScheduleContext>>> = RefCell::new(None);
    static TRAMPOLINE: RefCell<Option<VecDeque<ContextTask>>> = RefCell::new(None);
    static DEFERRED: RefCell<VecDeque<ContextTask>> = RefCell::new(VecDeque::new());
}

/// 获取当前线程绑定的调度上下文
pub fn current_context() -> Option<Arc<dyn ScheduleContext>> {
    CURRENT_CONTEXT.with(|current| current.borrow().clone())
}

/// 将指定的调度上下文绑定到当前线程，返回的守护者被释放时恢复之前的绑定
pub fn bind_current_context(context: Arc<dyn ScheduleContext>) -> ContextGuard {
    let previous = CURRENT_CONTEXT.with(|current| current.borrow_mut().replace(context));
    ContextGuard(previous)
}

///
/// 当前线程调度上下文绑定的守护者
///
pub struct ContextGuard(Option<Arc<dyn ScheduleContext>>);

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_CONTEXT.with(|current| *current.borrow_mut() = previous);
    }
}

// 判断指定的调度上下文是否是当前线程绑定的调度上下文
fn is_current_context(context: &Arc<dyn ScheduleContext>) -> bool {
    CURRENT_CONTEXT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map_or(false, |current| current.get_id() == context.get_id())
    })
}

// 蹦床守护者，在最外层任务结束时关闭当前线程的蹦床队列
struct TrampolineGuard;

impl Drop for TrampolineGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|queue| queue.borrow_mut().take());
    }
}

// 判断当前线程是否正在执行蹦床
fn is_trampoline_running() -> bool {
    TRAMPOLINE.with(|queue| queue.borrow().is_some())
}

// 执行任务，任务的panic会被报告为未捕获的拒绝，不影响之后的任务
fn run_guarded(task: ContextTask) {
    if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
        config::report_uncaught(RejectReason::from_panic(e));
    }
}

// 取出当前线程下一个待执行的任务，先取蹦床队列，再取被延迟的任务
fn pop_pending() -> Option<ContextTask> {
    TRAMPOLINE
        .with(|queue| {
            queue
                .borrow_mut()
                .as_mut()
                .and_then(|queue| queue.pop_front())
        })
        .or_else(|| DEFERRED.with(|deferred| deferred.borrow_mut().pop_front()))
}

// 在当前线程的蹦床上执行任务，如果当前线程正在执行蹦床，则入队等待，否则立即执行并排空蹦床
pub(crate) fn run_on_trampoline(task: ContextTask) {
    let task = TRAMPOLINE.with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(queue) => {
                //正在执行蹦床，则入队
                queue.push_back(task);
                None
            },
            None => {
                *queue = Some(VecDeque::new());
                Some(task)
            },
        }
    });

    if let Some(task) = task {
        let _guard = TrampolineGuard;
        run_guarded(task);
        while let Some(next) = pop_pending() {
            run_guarded(next);
        }
    }
}

// 延迟执行没有调度上下文的强制异步任务，正在执行蹦床则在当前任务之后执行，否则等待下次推动当前线程
fn defer_on_thread(task: ContextTask) {
    let task = TRAMPOLINE.with(|queue| {
        match queue.borrow_mut().as_mut() {
            Some(queue) => {
                queue.push_back(task);
                None
            },
            None => Some(task),
        }
    });

    if let Some(task) = task {
        DEFERRED.with(|deferred| deferred.borrow_mut().push_back(task));
    }
}

// 在当前线程上执行一个待执行的任务，用于阻塞等待时推动当前线程，没有任务则返回false
pub(crate) fn run_pending_once() -> bool {
    match pop_pending() {
        None => false,
        Some(task) => {
            if is_trampoline_running() {
                run_guarded(task);
            } else {
                run_on_trampoline(task);
            }
            true
        },
    }
}

/// 在当前线程上执行所有被延迟的强制异步延续，返回开始执行时被延迟的延续数量
pub fn run_deferred() -> usize {
    let len = DEFERRED.with(|deferred| deferred.borrow().len());
    if let Some(task) = DEFERRED.with(|deferred| deferred.borrow_mut().pop_front()) {
        //排空蹦床时会继续执行其它被延迟的延续
        run_on_trampoline(task);
    }
    len
}

///
/// 延续的目标调度上下文
///
#[derive(Clone)]
pub enum ContinuationContext {
    /// 没有调度上下文，在完成承诺的线程上执行
    Synchronous,
    /// 附加延续时当前线程绑定的调度上下文，没有则等同于Synchronous
    CurrentThread,
    /// 全局配置的前台上下文，没有配置则等同于Synchronous
    Foreground,
    /// 显式指定的调度上下文
    Explicit(Arc<dyn ScheduleContext>),
}

///
/// 延续的完成行为
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionBehavior {
    /// 附加时承诺已完成且上下文匹配，则立即执行
    Synchronous,
    /// 总是经过调度上下文执行
    Asynchronous,
}

///
/// 延续的调度选项
///
#[derive(Clone)]
pub struct ContinuationOptions {
    pub context:    ContinuationContext,    //目标调度上下文
    pub completion: CompletionBehavior,     //完成行为
}

impl Default for ContinuationOptions {
    fn default() -> Self {
        ContinuationOptions {
            context: ContinuationContext::Synchronous,
            completion: CompletionBehavior::Synchronous,
        }
    }
}

impl ContinuationOptions {
    /// 构建在指定调度上下文中执行的选项
    pub fn on(context: Arc<dyn ScheduleContext>) -> Self {
        ContinuationOptions {
            context: ContinuationContext::Explicit(context),
            completion: CompletionBehavior::Synchronous,
        }
    }

    /// 构建在附加时所在线程绑定的调度上下文中执行的选项
    pub fn current_thread() -> Self {
        ContinuationOptions {
            context: ContinuationContext::CurrentThread,
            completion: CompletionBehavior::Synchronous,
        }
    }

    /// 构建在前台上下文中执行的选项
    pub fn foreground() -> Self {
        ContinuationOptions {
            context: ContinuationContext::Foreground,
            completion: CompletionBehavior::Synchronous,
        }
    }

    /// 设置为总是经过调度上下文执行
    pub fn force_async(mut self) -> Self {
        self.completion = CompletionBehavior::Asynchronous;
        self
    }

    // 在附加时确定延续的调度目标
    pub(crate) fn resolve(&self) -> ScheduleTarget {
        self.resolve_with_foreground(config::foreground_context())
    }

    // 使用指定的前台上下文确定延续的调度目标
    fn resolve_with_foreground(&self, foreground: Option<Arc<dyn ScheduleContext>>) -> ScheduleTarget {
        let context = match &self.context {
            ContinuationContext::Synchronous => None,
            ContinuationContext::CurrentThread => current_context(),
            ContinuationContext::Foreground => foreground.clone(),
            ContinuationContext::Explicit(context) => Some(context.clone()),
        };

        let context = match (context, self.completion) {
            (None, CompletionBehavior::Asynchronous) => {
                //没有调度上下文的强制异步，优先使用前台上下文
                foreground
            },
            (context, _) => context,
        };

        ScheduleTarget {
            context,
            completion: self.completion,
        }
    }
}

// 已确定的调度目标
pub(crate) struct ScheduleTarget {
    context:    Option<Arc<dyn ScheduleContext>>,   //目标调度上下文
    completion: CompletionBehavior,                 //完成行为
}

impl ScheduleTarget {
    // 附加时承诺已完成，则调度延续
    pub(crate) fn dispatch_settled(self, task: ContextTask) {
        match self.context {
            None => {
                if self.completion == CompletionBehavior::Synchronous {
                    run_on_trampoline(task);
                } else {
                    //没有调度上下文的强制异步，不在附加调用中执行
                    defer_on_thread(task);
                }
            },
            Some(context) => {
                if self.completion == CompletionBehavior::Synchronous && is_current_context(&context) {
                    //上下文匹配，则立即执行
                    run_on_trampoline(task);
                } else {
                    context.post(task);
                }
            },
        }
    }

    // 承诺完成时调度已附加的延续
    pub(crate) fn dispatch_on_settle(self, task: ContextTask) {
        match self.context {
            None => run_on_trampoline(task),
            Some(context) => context.post(task),
        }
    }
}
