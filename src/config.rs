//! 进程范围的运行时配置
//!
//! 未捕获拒绝处理器和前台上下文都只有一个当前值，设置新值会替换旧值。
//!

use std::sync::Arc;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::{RwLock, const_rwlock};

use crate::{error::RejectReason, rt::ScheduleContext};

///
/// 未捕获拒绝处理器
///
pub type UncaughtRejectionHandler = Arc<dyn Fn(RejectReason) + Send + Sync + 'static>;

static UNCAUGHT_REJECTION_HANDLER: RwLock<Option<UncaughtRejectionHandler>> = const_rwlock(None);
static FOREGROUND_CONTEXT: RwLock<Option<Arc<dyn ScheduleContext>>> = const_rwlock(None);

/// 设置未捕获拒绝处理器，返回上一个处理器，None表示恢复为默认的日志处理器
pub fn set_uncaught_rejection_handler(handler: Option<UncaughtRejectionHandler>) -> Option<UncaughtRejectionHandler> {
    let mut current = UNCAUGHT_REJECTION_HANDLER.write();
    std::mem::replace(&mut *current, handler)
}

/// 获取当前的未捕获拒绝处理器
pub fn uncaught_rejection_handler() -> Option<UncaughtRejectionHandler> {
    UNCAUGHT_REJECTION_HANDLER.read().clone()
}

/// 设置前台上下文，返回上一个前台上下文
pub fn set_foreground_context(context: Option<Arc<dyn ScheduleContext>>) -> Option<Arc<dyn ScheduleContext>> {
    let mut current = FOREGROUND_CONTEXT.write();
    std::mem::replace(&mut *current, context)
}

/// 获取当前的前台上下文
pub fn foreground_context() -> Option<Arc<dyn ScheduleContext>> {
    FOREGROUND_CONTEXT.read().clone()
}

// 将没有任何观察者的拒绝原因报告给未捕获拒绝处理器，处理器的panic会被隔离
pub(crate) fn report_uncaught(reason: RejectReason) {
    //在锁外调用处理器，允许处理器重入配置
    let handler = uncaught_rejection_handler();
    match handler {
        None => {
            log::error!("Uncaught rejection, type: {}, reason: {}", reason.type_name(), reason);
        },
        Some(handler) => {
            if let Err(e) = catch_unwind(AssertUnwindSafe(|| handler(reason.clone()))) {
                let e = RejectReason::from_panic(e);
                log::error!("Uncaught rejection handler panicked, reason: {}, rejection: {}", e, reason);
            }
        },
    }
}
