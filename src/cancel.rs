//! # 协作式取消
//!
//! 取消源持有取消标记和已注册的回调，取消令牌只持有取消源的弱引用。
//! 取消源被取消时，所有已注册的回调按注册顺序在锁外执行一次。
//!
//! ```
//! use pi_promise::cancel::CancelationSource;
//!
//! let source = CancelationSource::new();
//! let token = source.token();
//! let _ = token.register(|| println!("canceled"));
//! source.cancel().unwrap();
//! assert!(token.is_cancelation_requested());
//! ```
//!

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slotmap::{DefaultKey, SlotMap};

use crate::error::{AggregateException, PromiseError, RejectReason};

// 取消回调
type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

// 取消源的内部状态
struct CancelState {
    disposed:   bool,                                       //是否已释放
    next_order: u64,                                        //下一个注册序号
    callbacks:  SlotMap<DefaultKey, (u64, CancelCallback)>, //已注册的回调
    links:      Vec<CancelationRegistration>,               //在父令牌上的注册
}

// 取消源
struct CancelInner {
    requested:  AtomicBool,         //是否已请求取消
    state:      Mutex<CancelState>, //内部状态
}

///
/// 取消源
///
#[derive(Clone)]
pub struct CancelationSource(Arc<CancelInner>);

impl fmt::Debug for CancelationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationSource")
            .field("requested", &self.0.requested.load(Ordering::Acquire))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Default for CancelationSource {
    fn default() -> Self {
        CancelationSource(Arc::new(CancelInner {
            requested: AtomicBool::new(false),
            state: Mutex::new(CancelState {
                disposed: false,
                next_order: 0,
                callbacks: SlotMap::new(),
                links: Vec::new(),
            }),
        }))
    }
}

impl CancelationSource {
    /// 构建一个取消源
    pub fn new() -> Self {
        CancelationSource::default()
    }

    /// 构建一个与指定令牌关联的取消源，任意一个令牌被取消时，新的取消源也被取消
    pub fn new_linked(tokens: &[CancelationToken]) -> Self {
        let source = CancelationSource::new();

        for token in tokens {
            let weak = Arc::downgrade(&source.0);
            let registration = token.try_register(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = CancelationSource(inner).cancel() {
                        if let PromiseError::Aggregate(aggregate) = e {
                            //将关联取消源上的回调异常交给父取消源聚合
                            std::panic::resume_unwind(Box::new(aggregate));
                        }
                    }
                }
            });

            if let Some(registration) = registration {
                let mut state = source.0.state.lock();
                if state.disposed || source.0.requested.load(Ordering::Acquire) {
                    //已被立即取消，则不需要保留注册
                    continue;
                }
                state.links.push(registration);
            }
        }

        source
    }

    /// 获取当前取消源的取消令牌
    pub fn token(&self) -> CancelationToken {
        CancelationToken(TokenRef::Source(Arc::downgrade(&self.0)))
    }

    /// 判断是否已请求取消，已释放的取消源返回false
    pub fn is_cancelation_requested(&self) -> bool {
        !self.is_disposed() && self.0.requested.load(Ordering::Acquire)
    }

    /// 判断取消源是否已释放
    pub fn is_disposed(&self) -> bool {
        self.0.state.lock().disposed
    }

    /// 请求取消，按注册顺序执行所有已注册的回调，重复取消会被忽略；
    /// 回调中的panic会被收集，并在所有回调执行完成后以聚合异常返回
    pub fn cancel(&self) -> Result<(), PromiseError> {
        let (callbacks, links) = {
            let mut state = self.0.state.lock();
            if state.disposed {
                return Err(PromiseError::Disposed("cancelation source disposed"));
            }

            if self.0.requested.swap(true, Ordering::AcqRel) {
                //已请求过取消，则忽略
                return Ok(());
            }

            let mut callbacks: Vec<(u64, CancelCallback)> = mem::take(&mut state.callbacks)
                .into_iter()
                .map(|(_, callback)| callback)
                .collect();
            callbacks.sort_by_key(|(order, _)| *order);
            (callbacks, mem::take(&mut state.links))
        };
        log::debug!("Cancelation requested, callbacks: {}", callbacks.len());

        for link in links {
            link.unregister();
        }

        let mut errors = Vec::new();
        for (_, callback) in callbacks {
            if let Err(e) = catch_unwind(AssertUnwindSafe(callback)) {
                errors.push(RejectReason::from_panic(e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PromiseError::Aggregate(AggregateException::new(errors)))
        }
    }

    /// 释放取消源，令牌随之失效，未执行的回调会被丢弃
    pub fn dispose(&self) {
        let (callbacks, links) = {
            let mut state = self.0.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (mem::take(&mut state.callbacks), mem::take(&mut state.links))
        };

        for link in links {
            link.unregister();
        }
        //在锁外释放回调
        mem::drop(callbacks);
    }
}

// 令牌引用的取消源
#[derive(Clone)]
enum TokenRef {
    None,                       //永远不会被取消
    Canceled,                   //已被取消
    Source(Weak<CancelInner>),  //取消源
}

///
/// 取消令牌，只持有取消源的弱引用
///
#[derive(Clone)]
pub struct CancelationToken(TokenRef);

impl Default for CancelationToken {
    fn default() -> Self {
        CancelationToken::none()
    }
}

impl fmt::Debug for CancelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationToken")
            .field("requested", &self.is_cancelation_requested())
            .field("can_be_canceled", &self.can_be_canceled())
            .finish()
    }
}

impl CancelationToken {
    /// 获取永远不会被取消的令牌
    pub fn none() -> Self {
        CancelationToken(TokenRef::None)
    }

    /// 获取已被取消的令牌
    pub fn canceled() -> Self {
        CancelationToken(TokenRef::Canceled)
    }

    /// 判断是否已请求取消，取消源已释放时返回false
    pub fn is_cancelation_requested(&self) -> bool {
        match &self.0 {
            TokenRef::None => false,
            TokenRef::Canceled => true,
            TokenRef::Source(weak) => {
                if let Some(inner) = weak.upgrade() {
                    inner.requested.load(Ordering::Acquire) && !inner.state.lock().disposed
                } else {
                    false
                }
            },
        }
    }

    /// 判断令牌是否可能被取消
    pub fn can_be_canceled(&self) -> bool {
        match &self.0 {
            TokenRef::None => false,
            TokenRef::Canceled => true,
            TokenRef::Source(weak) => {
                if let Some(inner) = weak.upgrade() {
                    !inner.state.lock().disposed
                } else {
                    false
                }
            },
        }
    }

    /// 注册取消回调，已取消则立即执行回调，取消源已释放则返回错误
    pub fn register<F>(&self, callback: F) -> Result<CancelationRegistration, PromiseError>
        where F: FnOnce() + Send + 'static {
        match &self.0 {
            TokenRef::None => Ok(CancelationRegistration::empty()),
            TokenRef::Canceled => {
                callback();
                Ok(CancelationRegistration::empty())
            },
            TokenRef::Source(weak) => {
                let inner = match weak.upgrade() {
                    None => return Err(PromiseError::Disposed("cancelation source disposed")),
                    Some(inner) => inner,
                };

                let mut state = inner.state.lock();
                if state.disposed {
                    return Err(PromiseError::Disposed("cancelation source disposed"));
                }

                if inner.requested.load(Ordering::Acquire) {
                    //已请求取消，则在锁外立即执行回调
                    mem::drop(state);
                    callback();
                    return Ok(CancelationRegistration::empty());
                }

                let order = state.next_order;
                state.next_order += 1;
                let key = state.callbacks.insert((order, Box::new(callback)));
                Ok(CancelationRegistration {
                    source: weak.clone(),
                    key: Some(key),
                })
            },
        }
    }

    /// 尝试注册取消回调，取消源已释放则返回None
    pub fn try_register<F>(&self, callback: F) -> Option<CancelationRegistration>
        where F: FnOnce() + Send + 'static {
        self.register(callback).ok()
    }
}

///
/// 取消回调的注册
///
#[derive(Debug)]
pub struct CancelationRegistration {
    source: Weak<CancelInner>,  //取消源
    key:    Option<DefaultKey>, //回调的键
}

impl CancelationRegistration {
    // 构建一个空的注册
    fn empty() -> Self {
        CancelationRegistration {
            source: Weak::new(),
            key: None,
        }
    }

    /// 判断回调是否仍然处于注册状态
    pub fn is_registered(&self) -> bool {
        match (self.key, self.source.upgrade()) {
            (Some(key), Some(inner)) => inner.state.lock().callbacks.contains_key(key),
            _ => false,
        }
    }

    /// 注销回调，回调已执行、已注销或取消源已释放时返回false
    pub fn unregister(self) -> bool {
        match (self.key, self.source.upgrade()) {
            (Some(key), Some(inner)) => {
                let callback = inner.state.lock().callbacks.remove(key);
                //在锁外释放回调
                callback.is_some()
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_idempotent() {
        let source = CancelationSource::new();
        let token = source.token();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_copy = counter.clone();
        token.register(move || {
            counter_copy.fetch_add(1, Ordering::SeqCst);
        }).unwrap();

        assert!(source.cancel().is_ok());
        assert!(source.cancel().is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelation_requested());
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let source = CancelationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registrations = Vec::new();
        for index in 0..5 {
            let order_copy = order.clone();
            registrations.push(token.register(move || order_copy.lock().push(index)).unwrap());
        }
        //注销后释放的槽位会被复用，不能影响执行顺序
        assert!(registrations.remove(1).unregister());
        let order_copy = order.clone();
        token.register(move || order_copy.lock().push(5)).unwrap();

        source.cancel().unwrap();
        assert_eq!(&*order.lock(), &[0, 2, 3, 4, 5]);
    }

    #[test]
    fn test_register_after_cancel() {
        let source = CancelationSource::new();
        source.cancel().unwrap();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_copy = invoked.clone();
        let registration = source.token().register(move || invoked_copy.store(true, Ordering::SeqCst)).unwrap();
        assert!(invoked.load(Ordering::SeqCst));
        assert!(!registration.is_registered());
    }

    #[test]
    fn test_dispose() {
        let source = CancelationSource::new();
        let token = source.token();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_copy = invoked.clone();
        let registration = token.register(move || invoked_copy.store(true, Ordering::SeqCst)).unwrap();
        source.dispose();

        assert!(!token.is_cancelation_requested());
        assert!(!token.can_be_canceled());
        assert!(!registration.unregister());
        assert_eq!(token.register(|| {}).unwrap_err(), PromiseError::Disposed("cancelation source disposed"));
        assert!(token.try_register(|| {}).is_none());
        assert!(source.cancel().is_err());
        assert!(!invoked.load(Ordering::SeqCst));

        //取消源被丢弃后，令牌同样失效
        let source = CancelationSource::new();
        let token = source.token();
        source.cancel().unwrap();
        mem::drop(source);
        assert!(!token.is_cancelation_requested());
    }

    #[test]
    fn test_callback_panic_aggregated() {
        let source = CancelationSource::new();
        let token = source.token();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_copy = invoked.clone();
        token.register(|| panic!("first")).unwrap();
        token.register(move || invoked_copy.store(true, Ordering::SeqCst)).unwrap();

        match source.cancel() {
            Err(PromiseError::Aggregate(aggregate)) => {
                assert_eq!(aggregate.len(), 1);
                assert_eq!(aggregate.inner()[0].to_string(), "Callback panicked, reason: first");
            },
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_linked_source() {
        let parent = CancelationSource::new();
        let other = CancelationSource::new();
        let linked = CancelationSource::new_linked(&[parent.token(), other.token(), CancelationToken::none()]);
        assert!(!linked.is_cancelation_requested());

        parent.cancel().unwrap();
        assert!(linked.is_cancelation_requested());
        assert!(!other.is_cancelation_requested());

        let linked = CancelationSource::new_linked(&[CancelationToken::canceled()]);
        assert!(linked.is_cancelation_requested());
    }

    #[test]
    fn test_special_tokens() {
        assert!(!CancelationToken::none().can_be_canceled());
        assert!(CancelationToken::canceled().is_cancelation_requested());
        assert!(!CancelationToken::default().is_cancelation_requested());
    }
}
