//! 本地线程调度上下文
//!
//! 投递到本地调度上下文的延续只会在推动执行器的线程上执行，执行时当前线程绑定这个调度上下文。
//!

use std::fmt;
use std::thread;
use std::hint;
use std::sync::Arc;
use std::cell::Cell;
use std::marker::PhantomData;

use crossbeam_channel::{bounded, TryRecvError};
use crossbeam_queue::SegQueue;

use crate::{error::PromiseError,
            promise::{Promise, PromiseResult},
            rt::{ContextTask, ScheduleContext, alloc_rt_uid, bind_current_context, run_pending_once}};

///
/// 本地线程调度上下文，可以在任意线程上投递
///
#[derive(Clone)]
pub struct LocalContext(Arc<(
    usize,                  //调度上下文唯一id
    SegQueue<ContextTask>,  //待执行的延续队列
)>);

impl fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalContext")
            .field("id", &(self.0).0)
            .field("len", &(self.0).1.len())
            .finish()
    }
}

impl ScheduleContext for LocalContext {
    fn get_id(&self) -> usize {
        (self.0).0
    }

    fn post(&self, task: ContextTask) {
        (self.0).1.push(task);
    }
}

impl LocalContext {
    /// 获取待执行的延续数量
    pub fn len(&self) -> usize {
        (self.0).1.len()
    }

    /// 判断是否没有待执行的延续
    pub fn is_empty(&self) -> bool {
        (self.0).1.is_empty()
    }
}

///
/// 本地线程调度上下文的执行器，只能在一个线程上推动
///
pub struct LocalContextRunner {
    context:    LocalContext,           //本地调度上下文
    _marker:    PhantomData<Cell<()>>,  //不允许跨线程共享
}

impl Default for LocalContextRunner {
    fn default() -> Self {
        LocalContextRunner::new()
    }
}

impl LocalContextRunner {
    /// 构建本地调度上下文的执行器
    pub fn new() -> Self {
        let inner = (
            alloc_rt_uid(),
            SegQueue::new(),
        );

        LocalContextRunner {
            context: LocalContext(Arc::new(inner)),
            _marker: PhantomData,
        }
    }

    /// 获取本地调度上下文
    pub fn get_context(&self) -> LocalContext {
        self.context.clone()
    }

    /// 获取本地调度上下文的共享引用，用于延续选项
    pub fn shared_context(&self) -> Arc<dyn ScheduleContext> {
        Arc::new(self.context.clone())
    }

    /// 执行一个待执行的延续，返回是否执行了延续
    #[inline]
    pub fn run_once(&self) -> bool {
        match (self.context.0).1.pop() {
            None => false,
            Some(task) => {
                let _guard = bind_current_context(self.shared_context());
                task();
                true
            },
        }
    }

    /// 执行当前所有待执行的延续，执行过程中投递的延续会在下次执行，返回执行的延续数量
    pub fn run(&self) -> usize {
        let len = self.context.len();
        let _guard = bind_current_context(self.shared_context());

        let mut count = 0;
        while count < len {
            match (self.context.0).1.pop() {
                None => break,
                Some(task) => {
                    task();
                    count += 1;
                },
            }
        }

        count
    }

    /// 在当前线程上推动本地调度上下文，直到指定的承诺完成
    pub fn block_on<T>(&self, promise: Promise<T>) -> Result<PromiseResult<T>, PromiseError>
        where T: Send + 'static {
        let (sender, receiver) = bounded(1);
        promise.subscribe(move |result| {
            let _ = sender.send(result);
        });

        let mut idle = 0;
        loop {
            if self.run_once() || run_pending_once() {
                idle = 0;
            } else {
                idle += 1;
                if idle > 3 {
                    //没有待执行的延续，则让出当前线程后继续等待
                    thread::yield_now();
                } else {
                    hint::spin_loop();
                }
            }

            //尝试获取承诺的结果
            match receiver.try_recv() {
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => {
                    //承诺在完成前被丢弃
                    return Err(PromiseError::InvalidState("promise dropped before settled"));
                },
                Ok(result) => return Ok(result),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::promise::Deferred;
    use crate::rt::{current_context, ContinuationOptions};

    #[test]
    fn test_local_context_continuations() {
        let runner = LocalContextRunner::new();
        let deferred = Deferred::new();
        let thread_id = Arc::new(Mutex::new(None));

        let thread_id_copy = thread_id.clone();
        let context_id = Arc::new(AtomicUsize::new(0));
        let context_id_copy = context_id.clone();
        let promise = deferred
            .promise()
            .schedule_on(runner.shared_context())
            .then(move |value: usize| {
                *thread_id_copy.lock() = Some(thread::current().id());
                context_id_copy.store(current_context().map(|c| c.get_id()).unwrap_or(0), Ordering::SeqCst);
                value + 1
            });

        let deferred_copy = deferred.clone();
        thread::spawn(move || deferred_copy.resolve(1).unwrap()).join().unwrap();
        assert!(thread_id.lock().is_none());
        assert_eq!(runner.get_context().len(), 1);

        assert_eq!(runner.block_on(promise).unwrap().into_value(), Some(2));
        assert_eq!(*thread_id.lock(), Some(thread::current().id()));
        assert_eq!(context_id.load(Ordering::SeqCst), runner.get_context().get_id());
    }

    #[test]
    fn test_local_context_run() {
        let runner = LocalContextRunner::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            runner.get_context().post(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(runner.run(), 10);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(!runner.run_once());
    }

    #[test]
    fn test_force_async_on_current_context() {
        let runner = LocalContextRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_copy = order.clone();
        let options = ContinuationOptions::current_thread().force_async();
        let context = runner.get_context();
        context.post(Box::new(move || {
            let inner = order_copy.clone();
            let _ = Promise::resolved(()).with_options(options).then(move |_| inner.lock().push(2));
            order_copy.lock().push(1);
        }));

        assert_eq!(runner.run(), 1);
        assert_eq!(&*order.lock(), &[1]);
        assert_eq!(runner.run(), 1);
        assert_eq!(&*order.lock(), &[1, 2]);
    }

    #[test]
    fn test_block_on_dropped() {
        let runner = LocalContextRunner::new();
        let promise = Deferred::<usize>::new().promise();
        assert_eq!(runner.block_on(promise).err(), Some(PromiseError::InvalidState("promise dropped before settled")));
    }
}
