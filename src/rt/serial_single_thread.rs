//! 单线程调度上下文
//!
//! 任意线程都可以向单线程调度上下文投递延续，由启动了执行器的线程负责执行。
//!

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use flume::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{error::PromiseError,
            rt::{ContextTask, ScheduleContext, alloc_rt_uid, bind_current_context}};

// 单线程调度上下文的共享部分
struct SingleInner {
    id:             usize,                  //调度上下文唯一id
    producer:       Sender<ContextTask>,    //延续生产者
    produce_count:  AtomicUsize,            //延续生产计数
    consume_count:  AtomicUsize,            //延续消费计数
}

///
/// 单线程调度上下文
///
#[derive(Clone)]
pub struct SingleContext(Arc<SingleInner>);

impl fmt::Debug for SingleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleContext")
            .field("id", &self.0.id)
            .field("len", &self.len())
            .finish()
    }
}

impl ScheduleContext for SingleContext {
    fn get_id(&self) -> usize {
        self.0.id
    }

    fn post(&self, task: ContextTask) {
        self.0.produce_count.fetch_add(1, Ordering::Relaxed);
        if let Err(_) = self.0.producer.send(task) {
            //执行器已释放，延续不会被执行
            self.0.produce_count.fetch_sub(1, Ordering::Relaxed);
            log::warn!("Post to single context failed, id: {}, reason: runner dropped", self.0.id);
        }
    }
}

impl SingleContext {
    /// 获取待执行的延续数量
    pub fn len(&self) -> usize {
        self.0
            .produce_count
            .load(Ordering::Relaxed)
            .saturating_sub(self.0.consume_count.load(Ordering::Relaxed))
    }

    /// 判断是否没有待执行的延续
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

///
/// 单线程调度上下文的执行器
///
pub struct SingleContextRunner {
    is_running: AtomicBool,             //是否开始运行
    context:    SingleContext,          //单线程调度上下文
    consumer:   Receiver<ContextTask>,  //延续消费者
}

impl Default for SingleContextRunner {
    fn default() -> Self {
        SingleContextRunner::new()
    }
}

impl SingleContextRunner {
    /// 构建单线程调度上下文的执行器
    pub fn new() -> Self {
        let (producer, consumer) = unbounded();
        let inner = SingleInner {
            id: alloc_rt_uid(),
            producer,
            produce_count: AtomicUsize::new(0),
            consume_count: AtomicUsize::new(0),
        };

        SingleContextRunner {
            is_running: AtomicBool::new(false),
            context: SingleContext(Arc::new(inner)),
            consumer,
        }
    }

    /// 启动执行器，返回单线程调度上下文，已启动则返回None
    pub fn startup(&self) -> Option<SingleContext> {
        match self
            .is_running
            .compare_exchange(false,
                              true,
                              Ordering::SeqCst,
                              Ordering::SeqCst) {
            Ok(false) => {
                //未启动，则启动，并返回单线程调度上下文
                log::debug!("Single context runner started, id: {}", self.context.get_id());
                Some(self.context.clone())
            },
            _ => {
                //已启动，则忽略
                None
            },
        }
    }

    /// 获取单线程调度上下文
    pub fn get_context(&self) -> SingleContext {
        self.context.clone()
    }

    /// 判断执行器是否正在运行
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// 执行一个待执行的延续，返回剩余的延续数量
    pub fn run_once(&self) -> Result<usize, PromiseError> {
        self.check_running()?;

        if let Ok(task) = self.consumer.try_recv() {
            let _guard = bind_current_context(Arc::new(self.context.clone()));
            self.run_task(task);
        }

        Ok(self.context.len())
    }

    /// 执行当前所有待执行的延续，执行过程中投递的延续会在下次执行，返回执行的延续数量
    pub fn run(&self) -> Result<usize, PromiseError> {
        self.check_running()?;

        let tasks: Vec<ContextTask> = self.consumer.try_iter().collect();
        let len = tasks.len();
        if len > 0 {
            let _guard = bind_current_context(Arc::new(self.context.clone()));
            for task in tasks {
                self.run_task(task);
            }
        }

        Ok(len)
    }

    /// 最多等待指定时间直到有待执行的延续，然后执行当前所有待执行的延续，返回执行的延续数量
    pub fn run_timeout(&self, timeout: Duration) -> Result<usize, PromiseError> {
        self.check_running()?;

        let first = match self.consumer.recv_timeout(timeout) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PromiseError::Disposed("single context disconnected"));
            },
        };

        let _guard = bind_current_context(Arc::new(self.context.clone()));
        self.run_task(first);
        let mut count = 1;
        for task in self.consumer.try_iter() {
            self.run_task(task);
            count += 1;
        }

        Ok(count)
    }

    /// 关闭执行器，返回请求关闭是否成功，关闭后未执行的延续会在执行器释放时被丢弃
    pub fn close(&self) -> bool {
        if let Ok(true) = self.is_running.compare_exchange(true,
                                                           false,
                                                           Ordering::SeqCst,
                                                           Ordering::SeqCst) {
            //设置运行状态成功
            let len = self.context.len();
            if len > 0 {
                log::warn!("Single context runner closed with pending tasks, id: {}, len: {}", self.context.get_id(), len);
            }
            true
        } else {
            false
        }
    }

    // 检查执行器是否正在运行
    fn check_running(&self) -> Result<(), PromiseError> {
        if self.is_running() {
            Ok(())
        } else {
            //未启动，则返回错误原因
            Err(PromiseError::InvalidState("single context runner not running"))
        }
    }

    // 执行延续
    #[inline]
    fn run_task(&self, task: ContextTask) {
        self.context.0.consume_count.fetch_add(1, Ordering::Relaxed);
        task();
    }
}
