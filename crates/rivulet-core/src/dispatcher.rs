//! # 调度器：描述“任务在哪里运行”
//!
//! ## 意图（Why）
//! - 每个通道与服务端绑定两个调度角色：驱动解码重组的 **I/O 调度器**，以及向应用消费者
//!   投递事件的 **事件调度器**；
//! - 同步调度器让解码留在原生 I/O 线程上以获得最低延迟；线程池调度器把慢消费者与 I/O 线程
//!   解耦，其有界队列就是简单的背压边界。
//!
//! ## 契约（What）
//! - 相同 `key` 的任务按提交顺序执行；不同 `key` 之间不承诺顺序；
//! - 关闭后的提交返回 [`DispatchError::Shutdown`]，任务不会被执行。
//!
//! ## 实现（How）
//! - [`SyncDispatcher`] 直接在调用线程上执行；
//! - [`WorkerPoolDispatcher`] 为每个工作线程维护一个有界 `sync_channel`，`key % workers`
//!   把同一个键固定到同一个线程，从而得到逐键 FIFO。

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error};

/// 调度单元。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 以 trait 对象共享的调度器句柄。
pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// 调度器拒绝任务的原因。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher `{name}` has been shut down")]
    Shutdown { name: String },
    #[error("dispatcher `{name}` queue is full and the submitter is its own worker")]
    Saturated { name: String },
    #[error("dispatcher `{name}` failed to spawn worker: {reason}")]
    Spawn { name: String, reason: String },
}

/// 任务执行位置的抽象。
pub trait Dispatcher: Send + Sync + 'static {
    /// 提交任务；同一 `key` 的任务按提交顺序执行。
    fn dispatch(&self, key: u64, task: Task) -> Result<(), DispatchError>;

    /// 当前线程是否已经位于该调度器的执行上下文中。
    fn is_in_context(&self) -> bool;

    /// 调度器名称，用于日志与错误信息。
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").field("name", &self.name()).finish()
    }
}

/// 在调用线程上立即执行任务，不排队。
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncDispatcher;

impl SyncDispatcher {
    /// 便捷构造共享句柄。
    pub fn shared() -> SharedDispatcher {
        Arc::new(SyncDispatcher)
    }
}

impl Dispatcher for SyncDispatcher {
    fn dispatch(&self, _key: u64, task: Task) -> Result<(), DispatchError> {
        run_guarded("sync", task);
        Ok(())
    }

    fn is_in_context(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "sync"
    }
}

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// 固定数量工作线程 + 每线程有界队列的异步调度器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 让慢消费者只拖慢自己所在的工作线程，而不是原生 I/O 线程；
/// - 有界队列写满时阻塞提交者，提交者通常就是 I/O 驱动，从而把压力回传给套接字读取。
///
/// ## 逻辑（How）
/// - `dispatch` 在读锁内克隆目标线程的发送端后立即释放锁，再执行可能阻塞的 `send`；
/// - 工作线程循环 `recv`，遇到 `Terminate` 或发送端全部释放时退出；
/// - 任务 panic 被 `catch_unwind` 捕获并记录，工作线程继续服务后续任务。
///
/// ## 注意事项（Trade-offs）
/// - 工作线程向自己所在的满队列提交会造成自锁，因此这种情况改为返回
///   [`DispatchError::Saturated`]；
/// - `shutdown` 会先执行已排队的任务再退出，队列深度决定关闭耗时。
pub struct WorkerPoolDispatcher {
    name: String,
    senders: RwLock<Vec<SyncSender<WorkerMessage>>>,
    threads: Vec<ThreadId>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkerPoolDispatcher {
    /// 创建 `workers` 个工作线程，每个线程的队列容量为 `queue_capacity`。
    ///
    /// `workers` 与 `queue_capacity` 为 0 时按 1 处理。
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        let workers = workers.max(1);
        let capacity = queue_capacity.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, receiver) = mpsc::sync_channel::<WorkerMessage>(capacity);
            let worker_name = name.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&worker_name, receiver))
                .map_err(|err| DispatchError::Spawn {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
            threads.push(handle.thread().id());
            handles.push(handle);
            senders.push(sender);
        }

        Ok(Self {
            name,
            senders: RwLock::new(senders),
            threads,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    /// 工作线程数量。
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// 是否已关闭。
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 停止接收新任务，执行完已排队任务后回收全部工作线程。
    ///
    /// 在工作线程内部调用时跳过对自身的 `join`。可重复调用。
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = thread::current().id();
        let senders = std::mem::take(&mut *self.senders.write());
        for (sender, owner) in senders.iter().zip(&self.threads) {
            // 自身队列可能已满，阻塞发送会自锁；发送端释放后循环同样会退出。
            if *owner == current {
                let _ = sender.try_send(WorkerMessage::Terminate);
            } else {
                let _ = sender.send(WorkerMessage::Terminate);
            }
        }
        drop(senders);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(dispatcher = %self.name, "worker thread terminated abnormally");
            }
        }
        debug!(dispatcher = %self.name, "worker pool shut down");
    }

    fn shutdown_error(&self) -> DispatchError {
        DispatchError::Shutdown {
            name: self.name.clone(),
        }
    }
}

impl Dispatcher for WorkerPoolDispatcher {
    fn dispatch(&self, key: u64, task: Task) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.shutdown_error());
        }
        let index = (key % self.threads.len() as u64) as usize;
        let sender = match self.senders.read().get(index) {
            Some(sender) => sender.clone(),
            None => return Err(self.shutdown_error()),
        };

        if self.threads[index] == thread::current().id() {
            return match sender.try_send(WorkerMessage::Task(task)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DispatchError::Saturated {
                    name: self.name.clone(),
                }),
                Err(TrySendError::Disconnected(_)) => Err(self.shutdown_error()),
            };
        }

        sender
            .send(WorkerMessage::Task(task))
            .map_err(|_| self.shutdown_error())
    }

    fn is_in_context(&self) -> bool {
        let current = thread::current().id();
        self.threads.contains(&current)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkerPoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPoolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolDispatcher")
            .field("name", &self.name)
            .field("workers", &self.threads.len())
            .field("closed", &self.is_shutdown())
            .finish()
    }
}

/// 提交任务；调度器拒绝时退化为在当前线程执行，保证回调不会丢失。
///
/// 用于 Promise 监听器、序列终止信号这类“必须送达”的通知。
pub(crate) fn dispatch_or_run(dispatcher: &dyn Dispatcher, key: u64, task: Task) {
    let slot = Arc::new(Mutex::new(Some(task)));
    let queued = Arc::clone(&slot);
    let job: Task = Box::new(move || {
        if let Some(task) = queued.lock().take() {
            task();
        }
    });
    if let Err(err) = dispatcher.dispatch(key, job) {
        if let Some(task) = slot.lock().take() {
            tracing::warn!(error = %err, "dispatcher rejected notification, running inline");
            run_guarded(dispatcher.name(), task);
        }
    }
}

fn worker_loop(name: &str, receiver: Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Task(task) => run_guarded(name, task),
            WorkerMessage::Terminate => break,
        }
    }
}

fn run_guarded(name: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(dispatcher = %name, "dispatched task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn sync_dispatcher_runs_inline() {
        let caller = thread::current().id();
        let (tx, rx) = channel();
        SyncDispatcher
            .dispatch(
                7,
                Box::new(move || {
                    tx.send(thread::current().id()).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller, "同步调度器必须在调用线程执行");
    }

    #[test]
    fn same_key_keeps_submission_order() {
        let pool = WorkerPoolDispatcher::new("order", 4, 8).unwrap();
        let (tx, rx) = channel();
        for i in 0..200u32 {
            let tx = tx.clone();
            pool.dispatch(42, Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }
        let seen: Vec<u32> = (0..200)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..200).collect::<Vec<_>>(), "同一键的任务必须保持 FIFO");
    }

    #[test]
    fn tasks_run_on_pool_threads() {
        let pool = Arc::new(WorkerPoolDispatcher::new("ctx", 2, 4).unwrap());
        assert!(!pool.is_in_context());
        let (tx, rx) = channel();
        let inner = Arc::clone(&pool);
        pool.dispatch(1, Box::new(move || tx.send(inner.is_in_context()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPoolDispatcher::new("panic", 1, 4).unwrap();
        pool.dispatch(0, Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = channel();
        pool.dispatch(0, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok(), "后续任务仍需执行");
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let pool = WorkerPoolDispatcher::new("drain", 2, 16).unwrap();
        let (tx, rx) = channel();
        for i in 0..10u64 {
            let tx = tx.clone();
            pool.dispatch(i, Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }
        pool.shutdown();
        assert_eq!(rx.try_iter().count(), 10, "关闭前排队的任务必须执行完毕");
        let err = pool.dispatch(0, Box::new(|| {})).unwrap_err();
        assert_eq!(
            err,
            DispatchError::Shutdown {
                name: "drain".into()
            }
        );
    }
}
