//! # Promise：单值、一次写入的异步结果
//!
//! ## 意图（Why）
//! - 适配器的 `start`/`shutdown`、通道的 `write`/`close`、多播 `join`/`leave` 都以
//!   单值结果收尾，调用方既可能在同步代码里有界等待，也可能在异步代码里 `.await`；
//! - 同一个结果常被多个观察者关注（写入完成 + 通道错误通知），因此结果必须可克隆。
//!
//! ## 契约（What）
//! - 状态只会从 Pending 迁移到 Completed 或 Failed，且只迁移一次；
//!   [`Promise::complete`]/[`Promise::fail`] 返回本次调用是否真正完成了解析；
//! - 监听器运行在 Promise 绑定的调度器上；注册时若已解析则立即调度；
//! - [`Promise::await_timeout`] 是核心中唯一会阻塞调用线程的操作，且必须带超时。
//!
//! ## 实现（How）
//! - `parking_lot::Mutex` 保护结果槽、监听器与 `Waker` 列表，`Condvar` 唤醒阻塞等待者；
//! - 解析时在锁外把全部监听器打包成一个任务，以 Promise 标识为键调度，保持注册顺序。
//!
//! ## 注意事项（Trade-offs）
//! - 不要在负责解析该 Promise 的调度器线程上调用 `await_timeout`，否则只能等到超时。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    dispatcher::{SharedDispatcher, SyncDispatcher, dispatch_or_run},
    error::TransportError,
    next_id,
};

type Listener<T> = Box<dyn FnOnce(Result<T, TransportError>) + Send + 'static>;

struct State<T> {
    slot: Option<Result<T, TransportError>>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

struct Inner<T> {
    id: u64,
    dispatcher: SharedDispatcher,
    state: Mutex<State<T>>,
    resolved: Condvar,
}

/// 单槽异步结果。
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// 创建待解析的 Promise，监听器将运行在 `dispatcher` 上。
    pub fn pending(dispatcher: SharedDispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_id(),
                dispatcher,
                state: Mutex::new(State {
                    slot: None,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// 已成功解析的 Promise，监听器内联执行。
    pub fn success(value: T) -> Self {
        let promise = Self::pending(SyncDispatcher::shared());
        promise.complete(value);
        promise
    }

    /// 已失败的 Promise，监听器内联执行。
    pub fn failure(error: TransportError) -> Self {
        let promise = Self::pending(SyncDispatcher::shared());
        promise.fail(error);
        promise
    }

    /// 由同步结果构造已解析的 Promise。
    pub fn from_result(outcome: Result<T, TransportError>) -> Self {
        let promise = Self::pending(SyncDispatcher::shared());
        promise.resolve(outcome);
        promise
    }

    /// 以成功值解析；若已解析过则返回 `false` 且不产生任何效果。
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// 以错误解析；若已解析过则返回 `false`。
    pub fn fail(&self, error: TransportError) -> bool {
        self.resolve(Err(error))
    }

    /// 以任意结果解析。
    pub fn resolve(&self, outcome: Result<T, TransportError>) -> bool {
        let (listeners, wakers) = {
            let mut state = self.inner.state.lock();
            if state.slot.is_some() {
                return false;
            }
            state.slot = Some(outcome.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
            )
        };
        self.inner.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        self.notify(listeners, outcome);
        true
    }

    /// 注册完成监听器。
    pub fn on_complete<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(Result<T, TransportError>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &state.slot {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return self;
                }
            }
        };
        self.notify(vec![Box::new(listener)], outcome);
        self
    }

    /// 仅在成功时回调。
    pub fn on_success<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Ok(value) = outcome {
                listener(value);
            }
        })
    }

    /// 仅在失败时回调。
    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(TransportError) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Err(error) = outcome {
                listener(error);
            }
        })
    }

    /// 阻塞等待解析，最长 `timeout`。
    pub fn await_timeout(&self, timeout: Duration) -> Result<T, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.slot {
                return outcome.clone();
            }
            if self
                .inner
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &state.slot {
                    Some(outcome) => outcome.clone(),
                    None => Err(TransportError::Timeout(timeout)),
                };
            }
        }
    }

    /// 是否仍未解析。
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().slot.is_none()
    }

    /// 非阻塞读取当前结果。
    pub fn peek(&self) -> Option<Result<T, TransportError>> {
        self.inner.state.lock().slot.clone()
    }

    /// 派生一个在本 Promise 成功时映射取值的新 Promise，错误原样传递。
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let derived = Promise::pending(Arc::clone(&self.inner.dispatcher));
        let target = derived.clone();
        self.on_complete(move |outcome| {
            target.resolve(outcome.map(f));
        });
        derived
    }

    /// 绑定的调度器。
    pub fn dispatcher(&self) -> &SharedDispatcher {
        &self.inner.dispatcher
    }

    fn notify(&self, listeners: Vec<Listener<T>>, outcome: Result<T, TransportError>) {
        if listeners.is_empty() {
            return;
        }
        dispatch_or_run(
            self.inner.dispatcher.as_ref(),
            self.inner.id,
            Box::new(move || {
                for listener in listeners {
                    listener(outcome.clone());
                }
            }),
        );
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.slot {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// 随命令跨越任务边界的完成句柄。
///
/// 持有者在未解析的情况下被丢弃（任务被中止、队列被释放）时，以“关闭期间中止”失败，
/// 保证在途 Promise 不会永远挂起。
pub struct CompletionGuard<T: Clone + Send + 'static> {
    promise: Option<Promise<T>>,
    operation: &'static str,
}

impl<T: Clone + Send + 'static> CompletionGuard<T> {
    pub fn new(promise: Promise<T>, operation: &'static str) -> Self {
        Self {
            promise: Some(promise),
            operation,
        }
    }

    pub fn resolve(mut self, outcome: Result<T, TransportError>) -> bool {
        match self.promise.take() {
            Some(promise) => promise.resolve(outcome),
            None => false,
        }
    }

    pub fn complete(self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(self, error: TransportError) -> bool {
        self.resolve(Err(error))
    }
}

impl<T: Clone + Send + 'static> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.take() {
            promise.fail(TransportError::closed(self.operation));
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for CompletionGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionGuard")
            .field("operation", &self.operation)
            .field("armed", &self.promise.is_some())
            .finish()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let status = match &state.slot {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("status", &status)
            .finish()
    }
}
