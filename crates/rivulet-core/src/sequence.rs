//! # 响应式序列
//!
//! ## 意图（Why）
//! - 通道入站消息、数据报 `in()`、多路复用套接字的标记单元都是“推送式、可能无限、
//!   不可重启”的多值序列，需要一个统一的广播载体；
//! - 消费者可以是回调（[`Broadcaster::consume`]），也可以是异步流
//!   （[`Broadcaster::subscribe_stream`]）。
//!
//! ## 契约（What）
//! - 热序列：订阅之前发出的值不会补发；
//! - 单个序列内按发出顺序投递；投递运行在序列绑定的调度器上，以序列标识为键；
//! - `error`/`complete` 为终止信号，此后的任何信号被丢弃；终止后才订阅的消费者立即收到终止信号。

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    dispatcher::{SharedDispatcher, SyncDispatcher, dispatch_or_run},
    error::TransportError,
    next_id,
};

type NextFn<T> = Box<dyn FnMut(T) -> bool + Send + 'static>;
type ErrorFn = Box<dyn FnOnce(TransportError) + Send + 'static>;
type CompleteFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
enum Terminal {
    Complete,
    Error(TransportError),
}

struct Callbacks<T> {
    next: NextFn<T>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

/// 订阅者的可变部分。
///
/// 回调执行期间 `next` 被取出，锁不跨越用户代码：回调里重入的值进入 `backlog`，
/// 重入的终止信号记在 `deferred`，都在回调返回之后按顺序补投。
struct Slot<T> {
    next: Option<NextFn<T>>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
    delivering: bool,
    backlog: VecDeque<T>,
    deferred: Option<Terminal>,
}

struct Subscriber<T> {
    slot: Mutex<Slot<T>>,
    active: AtomicBool,
}

impl<T> Subscriber<T> {
    fn new(callbacks: Callbacks<T>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                next: Some(callbacks.next),
                error: callbacks.error,
                complete: callbacks.complete,
                delivering: false,
                backlog: VecDeque::new(),
                deferred: None,
            }),
            active: AtomicBool::new(true),
        }
    }

    fn on_next(&self, mut value: T) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut next = {
            let mut slot = self.slot.lock();
            if slot.delivering {
                slot.backlog.push_back(value);
                return;
            }
            let Some(next) = slot.next.take() else {
                return;
            };
            slot.delivering = true;
            next
        };

        loop {
            if !next(value) {
                self.active.store(false, Ordering::Release);
                let mut slot = self.slot.lock();
                slot.delivering = false;
                slot.backlog.clear();
                slot.deferred = None;
                return;
            }
            let mut slot = self.slot.lock();
            let queued = slot.backlog.pop_front();
            match queued {
                Some(queued) => value = queued,
                None => {
                    slot.next = Some(next);
                    slot.delivering = false;
                    let deferred = slot.deferred.take();
                    drop(slot);
                    if let Some(terminal) = deferred {
                        self.finish(&terminal);
                    }
                    return;
                }
            }
        }
    }

    fn on_terminal(&self, terminal: &Terminal) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut slot = self.slot.lock();
            if slot.delivering {
                slot.deferred = Some(terminal.clone());
                return;
            }
        }
        self.finish(terminal);
    }

    fn finish(&self, terminal: &Terminal) {
        let (on_error, on_complete) = {
            let mut slot = self.slot.lock();
            slot.next = None;
            (slot.error.take(), slot.complete.take())
        };
        match terminal {
            Terminal::Complete => {
                if let Some(complete) = on_complete {
                    complete();
                }
            }
            Terminal::Error(error) => {
                if let Some(on_error) = on_error {
                    on_error(error.clone());
                }
            }
        }
    }
}

struct State<T> {
    subscribers: Vec<Arc<Subscriber<T>>>,
    terminal: Option<Terminal>,
}

struct Shared<T> {
    id: u64,
    dispatcher: SharedDispatcher,
    state: Mutex<State<T>>,
}

/// 热广播序列。
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    /// 创建绑定到 `dispatcher` 的序列。
    pub fn new(dispatcher: SharedDispatcher) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: next_id(),
                dispatcher,
                state: Mutex::new(State {
                    subscribers: Vec::new(),
                    terminal: None,
                }),
            }),
        }
    }

    /// 在调用线程上同步投递的序列。
    pub fn inline() -> Self {
        Self::new(SyncDispatcher::shared())
    }

    /// 序列标识。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 注册值消费者。
    pub fn consume<F>(&self, mut next: F) -> &Self
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe(Callbacks {
            next: Box::new(move |value| {
                next(value);
                true
            }),
            error: None,
            complete: None,
        });
        self
    }

    /// 注册值、错误与完成三个消费者。
    pub fn consume_with<N, E, C>(&self, mut next: N, error: E, complete: C) -> &Self
    where
        N: FnMut(T) + Send + 'static,
        E: FnOnce(TransportError) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.subscribe(Callbacks {
            next: Box::new(move |value| {
                next(value);
                true
            }),
            error: Some(Box::new(error)),
            complete: Some(Box::new(complete)),
        });
        self
    }

    /// 以异步流的形式订阅；错误终止表现为一个 `Err` 项后流结束。
    pub fn subscribe_stream(&self) -> SequenceStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_error = tx.clone();
        let on_complete = Arc::new(Mutex::new(Some(tx.clone())));
        let closer = Arc::clone(&on_complete);
        self.subscribe(Callbacks {
            next: Box::new(move |value| tx.send(Ok(value)).is_ok()),
            error: Some(Box::new(move |error| {
                let _ = on_error.send(Err(error));
                closer.lock().take();
            })),
            complete: Some(Box::new(move || {
                on_complete.lock().take();
            })),
        });
        SequenceStream { receiver: rx }
    }

    /// 发出一个值；序列已终止时返回 `false` 并丢弃该值。
    pub fn emit(&self, value: T) -> bool {
        let subscribers = {
            let mut state = self.shared.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state
                .subscribers
                .retain(|subscriber| subscriber.active.load(Ordering::Acquire));
            if state.subscribers.is_empty() {
                return true;
            }
            state.subscribers.clone()
        };
        let outcome = self.shared.dispatcher.dispatch(
            self.shared.id,
            Box::new(move || {
                for subscriber in &subscribers {
                    subscriber.on_next(value.clone());
                }
            }),
        );
        if let Err(error) = outcome {
            tracing::debug!(sequence = self.shared.id, %error, "sequence value dropped");
            return false;
        }
        true
    }

    /// 以错误终止序列。
    pub fn error(&self, error: TransportError) -> bool {
        self.terminate(Terminal::Error(error))
    }

    /// 正常完成序列。
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Complete)
    }

    /// 是否已终止。
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminal.is_some()
    }

    /// 当前活跃订阅者数量。
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.active.load(Ordering::Acquire))
            .count()
    }

    fn subscribe(&self, callbacks: Callbacks<T>) {
        let subscriber = Arc::new(Subscriber::new(callbacks));
        let terminal = {
            let mut state = self.shared.state.lock();
            match &state.terminal {
                Some(terminal) => terminal.clone(),
                None => {
                    state.subscribers.push(subscriber);
                    return;
                }
            }
        };
        dispatch_or_run(
            self.shared.dispatcher.as_ref(),
            self.shared.id,
            Box::new(move || subscriber.on_terminal(&terminal)),
        );
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let subscribers = {
            let mut state = self.shared.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.subscribers)
        };
        dispatch_or_run(
            self.shared.dispatcher.as_ref(),
            self.shared.id,
            Box::new(move || {
                for subscriber in &subscribers {
                    subscriber.on_terminal(&terminal);
                }
            }),
        );
        true
    }
}

impl<T> fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Broadcaster")
            .field("id", &self.shared.id)
            .field("subscribers", &state.subscribers.len())
            .field("terminated", &state.terminal.is_some())
            .finish()
    }
}

/// [`Broadcaster::subscribe_stream`] 返回的异步流。
#[derive(Debug)]
pub struct SequenceStream<T> {
    receiver: mpsc::UnboundedReceiver<Result<T, TransportError>>,
}

impl<T> Stream for SequenceStream<T> {
    type Item = Result<T, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn values_arrive_in_emission_order() {
        let seq = Broadcaster::inline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        seq.consume(move |v: u32| sink.lock().push(v));
        for v in 0..5 {
            assert!(seq.emit(v));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn signals_after_terminal_are_dropped() {
        let seq = Broadcaster::<u8>::inline();
        let completions = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&completions);
        seq.consume_with(
            |_| panic!("终止后不应再收到值"),
            |_| panic!("已完成的序列不应再收到错误"),
            move || *counter.lock() += 1,
        );
        assert!(seq.complete());
        assert!(!seq.emit(1));
        assert!(!seq.error(TransportError::closed("read")));
        assert!(!seq.complete());
        assert_eq!(*completions.lock(), 1);
    }

    #[test]
    fn late_subscriber_receives_terminal() {
        let seq = Broadcaster::<u8>::inline();
        seq.error(TransportError::closed("read"));
        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        seq.consume_with(|_| {}, move |e| *sink.lock() = Some(e.code()), || {});
        assert_eq!(*got.lock(), Some("rivulet.channel.closed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_adapter_ends_after_error() {
        let seq = Broadcaster::<u16>::inline();
        let mut stream = seq.subscribe_stream();
        seq.emit(7);
        seq.error(TransportError::closed("read"));
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none(), "错误之后流必须结束");
    }

    #[test]
    fn consumer_may_terminate_its_own_sequence() {
        let seq = Broadcaster::<u8>::inline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicBool::new(false));
        let (sink, done, closer) = (Arc::clone(&seen), Arc::clone(&completed), seq.clone());
        seq.consume_with(
            move |v| {
                sink.lock().push(v);
                closer.complete();
            },
            |_| panic!("不应收到错误"),
            move || done.store(true, Ordering::SeqCst),
        );
        assert!(seq.emit(1));
        assert!(completed.load(Ordering::SeqCst), "回调内发出的完成信号应在回调返回后投递");
        assert!(!seq.emit(2));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn reentrant_values_keep_emission_order() {
        let seq = Broadcaster::<u8>::inline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, echo) = (Arc::clone(&seen), seq.clone());
        seq.consume(move |v| {
            sink.lock().push(v);
            if v < 3 {
                echo.emit(v + 10);
            }
        });
        seq.emit(1);
        seq.emit(2);
        assert_eq!(*seen.lock(), vec![1, 11, 2, 12]);
    }

    #[test]
    fn dropped_stream_unsubscribes() {
        let seq = Broadcaster::<u16>::inline();
        drop(seq.subscribe_stream());
        seq.emit(1);
        seq.emit(2);
        assert_eq!(seq.subscriber_count(), 0);
    }
}
