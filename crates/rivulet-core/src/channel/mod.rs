//! # NetChannel：跨传输统一的连接对象
//!
//! ## 意图（Why）
//! - 三种传输（流式、数据报、多路复用）共享同一套读、写、关闭语义与监听器模型；
//!   传输差异只体现在 [`NativeConnection`] 的实现里；
//! - 读路径与投递路径分别运行在 I/O 调度器与事件调度器上，二者可独立选择同步或线程池实现。
//!
//! ## 逻辑（How）
//! - 传输驱动调用 [`NetChannel::receive`] 交付原始块，块在 I/O 调度器上经过重组器，
//!   解出的消息经 [`NetChannel::read`] 推入入站序列，再由事件调度器投递给消费者；
//! - 写路径先编码，再交给原生连接；原生完成后解析调用方的完成 Promise，失败同时进入
//!   通道的错误通知路径；
//! - 关闭由三态标志的 CAS 把关：`Open → Closing` 成功者执行原生关闭，其余调用者拿到同一次
//!   尝试的 Promise；原生关闭成功后标志停在 `Closed`，关闭监听器恰好触发一次。
//!
//! ## 契约（What）
//! - 单个通道的读投递严格 FIFO；
//! - 关闭后的写入以 [`TransportError::Closed`] 失败，不会触达原生层；
//! - 读失败不会以 panic 或返回值的形式抛出，而是作为通道的终止错误通知，并关闭原生连接；
//!   对端复位、断管这类常见断连只以 `debug` 级别记录。
//!
//! ## 注意事项（Trade-offs）
//! - 重组器由互斥锁包裹，但同一通道的读任务以通道标识为键串行调度，锁上不会出现竞争；
//! - 空闲检测依赖 Tokio 定时器，因此通道必须在 Tokio 运行时内创建。

mod idle;
mod native;
mod sink;

pub use native::NativeConnection;
pub use sink::ChannelSink;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, info, warn};

use crate::{
    codec::{Codec, InboundChunk},
    config::ChannelInitializer,
    dispatcher::{SharedDispatcher, SyncDispatcher, dispatch_or_run},
    env::Environment,
    error::TransportError,
    next_id,
    promise::Promise,
    reassembler::{Reassembler, ReassemblyLimits, ReassemblyStats},
    sequence::Broadcaster,
};

use idle::{ActivityClock, watch_idle};

/// 通道标识。
pub type ChannelId = u64;

/// “新通道”回调。
pub type ChannelCallback<C> = Arc<dyn Fn(NetChannel<C>) + Send + Sync + 'static>;

type CloseListener = Box<dyn FnOnce() + Send + 'static>;
type ErrorListener = Arc<dyn Fn(TransportError) + Send + Sync + 'static>;

/// 关闭标志的三种取值。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Default)]
struct Listeners {
    close: Vec<CloseListener>,
    error: Vec<ErrorListener>,
}

struct Inner<C: Codec> {
    id: ChannelId,
    native: Arc<dyn NativeConnection>,
    codec: Arc<C>,
    reassembler: Mutex<Reassembler<C>>,
    io: SharedDispatcher,
    events: SharedDispatcher,
    state: AtomicU8,
    failed: AtomicBool,
    close_attempt: Mutex<Option<Promise<()>>>,
    terminated: Promise<()>,
    inbound: Broadcaster<C::In>,
    listeners: Mutex<Listeners>,
    read_clock: Arc<ActivityClock>,
    write_clock: Arc<ActivityClock>,
    closed_tx: watch::Sender<bool>,
    runtime: Handle,
}

/// 统一的每连接对象。
pub struct NetChannel<C: Codec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for NetChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> NetChannel<C> {
    /// 以给定原生连接构造通道；通常经由 [`ChannelSettings::open_channel`] 调用。
    pub fn new(native: Arc<dyn NativeConnection>, settings: &ChannelSettings<C>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: next_id(),
                native,
                codec: Arc::clone(&settings.codec),
                reassembler: Mutex::new(Reassembler::new(
                    Arc::clone(&settings.codec),
                    settings.limits,
                )),
                io: Arc::clone(&settings.io),
                events: Arc::clone(&settings.events),
                state: AtomicU8::new(ChannelState::Open as u8),
                failed: AtomicBool::new(false),
                close_attempt: Mutex::new(None),
                terminated: Promise::pending(Arc::clone(&settings.events)),
                inbound: Broadcaster::new(Arc::clone(&settings.events)),
                listeners: Mutex::new(Listeners::default()),
                read_clock: Arc::new(ActivityClock::new()),
                write_clock: Arc::new(ActivityClock::new()),
                closed_tx,
                runtime: settings.runtime.clone(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// 关闭流程是否已经开始（含已关闭）。
    pub fn is_closing(&self) -> bool {
        self.state() != ChannelState::Open
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.native.remote_address()
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.inner.codec
    }

    pub fn io_dispatcher(&self) -> &SharedDispatcher {
        &self.inner.io
    }

    pub fn events_dispatcher(&self) -> &SharedDispatcher {
        &self.inner.events
    }

    /// 重组统计。
    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.inner.reassembler.lock().stats()
    }

    /// 入站消息序列。
    pub fn in_(&self) -> &Broadcaster<C::In> {
        &self.inner.inbound
    }

    /// 出站 sink：每个被接受的值都会写入本通道。
    pub fn out(&self) -> ChannelSink<C> {
        ChannelSink::new(self.clone())
    }

    /// 通道关闭完成时解析。
    pub fn terminated(&self) -> Promise<()> {
        self.inner.terminated.clone()
    }

    /// 传输驱动交付一个原生入站块。
    ///
    /// 重组在 I/O 调度器上以通道标识为键执行，因此同一通道的块按到达顺序处理。
    pub fn receive(&self, chunk: InboundChunk<C::In>) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.inner.read_clock.touch();
        let channel = self.clone();
        let outcome = self.inner.io.dispatch(
            self.inner.id,
            Box::new(move || {
                let mut messages = Vec::new();
                let outcome = channel.inner.reassembler.lock().feed_into(chunk, &mut messages);
                for message in messages {
                    channel.read(message);
                }
                if let Err(error) = outcome {
                    channel.fail(error);
                }
            }),
        );
        if let Err(error) = outcome {
            self.fail(error.into());
        }
    }

    /// 把一条已解码消息投递给入站消费者（运行在事件调度器上）。
    pub fn read(&self, message: C::In) {
        self.inner.inbound.emit(message);
    }

    /// 写入一条消息；`completion` 在原生写完成时解析。
    pub fn write(&self, message: C::Out, completion: Promise<()>, flush: bool) {
        if self.is_closing() {
            completion.fail(TransportError::closed("write"));
            return;
        }
        let frame = match self.inner.codec.encode(message) {
            Ok(frame) => frame,
            Err(error) => {
                completion.fail(error.into());
                return;
            }
        };
        let native_done = Promise::pending(SyncDispatcher::shared());
        let channel = self.clone();
        native_done.on_complete(move |outcome| match outcome {
            Ok(()) => {
                channel.inner.write_clock.touch();
                completion.complete(());
            }
            Err(error) => {
                completion.fail(error.clone());
                channel.fail(error);
            }
        });
        self.inner.native.write(frame, flush, native_done);
    }

    /// 写入但不要求立即刷出。
    pub fn send(&self, message: C::Out) -> Promise<()> {
        let completion = Promise::pending(Arc::clone(&self.inner.events));
        self.write(message, completion.clone(), false);
        completion
    }

    /// 写入并立即刷出。
    pub fn send_and_flush(&self, message: C::Out) -> Promise<()> {
        let completion = Promise::pending(Arc::clone(&self.inner.events));
        self.write(message, completion.clone(), true);
        completion
    }

    /// 要求原生层发出已缓冲的写入。
    pub fn flush(&self) -> Promise<()> {
        let completion = Promise::pending(Arc::clone(&self.inner.events));
        if self.is_closing() {
            completion.fail(TransportError::closed("flush"));
        } else {
            self.inner.native.flush(completion.clone());
        }
        completion
    }

    /// 幂等关闭。
    ///
    /// 只有把标志从 `Open` 切换到 `Closing` 的调用者会触发原生关闭；并发调用者得到同一次
    /// 尝试的 Promise；已关闭时返回已成功的 Promise。原生关闭失败会把标志还原为 `Open`。
    pub fn close(&self) -> Promise<()> {
        let attempt = {
            let mut slot = self.inner.close_attempt.lock();
            match self.inner.state.compare_exchange(
                ChannelState::Open as u8,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let attempt = Promise::pending(Arc::clone(&self.inner.events));
                    *slot = Some(attempt.clone());
                    attempt
                }
                Err(raw) if raw == ChannelState::Closing as u8 => {
                    return match slot.as_ref() {
                        Some(attempt) => attempt.clone(),
                        None => self.terminated(),
                    };
                }
                Err(_) => return self.terminated(),
            }
        };

        let native_done = Promise::pending(SyncDispatcher::shared());
        let channel = self.clone();
        let result = attempt.clone();
        native_done.on_complete(move |outcome| match outcome {
            Ok(()) => {
                channel.finish_close();
                result.complete(());
            }
            Err(error) => {
                channel
                    .inner
                    .state
                    .store(ChannelState::Open as u8, Ordering::Release);
                warn!(channel = channel.id(), %error, "native close failed, channel reopened");
                result.fail(error);
            }
        });
        self.inner.native.close(native_done);
        attempt
    }

    /// 注册关闭监听器；通道已关闭时立即在事件调度器上触发。
    pub fn on_close<F>(&self, listener: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.inner.listeners.lock();
            if self.state() != ChannelState::Closed {
                listeners.close.push(Box::new(listener));
                return self;
            }
        }
        dispatch_or_run(self.inner.events.as_ref(), self.inner.id, Box::new(listener));
        self
    }

    /// 注册错误监听器。
    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().error.push(Arc::new(listener));
        self
    }

    /// `timeout` 内没有入站数据时触发一次 `listener`，直到下一次读活动后重新计时。
    pub fn on_read_idle<F>(&self, timeout: Duration, listener: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spawn_idle(Arc::clone(&self.inner.read_clock), timeout, listener);
        self
    }

    /// `timeout` 内没有成功写出时触发一次 `listener`。
    pub fn on_write_idle<F>(&self, timeout: Duration, listener: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spawn_idle(Arc::clone(&self.inner.write_clock), timeout, listener);
        self
    }

    /// 以终止错误结束通道：通知错误监听器、以错误终止入站序列，并关闭原生连接。
    ///
    /// 只有第一次失败会被报告，后续失败仅记录日志。
    pub fn fail(&self, error: TransportError) {
        if self.inner.failed.swap(true, Ordering::AcqRel) {
            debug!(channel = self.id(), %error, "suppressing error after terminal failure");
            return;
        }
        if error.is_transient() {
            debug!(
                channel = self.id(),
                peer = %self.inner.native.describe(),
                %error,
                "connection dropped by peer"
            );
        } else {
            warn!(
                channel = self.id(),
                peer = %self.inner.native.describe(),
                code = error.code(),
                %error,
                "channel failed"
            );
        }

        let listeners = self.inner.listeners.lock().error.clone();
        if !listeners.is_empty() {
            let reported = error.clone();
            dispatch_or_run(
                self.inner.events.as_ref(),
                self.inner.id,
                Box::new(move || {
                    for listener in &listeners {
                        listener(reported.clone());
                    }
                }),
            );
        }
        self.inner.inbound.error(error);
        self.close();
    }

    fn finish_close(&self) {
        self.inner
            .state
            .store(ChannelState::Closed as u8, Ordering::Release);
        self.inner.reassembler.lock().reset();
        let listeners = std::mem::take(&mut self.inner.listeners.lock().close);
        if !listeners.is_empty() {
            dispatch_or_run(
                self.inner.events.as_ref(),
                self.inner.id,
                Box::new(move || {
                    for listener in listeners {
                        listener();
                    }
                }),
            );
        }
        self.inner.inbound.complete();
        self.inner.closed_tx.send_replace(true);
        self.inner.terminated.complete(());
        info!(channel = self.id(), peer = %self.inner.native.describe(), "channel closed");
    }

    fn spawn_idle<F>(&self, clock: Arc<ActivityClock>, timeout: Duration, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let events = Arc::clone(&self.inner.events);
        let key = self.inner.id;
        let listener = Arc::new(listener);
        let fire = move || {
            let listener = Arc::clone(&listener);
            dispatch_or_run(events.as_ref(), key, Box::new(move || listener()));
        };
        let closed = self.inner.closed_tx.subscribe();
        self.inner
            .runtime
            .spawn(watch_idle(clock, timeout, closed, fire));
    }
}

impl<C: Codec> fmt::Debug for NetChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetChannel")
            .field("id", &self.inner.id)
            .field("native", &self.inner.native)
            .field("state", &self.state())
            .finish()
    }
}

/// 构造通道所需的只读输入：编解码器、两个调度器、重组上限、初始化钩子与运行时。
pub struct ChannelSettings<C: Codec> {
    codec: Arc<C>,
    io: SharedDispatcher,
    events: SharedDispatcher,
    limits: ReassemblyLimits,
    initializer: Option<ChannelInitializer<C>>,
    runtime: Handle,
}

impl<C: Codec> Clone for ChannelSettings<C> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            io: Arc::clone(&self.io),
            events: Arc::clone(&self.events),
            limits: self.limits,
            initializer: self.initializer.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<C: Codec> ChannelSettings<C> {
    /// 默认使用同步 I/O 调度器与环境提供的事件调度器。
    pub fn new(codec: C, env: &Environment) -> Self {
        Self {
            codec: Arc::new(codec),
            io: SyncDispatcher::shared(),
            events: env.events(),
            limits: ReassemblyLimits::default(),
            initializer: None,
            runtime: env.runtime().clone(),
        }
    }

    pub fn with_io_dispatcher(mut self, io: SharedDispatcher) -> Self {
        self.io = io;
        self
    }

    pub fn with_events_dispatcher(mut self, events: SharedDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn with_limits(mut self, limits: ReassemblyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_initializer(mut self, initializer: ChannelInitializer<C>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub fn events(&self) -> SharedDispatcher {
        Arc::clone(&self.events)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// 构造通道并运行初始化钩子。
    pub fn open_channel(&self, native: Arc<dyn NativeConnection>) -> NetChannel<C> {
        let channel = NetChannel::new(native, self);
        if let Some(initializer) = &self.initializer {
            initializer(&channel);
        }
        channel
    }
}

/// 有序的“新通道”回调列表。
pub struct ChannelCallbacks<C: Codec> {
    callbacks: Mutex<Vec<ChannelCallback<C>>>,
}

impl<C: Codec> Default for ChannelCallbacks<C> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<C: Codec> ChannelCallbacks<C> {
    pub fn register(&self, callback: ChannelCallback<C>) {
        self.callbacks.lock().push(callback);
    }

    /// 依注册顺序在当前线程上通知；在开始读取之前调用，消费者因此不会漏掉首条消息。
    pub fn announce(&self, channel: &NetChannel<C>) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(channel.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{LineCodec, RawCodec},
        dispatcher::WorkerPoolDispatcher,
        test_stubs::RecordingConnection,
    };
    use bytes::{Bytes, BytesMut};
    use futures::StreamExt;
    use std::{
        sync::{Barrier, atomic::AtomicUsize},
        thread,
    };
    use tracing_test::traced_test;

    fn settings<C: Codec>(codec: C) -> ChannelSettings<C> {
        ChannelSettings::new(codec, &Environment::current().unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_close_runs_native_close_once() {
        let native = RecordingConnection::new();
        let channel = settings(RawCodec).open_channel(native.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        channel.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let channel = channel.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    channel.close()
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .unwrap()
                .await_timeout(Duration::from_secs(5))
                .unwrap();
        }

        assert_eq!(native.close_calls(), 1, "原生关闭只能执行一次");
        assert_eq!(notified.load(Ordering::SeqCst), 1, "关闭监听器只能触发一次");
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_native_close_reopens_channel() {
        let native = RecordingConnection::new();
        native.fail_next_close();
        let channel = settings(RawCodec).open_channel(native.clone());
        assert!(channel.close().await_timeout(Duration::from_secs(1)).is_err());
        assert_eq!(channel.state(), ChannelState::Open, "关闭失败后标志应回到 Open");
        channel.close().await_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(native.close_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_are_reassembled_and_delivered_in_order() {
        let pool: SharedDispatcher = Arc::new(WorkerPoolDispatcher::new("events", 2, 16).unwrap());
        let channel = settings(LineCodec::default())
            .with_events_dispatcher(pool)
            .open_channel(RecordingConnection::new());
        let mut lines = channel.in_().subscribe_stream();

        for piece in ["al", "pha\nbe", "ta\r\ngam", "ma\n"] {
            channel.receive(InboundChunk::Bytes(BytesMut::from(piece.as_bytes())));
        }
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(lines.next().await.unwrap().unwrap());
        }
        assert_eq!(got, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_failure_reaches_completion_and_error_listener() {
        let native = RecordingConnection::new();
        let channel = settings(RawCodec).open_channel(native.clone());
        let reported = Promise::<&'static str>::pending(SyncDispatcher::shared());
        let sink = reported.clone();
        channel.on_error(move |err| {
            sink.complete(err.code());
        });

        channel
            .send(Bytes::from_static(b"ok"))
            .await_timeout(Duration::from_secs(1))
            .unwrap();
        native.fail_next_write(std::io::ErrorKind::BrokenPipe);
        let err = channel
            .send_and_flush(Bytes::from_static(b"lost"))
            .await_timeout(Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            reported.await_timeout(Duration::from_secs(1)).unwrap(),
            "rivulet.channel.write_failed"
        );
        assert_eq!(native.written(), vec![Bytes::from_static(b"ok")]);
        channel.terminated().await_timeout(Duration::from_secs(1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_after_close_fail_without_touching_native() {
        let native = RecordingConnection::new();
        let channel = settings(RawCodec).open_channel(native.clone());
        channel.close().await_timeout(Duration::from_secs(1)).unwrap();
        let err = channel
            .send(Bytes::from_static(b"late"))
            .await_timeout(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed { operation: "write" }));
        assert!(native.written().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn transient_read_failure_is_logged_at_debug_and_closes() {
        let native = RecordingConnection::new();
        let channel = settings(RawCodec).open_channel(native.clone());
        let errored = Promise::<()>::pending(SyncDispatcher::shared());
        let flag = errored.clone();
        channel
            .in_()
            .consume_with(|_| {}, move |_| {
                flag.complete(());
            }, || {});

        channel.fail(TransportError::io(
            crate::error::ops::CHANNEL_READ,
            std::io::Error::from(std::io::ErrorKind::ConnectionReset),
        ));
        errored.await_timeout(Duration::from_secs(1)).unwrap();
        channel.terminated().await_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(native.close_calls(), 1);
        assert!(logs_contain("connection dropped by peer"));
        assert!(!logs_contain("channel failed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_idle_fires_once_until_next_activity() {
        let channel = settings(RawCodec).open_channel(RecordingConnection::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_read_idle(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "无活动期间只能触发一次");

        channel.receive(InboundChunk::Bytes(BytesMut::from(&b"ping"[..])));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2, "读活动之后应重新计时");
        channel.close().await_timeout(Duration::from_secs(1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumer_can_close_its_own_channel_from_callback() {
        let native = RecordingConnection::new();
        let channel = settings(RawCodec).open_channel(native.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let completed = Promise::<()>::pending(SyncDispatcher::shared());
        let (counter, closer, done) = (Arc::clone(&seen), channel.clone(), completed.clone());
        channel.in_().consume_with(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                closer.close();
            },
            |_| {},
            move || {
                done.complete(());
            },
        );

        channel.receive(InboundChunk::Bytes(BytesMut::from(&b"bye"[..])));
        completed
            .await_timeout(Duration::from_secs(1))
            .expect("回调内关闭通道后入站序列应正常完成");
        channel.receive(InboundChunk::Bytes(BytesMut::from(&b"late"[..])));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(native.close_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumer_can_fail_its_own_channel_from_callback() {
        let channel = settings(RawCodec).open_channel(RecordingConnection::new());
        let failed = Promise::<&'static str>::pending(SyncDispatcher::shared());
        let (closer, sink) = (channel.clone(), failed.clone());
        channel.in_().consume_with(
            move |_| closer.fail(TransportError::closed("read")),
            move |err| {
                sink.complete(err.code());
            },
            || {},
        );
        channel.receive(InboundChunk::Bytes(BytesMut::from(&b"boom"[..])));
        assert_eq!(
            failed.await_timeout(Duration::from_secs(1)).unwrap(),
            "rivulet.channel.closed"
        );
        channel.terminated().await_timeout(Duration::from_secs(1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_registered_after_close_never_fires() {
        let channel = settings(RawCodec).open_channel(RecordingConnection::new());
        channel.close().await_timeout(Duration::from_secs(1)).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let (reads, writes) = (Arc::clone(&fired), Arc::clone(&fired));
        channel.on_read_idle(Duration::from_millis(20), move || {
            reads.fetch_add(1, Ordering::SeqCst);
        });
        channel.on_write_idle(Duration::from_millis(20), move || {
            writes.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "已关闭的通道不应触发空闲");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_idle_fires_once_per_period_and_rearms_on_send() {
        let channel = settings(RawCodec).open_channel(RecordingConnection::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_write_idle(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "无写出期间只能触发一次");

        channel
            .send(Bytes::from_static(b"tick"))
            .await_timeout(Duration::from_secs(1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2, "成功写出之后应重新计时");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2, "同一空闲期内不应重复触发");
        channel.close().await_timeout(Duration::from_secs(1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initializer_runs_before_channel_is_returned() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let init: ChannelInitializer<RawCodec> = Arc::new(move |_channel| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _channel = settings(RawCodec)
            .with_initializer(init)
            .open_channel(RecordingConnection::new());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
