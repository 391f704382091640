use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_core::{
    Broadcaster, ChannelCallbacks, ChannelSettings, Codec, Lifecycle, LifecycleState, NetChannel,
    Promise, ServerSocketOptions, SharedDispatcher, SslOptions, TransportError,
    WorkerPoolDispatcher,
};
use tracing::{info, warn};

use crate::{
    config::MuxSocketOptions,
    demux::{ChannelRegistry, Demultiplexer},
    socket::{MultipartSocket, SocketKind},
    tcp_socket::TcpMuxSocket,
    worker::Worker,
};

/// 默认监听地址。
pub const DEFAULT_MUX_ADDRESS: &str = "127.0.0.1:5555";

static NEXT_SERVER: AtomicU64 = AtomicU64::new(1);

enum Source {
    Bind(SocketAddr),
    Provided(Mutex<Option<Box<dyn MultipartSocket>>>),
}

struct ServerInner<C: Codec> {
    id: u64,
    source: Source,
    options: ServerSocketOptions,
    mux: MuxSocketOptions,
    ssl: Option<SslOptions>,
    settings: ChannelSettings<C>,
    callbacks: Arc<ChannelCallbacks<C>>,
    lifecycle: Lifecycle,
    channels: ChannelRegistry<C>,
    local_addr: Mutex<Option<SocketAddr>>,
    worker: Mutex<Option<Arc<Worker>>>,
}

/// 多路复用套接字服务端。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 一个物理套接字承载多个逻辑对端；每个对端身份在首次出现时物化为一个
///   [`NetChannel`]，经 [`MuxServer::on_channel`] 交给应用；
/// - 套接字由一个专属工作线程独占，应用线程的写入经队列交给它执行。
///
/// ## 逻辑（How）
/// - `start()`：绑定（或接管外部提供的）套接字，先让解复用器订阅广播序列，再启动工作线程；
/// - `shutdown()`：唤醒阻塞中的接收并等待工作线程退出，广播序列随之完成，
///   全部逻辑通道被关闭，套接字在线程退出时释放。
///
/// ## 契约（What）
/// - 重复 `start()`、未启动即 `shutdown()` 以生命周期错误失败；
/// - 单对端模式下所有单元归属同一个固定身份（由服务端标识派生）。
pub struct MuxServer<C: Codec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for MuxServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> MuxServer<C> {
    pub fn new(address: SocketAddr, settings: ChannelSettings<C>) -> Self {
        Self::with_options(
            address,
            settings,
            ServerSocketOptions::default(),
            MuxSocketOptions::default(),
            None,
        )
    }

    pub fn with_options(
        address: SocketAddr,
        settings: ChannelSettings<C>,
        options: ServerSocketOptions,
        mux: MuxSocketOptions,
        ssl: Option<SslOptions>,
    ) -> Self {
        Self::build(Source::Bind(address), settings, options, mux, ssl)
    }

    /// 接管一个已就绪的套接字（例如 [`crate::MemorySocket`]）；只能启动一次。
    pub fn with_socket(socket: Box<dyn MultipartSocket>, settings: ChannelSettings<C>) -> Self {
        let mux = MuxSocketOptions::default().with_kind(socket.kind());
        Self::build(
            Source::Provided(Mutex::new(Some(socket))),
            settings,
            ServerSocketOptions::default(),
            mux,
            None,
        )
    }

    fn build(
        source: Source,
        settings: ChannelSettings<C>,
        options: ServerSocketOptions,
        mux: MuxSocketOptions,
        ssl: Option<SslOptions>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                id: NEXT_SERVER.fetch_add(1, Ordering::Relaxed),
                source,
                options,
                mux,
                ssl,
                settings,
                callbacks: Arc::new(ChannelCallbacks::default()),
                lifecycle: Lifecycle::new(),
                channels: Arc::new(DashMap::new()),
                local_addr: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// 注册“新通道”回调；每个新身份触发一次，运行在工作线程上。
    pub fn on_channel<F>(&self, callback: F) -> &Self
    where
        F: Fn(NetChannel<C>) + Send + Sync + 'static,
    {
        self.inner.callbacks.register(Arc::new(callback));
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.mux.kind()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// 当前存活的逻辑通道数。
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// 单对端模式下使用的固定身份。
    pub fn fixed_identity(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.id.to_be_bytes())
    }

    pub fn start(&self) -> Promise<()> {
        let inner = &self.inner;
        if let Err(err) = inner.lifecycle.begin_start() {
            return Promise::failure(err);
        }
        if inner.ssl.is_some() {
            inner.lifecycle.start_failed();
            return Promise::failure(TransportError::Unsupported(
                "tls is not supported by the mux transport".into(),
            ));
        }
        match self.launch() {
            Ok(worker) => {
                *inner.worker.lock() = Some(worker);
                inner.lifecycle.started();
                info!(server = inner.id, address = ?self.local_addr(), kind = ?inner.mux.kind(), "mux server started");
                Promise::success(())
            }
            Err(err) => {
                inner.lifecycle.start_failed();
                warn!(server = inner.id, code = err.code(), %err, "mux server failed to start");
                Promise::failure(err)
            }
        }
    }

    fn launch(&self) -> Result<Arc<Worker>, TransportError> {
        let inner = &self.inner;
        let socket: Box<dyn MultipartSocket> = match &inner.source {
            Source::Bind(address) => Box::new(TcpMuxSocket::bind(
                *address,
                &inner.options,
                &inner.mux,
                inner.settings.runtime(),
            )?),
            Source::Provided(slot) => slot.lock().take().ok_or_else(|| {
                TransportError::invalid_state("start", "provided socket already consumed")
            })?,
        };
        *inner.local_addr.lock() = socket.local_addr();

        let settings = if inner.mux.io_threads() > 1 {
            let pool: SharedDispatcher = Arc::new(
                WorkerPoolDispatcher::new(
                    format!("mux-{}-io", inner.id),
                    inner.mux.io_threads(),
                    1024,
                )?,
            );
            inner.settings.clone().with_io_dispatcher(pool)
        } else {
            inner.settings.clone()
        };

        let (worker, pending) = Worker::new(format!("mux-{}", inner.id), socket.interrupter());
        let worker = Arc::new(worker);
        let demux = Arc::new(Demultiplexer::new(
            settings,
            Arc::clone(&inner.callbacks),
            Arc::clone(&worker),
            socket.kind().routes_by_identity(),
            Arc::clone(&inner.channels),
        ));

        let fanout = Broadcaster::inline();
        let on_error = Arc::clone(&demux);
        let on_complete = Arc::clone(&demux);
        fanout.consume_with(
            move |tagged| demux.route(tagged),
            move |err| on_error.fail_all(err),
            move || on_complete.close_all(),
        );
        worker.start(pending, socket, self.fixed_identity(), fanout)?;
        Ok(worker)
    }

    /// 停止工作线程、关闭全部逻辑通道并释放套接字。
    pub fn shutdown(&self) -> Promise<()> {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = inner.lifecycle.begin_shutdown() {
            return Promise::failure(err);
        }
        let promise = Promise::pending(inner.settings.events());
        let worker = inner.worker.lock().take();
        let done = promise.clone();
        inner.settings.runtime().clone().spawn_blocking(move || {
            if let Some(worker) = worker {
                worker.shutdown();
            }
            // 兜底：工作线程退出之后仍登记着的通道。
            let leftover: Vec<NetChannel<C>> = inner
                .channels
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for channel in leftover {
                channel.close();
            }
            inner.lifecycle.stopped();
            *inner.local_addr.lock() = None;
            info!(server = inner.id, "mux server stopped");
            done.complete(());
        });
        promise
    }
}
