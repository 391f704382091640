use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_core::{
    ChannelCallbacks, ChannelId, ChannelSettings, Codec, Lifecycle, LifecycleState, NetChannel,
    Promise, ServerSocketOptions, SslOptions, TransportError,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    connection::attach,
    error::{ACCEPT, BIND, CONFIGURE},
};

/// 默认监听地址。
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3000";

struct Running {
    stop: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

struct ServerInner<C: Codec> {
    address: SocketAddr,
    options: ServerSocketOptions,
    ssl: Option<SslOptions>,
    settings: ChannelSettings<C>,
    callbacks: ChannelCallbacks<C>,
    lifecycle: Lifecycle,
    local_addr: Mutex<Option<SocketAddr>>,
    channels: Arc<DashMap<ChannelId, NetChannel<C>>>,
    running: Mutex<Option<Running>>,
}

/// 面向连接的流式服务端适配器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把“绑定 → 接受 → 为每条连接创建通道”的过程包装成异步生命周期：
///   `start()` 与 `shutdown()` 都返回 [`Promise`]，绑定失败不会留下半监听状态；
/// - 每条被接受的连接在开始读取之前通过 [`TcpServer::on_channel`] 注册的回调交给应用。
///
/// ## 逻辑（How）
/// - 绑定使用 `socket2` 预先设置 backlog、缓冲区、地址复用等选项，再交给 Tokio；
/// - 接受循环运行在运行时上，通过 `watch` 停止信号退出；存活通道登记在 `DashMap` 中，
///   通道关闭时自行注销；
/// - `shutdown` 先停止接受，再关闭所有存活通道，最后等待接受任务退出（监听套接字释放）
///   后解析 Promise。
///
/// ## 契约（What）
/// - 重复 `start()`、未启动即 `shutdown()` 以生命周期错误失败，且不影响已有状态；
/// - 配置了 [`SslOptions`] 时 `start()` 以不受支持的配置失败。
pub struct TcpServer<C: Codec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for TcpServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> TcpServer<C> {
    pub fn new(address: SocketAddr, settings: ChannelSettings<C>) -> Self {
        Self::with_options(address, settings, ServerSocketOptions::default(), None)
    }

    pub fn with_options(
        address: SocketAddr,
        settings: ChannelSettings<C>,
        options: ServerSocketOptions,
        ssl: Option<SslOptions>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                address,
                options,
                ssl,
                settings,
                callbacks: ChannelCallbacks::default(),
                lifecycle: Lifecycle::new(),
                local_addr: Mutex::new(None),
                channels: Arc::new(DashMap::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// 注册“新通道”回调。
    pub fn on_channel<F>(&self, callback: F) -> &Self
    where
        F: Fn(NetChannel<C>) + Send + Sync + 'static,
    {
        self.inner.callbacks.register(Arc::new(callback));
        self
    }

    /// 实际绑定地址；端口为 0 时用于获取系统分配的端口。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn options(&self) -> &ServerSocketOptions {
        &self.inner.options
    }

    pub fn ssl(&self) -> Option<&SslOptions> {
        self.inner.ssl.as_ref()
    }

    /// 当前存活的连接数。
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// 绑定并开始接受连接。
    pub fn start(&self) -> Promise<()> {
        let inner = &self.inner;
        if let Err(err) = inner.lifecycle.begin_start() {
            return Promise::failure(err);
        }
        if inner.ssl.is_some() {
            inner.lifecycle.start_failed();
            return Promise::failure(TransportError::Unsupported(
                "tls is not supported by the tcp transport".into(),
            ));
        }

        let promise = Promise::pending(inner.settings.events());
        let runtime = inner.settings.runtime().clone();
        let bound = {
            let _context = runtime.enter();
            bind_listener(inner.address, &inner.options)
        };
        let listener = match bound {
            Ok(listener) => listener,
            Err(err) => {
                inner.lifecycle.start_failed();
                warn!(address = %inner.address, code = err.code(), %err, "tcp server failed to start");
                promise.fail(err);
                return promise;
            }
        };
        let local = listener.local_addr().ok();
        *inner.local_addr.lock() = local;

        let (stop, stopped) = watch::channel(false);
        let acceptor = runtime.spawn(accept_loop(Arc::clone(inner), listener, stopped));
        *inner.running.lock() = Some(Running { stop, acceptor });
        inner.lifecycle.started();
        info!(address = ?local, "tcp server listening");
        promise.complete(());
        promise
    }

    /// 停止接受、关闭所有连接并释放监听套接字。
    pub fn shutdown(&self) -> Promise<()> {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = inner.lifecycle.begin_shutdown() {
            return Promise::failure(err);
        }
        let promise = Promise::pending(inner.settings.events());
        let running = inner.running.lock().take();

        let done = promise.clone();
        inner.settings.runtime().clone().spawn(async move {
            if let Some(Running { stop, acceptor }) = running {
                let _ = stop.send(true);
                if acceptor.await.is_err() {
                    warn!("tcp accept task ended abnormally");
                }
            }
            // 先复制出快照：关闭监听器会从同一个 DashMap 注销，不能在迭代时触发。
            let live: Vec<NetChannel<C>> = inner
                .channels
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            let closing: Vec<Promise<()>> = live.iter().map(NetChannel::close).collect();
            for close in closing {
                if let Err(err) = close.await {
                    warn!(%err, "channel close failed during shutdown");
                }
            }
            inner.lifecycle.stopped();
            *inner.local_addr.lock() = None;
            info!(address = %inner.address, "tcp server stopped");
            done.complete(());
        });
        promise
    }
}

fn bind_listener(
    address: SocketAddr,
    options: &ServerSocketOptions,
) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| TransportError::io(BIND, err))?;
    options
        .apply(&socket)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    socket
        .bind(&address.into())
        .map_err(|err| TransportError::io(BIND, err))?;
    socket
        .listen(options.backlog())
        .map_err(|err| TransportError::io(BIND, err))?;
    TcpListener::from_std(socket.into()).map_err(|err| TransportError::io(BIND, err))
}

async fn accept_loop<C: Codec>(
    inner: Arc<ServerInner<C>>,
    listener: TcpListener,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stopped.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                match attach(stream, &inner.settings, &inner.options, &inner.callbacks) {
                    Ok(channel) => {
                        let id = channel.id();
                        inner.channels.insert(id, channel.clone());
                        let registry = Arc::clone(&inner.channels);
                        channel.on_close(move || {
                            registry.remove(&id);
                        });
                    }
                    Err(err) => warn!(%peer, code = err.code(), %err, "failed to attach accepted connection"),
                }
            }
            Err(err) => {
                let err = TransportError::io(ACCEPT, err);
                warn!(code = err.code(), %err, "tcp accept failed");
                // 文件描述符耗尽等错误会立即重现，短暂退避避免空转。
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
