use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rivulet_core::{
    ChannelCallbacks, ChannelSettings, Codec, Lifecycle, LifecycleState, NetChannel, Promise,
    ServerSocketOptions, SslOptions, TransportError,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpSocket;
use tracing::{info, warn};

use crate::{
    connection::attach,
    error::{CONFIGURE, CONNECT},
};

struct ClientInner<C: Codec> {
    address: SocketAddr,
    options: ServerSocketOptions,
    ssl: Option<SslOptions>,
    settings: ChannelSettings<C>,
    callbacks: ChannelCallbacks<C>,
    lifecycle: Lifecycle,
    connect_timeout: Mutex<Option<Duration>>,
    channel: Mutex<Option<NetChannel<C>>>,
}

/// 主动发起连接的流式客户端：`open()` 建立唯一的通道，`close()` 关闭它。
pub struct TcpClient<C: Codec> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Codec> Clone for TcpClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> TcpClient<C> {
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
            inner: Arc::new(ClientInner {
                address,
                options,
                ssl,
                settings,
                callbacks: ChannelCallbacks::default(),
                lifecycle: Lifecycle::new(),
                connect_timeout: Mutex::new(None),
                channel: Mutex::new(None),
            }),
        }
    }

    /// 设置连接超时；对之后的 `open()` 生效。
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        *self.inner.connect_timeout.lock() = Some(timeout);
        self
    }

    /// 注册“新通道”回调，连接建立后、开始读取前调用。
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

    /// 已建立的通道。
    pub fn channel(&self) -> Option<NetChannel<C>> {
        self.inner.channel.lock().clone()
    }

    /// 建立连接。
    pub fn open(&self) -> Promise<NetChannel<C>> {
        let inner = Arc::clone(&self.inner);
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
        let done = promise.clone();
        inner.settings.runtime().clone().spawn(async move {
            let limit = *inner.connect_timeout.lock();
            let connected = match limit {
                Some(limit) => tokio::time::timeout(limit, connect(inner.address, &inner.options))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(limit))),
                None => connect(inner.address, &inner.options).await,
            };
            let attached = connected.and_then(|stream| {
                attach(stream, &inner.settings, &inner.options, &inner.callbacks)
            });
            match attached {
                Ok(channel) => {
                    *inner.channel.lock() = Some(channel.clone());
                    inner.lifecycle.started();
                    info!(address = %inner.address, channel = channel.id(), "tcp client connected");
                    done.complete(channel);
                }
                Err(err) => {
                    inner.lifecycle.start_failed();
                    warn!(address = %inner.address, code = err.code(), %err, "tcp client failed to connect");
                    done.fail(err);
                }
            }
        });
        promise
    }

    /// 关闭已建立的通道。
    pub fn close(&self) -> Promise<()> {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = inner.lifecycle.begin_shutdown() {
            return Promise::failure(err);
        }
        let channel = inner.channel.lock().take();
        let Some(channel) = channel else {
            inner.lifecycle.stopped();
            return Promise::success(());
        };
        let promise = Promise::pending(inner.settings.events());
        let done = promise.clone();
        channel.close().on_complete(move |outcome| {
            inner.lifecycle.stopped();
            done.resolve(outcome);
        });
        promise
    }
}

async fn connect(
    address: SocketAddr,
    options: &ServerSocketOptions,
) -> Result<tokio::net::TcpStream, TransportError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| TransportError::io(CONNECT, err))?;
    options
        .apply_buffers(&socket)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream)
        .connect(address)
        .await
        .map_err(|err| TransportError::io(CONNECT, err))
}
