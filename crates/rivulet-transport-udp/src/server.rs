use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use parking_lot::Mutex;
use rivulet_core::{
    Broadcaster, ChannelCallbacks, ChannelSettings, ChannelSink, Codec, Lifecycle, LifecycleState,
    NativeConnection, NetChannel, Promise, ServerSocketOptions, TransportError,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::{
    MulticastInterface,
    connection::{DatagramConnection, connection, read_loop, write_loop},
    error::{BIND, CONFIGURE, JOIN, LEAVE, SEND, UdpError},
};

/// 默认绑定地址。
pub const DEFAULT_DATAGRAM_ADDRESS: &str = "127.0.0.1:3000";

/// 单个报文的最大长度（含 IPv6 jumbogram 之外的全部合法 UDP 载荷）。
const MAX_DATAGRAM: usize = 65_536;

struct Bound<C: Codec> {
    socket: Arc<UdpSocket>,
    native: Arc<DatagramConnection>,
    channel: NetChannel<C>,
}

impl<C: Codec> Clone for Bound<C> {
    fn clone(&self) -> Self {
        Self {
            socket: Arc::clone(&self.socket),
            native: Arc::clone(&self.native),
            channel: self.channel.clone(),
        }
    }
}

struct ServerInner<C: Codec> {
    address: SocketAddr,
    options: ServerSocketOptions,
    interface: Option<MulticastInterface>,
    default_remote: Option<SocketAddr>,
    settings: ChannelSettings<C>,
    callbacks: ChannelCallbacks<C>,
    lifecycle: Lifecycle,
    inbound: Broadcaster<C::In>,
    bound: Mutex<Option<Bound<C>>>,
}

/// 数据报服务端适配器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 数据报没有“接受连接”的概念：绑定成功后整个套接字就是一个通道，
///   `start()` 时通过“新通道”回调交给应用一次；
/// - `in_()` 在启动之前即可订阅，绑定后的通道入站消息会转发到同一个序列，
///   调用方不必关心订阅与绑定的先后。
///
/// ## 逻辑（How）
/// - 绑定经由 `socket2` 设置缓冲区与地址复用，再交给 Tokio；
/// - 写入默认发往配置的远端，未配置时发往最近一个报文的发送方；`send_to` 指定目标；
/// - `join`/`leave` 在调用线程上同步完成原生操作，结果写入已解析的 [`Promise`]。
///
/// ## 契约（What）
/// - 重复 `start()`、未启动即 `shutdown()` 以生命周期错误失败；
/// - `join`/`leave` 在未运行时以 “not started” 失败，非多播地址或接口族不匹配时以
///   `rivulet.transport.udp.join_failed`/`leave_failed` 失败；
/// - `shutdown()` 之后入站序列正常完成。
pub struct DatagramServer<C: Codec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for DatagramServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> DatagramServer<C> {
    pub fn new(address: SocketAddr, settings: ChannelSettings<C>) -> Self {
        Self::with_options(address, settings, ServerSocketOptions::default(), None, None)
    }

    /// `interface` 为 `join`/`leave` 未显式给出接口时使用的默认接口；
    /// `default_remote` 为普通写入的目标。
    pub fn with_options(
        address: SocketAddr,
        settings: ChannelSettings<C>,
        options: ServerSocketOptions,
        interface: Option<MulticastInterface>,
        default_remote: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                address,
                options,
                interface,
                default_remote,
                settings,
                callbacks: ChannelCallbacks::default(),
                lifecycle: Lifecycle::new(),
                inbound: Broadcaster::inline(),
                bound: Mutex::new(None),
            }),
        }
    }

    /// 注册“新通道”回调；每次成功启动触发一次。
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

    pub fn options(&self) -> &ServerSocketOptions {
        &self.inner.options
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound()
            .and_then(|bound| bound.socket.local_addr().ok())
    }

    /// 已绑定的通道。
    pub fn channel(&self) -> Option<NetChannel<C>> {
        self.bound().map(|bound| bound.channel)
    }

    /// 最近一个入站报文的发送方。
    pub fn last_peer(&self) -> Option<SocketAddr> {
        self.bound().and_then(|bound| bound.native.last_peer())
    }

    /// 入站消息序列；启动前订阅同样有效。
    pub fn in_(&self) -> &Broadcaster<C::In> {
        &self.inner.inbound
    }

    /// 出站 sink；未运行时返回生命周期错误。
    pub fn out(&self) -> Result<ChannelSink<C>, TransportError> {
        self.running("out").map(|bound| bound.channel.out())
    }

    /// 发往默认目标（配置的远端或最近的发送方）。
    ///
    /// 写入结果通过通道的错误监听器报告；需要逐条结果时使用 [`DatagramServer::send_to`]。
    pub fn send(&self, message: C::Out) -> Result<&Self, TransportError> {
        let bound = self.running("send")?;
        if bound.native.remote_address().is_none() {
            return Err(UdpError::NoPeer.into_transport(SEND));
        }
        bound.channel.send_and_flush(message);
        Ok(self)
    }

    /// 发往指定地址；失败只影响返回的 Promise，不会终止通道。
    pub fn send_to(&self, message: C::Out, target: SocketAddr) -> Promise<()> {
        let bound = match self.running("send") {
            Ok(bound) => bound,
            Err(err) => return Promise::failure(err),
        };
        let completion = Promise::pending(self.inner.settings.events());
        match bound.channel.codec().encode(message) {
            Ok(frame) => bound.native.send_frame_to(frame, target, completion.clone()),
            Err(err) => {
                completion.fail(err.into());
            }
        }
        completion
    }

    /// 绑定套接字、创建通道并开始接收。
    pub fn start(&self) -> Promise<()> {
        let inner = &self.inner;
        if let Err(err) = inner.lifecycle.begin_start() {
            return Promise::failure(err);
        }
        let runtime = inner.settings.runtime().clone();
        let bound = {
            let _context = runtime.enter();
            bind_socket(inner.address, &inner.options)
        };
        let socket = match bound {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                inner.lifecycle.start_failed();
                warn!(address = %inner.address, code = err.code(), %err, "datagram server failed to start");
                return Promise::failure(err);
            }
        };
        let local = socket.local_addr().unwrap_or(inner.address);

        let (native, queue) = connection(local, inner.default_remote);
        let channel = inner.settings.open_channel(native.clone());
        let forward = inner.inbound.clone();
        let failed = inner.inbound.clone();
        let completed = inner.inbound.clone();
        channel.in_().consume_with(
            move |message| {
                forward.emit(message);
            },
            move |err| {
                failed.error(err);
            },
            move || {
                completed.complete();
            },
        );
        inner.callbacks.announce(&channel);

        let reader = runtime.spawn(read_loop(
            Arc::clone(&socket),
            Arc::clone(&native),
            channel.clone(),
            MAX_DATAGRAM,
        ));
        runtime.spawn(write_loop(Arc::clone(&socket), queue, reader.abort_handle()));

        *inner.bound.lock() = Some(Bound {
            socket,
            native,
            channel,
        });
        inner.lifecycle.started();
        info!(address = %local, "datagram server bound");
        Promise::success(())
    }

    /// 关闭通道并释放套接字。
    pub fn shutdown(&self) -> Promise<()> {
        let inner = Arc::clone(&self.inner);
        if let Err(err) = inner.lifecycle.begin_shutdown() {
            return Promise::failure(err);
        }
        let promise = Promise::pending(inner.settings.events());
        let bound = inner.bound.lock().take();
        let done = promise.clone();
        inner.settings.runtime().clone().spawn(async move {
            if let Some(bound) = bound {
                if let Err(err) = bound.channel.close().await {
                    warn!(%err, "datagram channel close failed during shutdown");
                }
            }
            inner.lifecycle.stopped();
            info!(address = %inner.address, "datagram server stopped");
            done.complete(());
        });
        promise
    }

    /// 加入多播组；`interface` 为空时使用构造时配置的接口，否则由系统选择。
    pub fn join(&self, group: IpAddr, interface: Option<MulticastInterface>) -> Promise<()> {
        Promise::from_result(self.membership(group, interface, true))
    }

    /// 离开多播组。
    pub fn leave(&self, group: IpAddr, interface: Option<MulticastInterface>) -> Promise<()> {
        Promise::from_result(self.membership(group, interface, false))
    }

    fn membership(
        &self,
        group: IpAddr,
        interface: Option<MulticastInterface>,
        join: bool,
    ) -> Result<(), TransportError> {
        let (operation, kind) = if join { ("join", JOIN) } else { ("leave", LEAVE) };
        let bound = self.running(operation)?;
        if !group.is_multicast() {
            return Err(UdpError::NotMulticast(group).into_transport(kind));
        }
        let interface = interface
            .or(self.inner.interface)
            .unwrap_or_else(|| MulticastInterface::any_for(group));
        if !interface.matches(group) {
            return Err(UdpError::FamilyMismatch { group, interface }.into_transport(kind));
        }

        let socket = &bound.socket;
        let outcome = match (group, interface) {
            (IpAddr::V4(group), MulticastInterface::V4(local)) if join => {
                socket.join_multicast_v4(group, local)
            }
            (IpAddr::V4(group), MulticastInterface::V4(local)) => {
                socket.leave_multicast_v4(group, local)
            }
            (IpAddr::V6(group), MulticastInterface::V6(index)) if join => {
                socket.join_multicast_v6(&group, index)
            }
            (IpAddr::V6(group), MulticastInterface::V6(index)) => {
                socket.leave_multicast_v6(&group, index)
            }
            _ => return Err(UdpError::FamilyMismatch { group, interface }.into_transport(kind)),
        };
        outcome.map_err(|err| TransportError::io(kind, err))?;
        debug!(%group, ?interface, operation, "multicast membership changed");
        Ok(())
    }

    fn bound(&self) -> Option<Bound<C>> {
        self.inner.bound.lock().clone()
    }

    fn running(&self, operation: &'static str) -> Result<Bound<C>, TransportError> {
        self.inner.lifecycle.ensure_running(operation)?;
        self.bound()
            .ok_or_else(|| TransportError::invalid_state(operation, "not started"))
    }
}

fn bind_socket(
    address: SocketAddr,
    options: &ServerSocketOptions,
) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|err| TransportError::io(BIND, err))?;
    options
        .apply_buffers(&socket)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    socket
        .bind(&address.into())
        .map_err(|err| TransportError::io(BIND, err))?;
    UdpSocket::from_std(socket.into()).map_err(|err| TransportError::io(BIND, err))
}
