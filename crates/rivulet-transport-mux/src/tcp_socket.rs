//! # TcpMuxSocket：以 TCP 承载的路由/单对端多帧套接字
//!
//! ## 意图（Why）
//! - 为解复用器提供一个真实的网络套接字：多个对端连接被折叠成一个 [`MultipartSocket`]，
//!   对工作线程而言只有“收一个单元、发一个单元”两种操作。
//!
//! ## 逻辑（How）
//! - 监听与每个对端的读写都运行在 Tokio 上，入站单元与断开事件汇入同一个事件队列，
//!   工作线程在 `recv` 中阻塞等待该队列；
//! - 路由模式下每个对端获得一个 5 字节身份 `[0, u32 BE 序号]`，入站单元前插身份帧；
//! - 出站单元按身份查找对端的写队列，编码后交给对应的写任务。
//!
//! ## 注意事项（Trade-offs）
//! - 单对端模式同一时刻只接受一个连接，其余连接在接受后立即断开；
//! - 释放套接字会停止监听并断开全部对端。

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_core::{ServerSocketOptions, TransportError};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{
    config::MuxSocketOptions,
    error::{ACCEPT, BIND, CONFIGURE, MuxError, RECEIVE, SEND},
    frame::{Multipart, MultipartDecoder},
    socket::{Identity, Interrupter, MultipartSocket, SocketEvent, SocketKind, display_identity},
};

struct Peer {
    address: SocketAddr,
    writer: mpsc::UnboundedSender<Bytes>,
}

struct Shared {
    kind: SocketKind,
    max_frame: usize,
    read_chunk: usize,
    next_identity: AtomicU32,
    peers: DashMap<Identity, Peer>,
    /// 单对端模式下当前连接的身份。
    pair_peer: Mutex<Option<Identity>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

/// TCP 承载的 [`MultipartSocket`]。
pub struct TcpMuxSocket {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    interrupter: Interrupter,
    local: SocketAddr,
    stop: watch::Sender<bool>,
}

impl TcpMuxSocket {
    /// 绑定并开始接受对端；必须提供运行时句柄以承载监听与读写任务。
    pub fn bind(
        address: SocketAddr,
        options: &ServerSocketOptions,
        mux: &MuxSocketOptions,
        runtime: &Handle,
    ) -> Result<Self, TransportError> {
        let address = mux.listen_address().unwrap_or(address);
        let listener = {
            let _context = runtime.enter();
            bind_listener(address, options, mux)?
        };
        let local = listener
            .local_addr()
            .map_err(|err| TransportError::io(BIND, err))?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let wake = events_tx.clone();
        let shared = Arc::new(Shared {
            kind: mux.kind(),
            max_frame: mux.max_frame(),
            read_chunk: options.read_chunk_size(),
            next_identity: AtomicU32::new(1),
            peers: DashMap::new(),
            pair_peer: Mutex::new(None),
            events: events_tx,
        });
        let (stop, stopped) = watch::channel(false);
        runtime.spawn(accept_loop(Arc::clone(&shared), listener, stopped));
        info!(address = %local, kind = ?mux.kind(), "mux socket listening");

        Ok(Self {
            shared,
            events,
            interrupter: Interrupter::new(move || {
                let _ = wake.send(SocketEvent::Interrupted);
            }),
            local,
            stop,
        })
    }

    /// 当前连接的对端数量。
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }
}

impl MultipartSocket for TcpMuxSocket {
    fn kind(&self) -> SocketKind {
        self.shared.kind
    }

    fn recv(&mut self) -> Result<SocketEvent, TransportError> {
        self.events
            .blocking_recv()
            .ok_or_else(|| MuxError::SourceGone.into_transport(RECEIVE))
    }

    fn send(&mut self, mut unit: Multipart) -> Result<(), TransportError> {
        let identity = if self.shared.kind.routes_by_identity() {
            unit.pop_front()
                .ok_or_else(|| MuxError::MissingIdentity.into_transport(SEND))?
        } else {
            self.shared
                .pair_peer
                .lock()
                .clone()
                .ok_or_else(|| MuxError::NoPeer.into_transport(SEND))?
        };
        let peer = self
            .shared
            .peers
            .get(&identity)
            .ok_or_else(|| MuxError::UnknownPeer(display_identity(&identity)).into_transport(SEND))?;
        peer.writer
            .send(unit.to_bytes())
            .map_err(|_| MuxError::UnknownPeer(display_identity(&identity)).into_transport(SEND))
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl Drop for TcpMuxSocket {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.shared.peers.clear();
        debug!(address = %self.local, "mux socket released");
    }
}

fn bind_listener(
    address: SocketAddr,
    options: &ServerSocketOptions,
    mux: &MuxSocketOptions,
) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| TransportError::io(BIND, err))?;
    options
        .apply(&socket)
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    if let Some(configurer) = mux.configurer() {
        configurer(&socket).map_err(|err| TransportError::io(CONFIGURE, err))?;
    }
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

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut stopped: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = stopped.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, address)) => admit(&shared, stream, address, stopped.clone()),
            Err(err) => {
                let err = TransportError::io(ACCEPT, err);
                warn!(code = err.code(), %err, "mux accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

fn admit(shared: &Arc<Shared>, stream: TcpStream, address: SocketAddr, stopped: watch::Receiver<bool>) {
    let mut raw = BytesMut::with_capacity(5);
    raw.put_u8(0);
    raw.put_u32(shared.next_identity.fetch_add(1, Ordering::Relaxed));
    let identity = raw.freeze();

    if !shared.kind.routes_by_identity() {
        let mut current = shared.pair_peer.lock();
        if current.is_some() {
            warn!(%address, "pair socket already has a peer, dropping connection");
            return;
        }
        *current = Some(identity.clone());
    }

    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    shared.peers.insert(
        identity.clone(),
        Peer {
            address,
            writer: writer_tx,
        },
    );
    debug!(%address, identity = %display_identity(&identity), "mux peer connected");
    tokio::spawn(write_peer(writer, writer_rx));
    tokio::spawn(read_peer(Arc::clone(shared), reader, identity, stopped));
}

async fn read_peer(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    identity: Identity,
    mut stopped: watch::Receiver<bool>,
) {
    let mut decoder = MultipartDecoder::new(shared.max_frame);
    let mut buf = BytesMut::with_capacity(shared.read_chunk);
    let routing = shared.kind.routes_by_identity();
    loop {
        buf.reserve(shared.read_chunk);
        let read = tokio::select! {
            _ = stopped.wait_for(|stop| *stop) => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(mut unit)) => {
                        if routing {
                            unit.push_front(identity.clone());
                        }
                        if shared.events.send(SocketEvent::Message(unit)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(identity = %display_identity(&identity), %err, "malformed mux frame, dropping peer");
                        return disconnect(&shared, identity);
                    }
                }
            },
            Err(err) => {
                debug!(identity = %display_identity(&identity), error = %err, "mux peer read failed");
                break;
            }
        }
    }
    disconnect(&shared, identity);
}

fn disconnect(shared: &Shared, identity: Identity) {
    let removed = shared.peers.remove(&identity);
    if let Some((_, peer)) = &removed {
        debug!(address = %peer.address, identity = %display_identity(&identity), "mux peer disconnected");
    }
    let surfaced = if shared.kind.routes_by_identity() {
        Some(identity)
    } else {
        let mut current = shared.pair_peer.lock();
        if current.as_ref() != Some(&identity) {
            return;
        }
        *current = None;
        None
    };
    if removed.is_some() {
        let _ = shared.events.send(SocketEvent::Disconnected(surfaced));
    }
}

async fn write_peer(mut writer: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = %err, "mux peer write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
