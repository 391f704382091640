//! 内存多帧套接字：入站事件由配对的 [`MemoryPeer`] 脚本化注入，出站单元被记录下来。

use rivulet_core::TransportError;
use tokio::sync::mpsc;

use crate::{
    error::{MuxError, RECEIVE, SEND},
    frame::Multipart,
    socket::{Identity, Interrupter, MultipartSocket, SocketEvent, SocketKind},
};

/// 供测试与进程内对接使用的 [`MultipartSocket`]。
#[derive(Debug)]
pub struct MemorySocket {
    kind: SocketKind,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    interrupter: Interrupter,
    outbound: mpsc::UnboundedSender<Multipart>,
}

/// [`MemorySocket`] 的另一端。
#[derive(Debug)]
pub struct MemoryPeer {
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: mpsc::UnboundedReceiver<Multipart>,
}

impl MemorySocket {
    pub fn pair(kind: SocketKind) -> (Self, MemoryPeer) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let wake = events_tx.clone();
        let socket = Self {
            kind,
            events,
            interrupter: Interrupter::new(move || {
                let _ = wake.send(SocketEvent::Interrupted);
            }),
            outbound,
        };
        let peer = MemoryPeer {
            events: events_tx,
            outbound: outbound_rx,
        };
        (socket, peer)
    }
}

impl MultipartSocket for MemorySocket {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn recv(&mut self) -> Result<SocketEvent, TransportError> {
        self.events
            .blocking_recv()
            .ok_or_else(|| MuxError::SourceGone.into_transport(RECEIVE))
    }

    fn send(&mut self, unit: Multipart) -> Result<(), TransportError> {
        if self.kind.routes_by_identity() && unit.is_empty() {
            return Err(MuxError::MissingIdentity.into_transport(SEND));
        }
        self.outbound
            .send(unit)
            .map_err(|_| MuxError::NoPeer.into_transport(SEND))
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }
}

impl MemoryPeer {
    /// 注入一个入站单元；路由模式下调用方负责放入身份首帧。
    pub fn deliver(&self, unit: Multipart) -> bool {
        self.events.send(SocketEvent::Message(unit)).is_ok()
    }

    /// 注入一次对端断开。
    pub fn disconnect(&self, identity: Option<Identity>) -> bool {
        self.events.send(SocketEvent::Disconnected(identity)).is_ok()
    }

    /// 等待下一条出站单元；套接字被释放后返回 `None`。
    pub async fn next_sent(&mut self) -> Option<Multipart> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Multipart> {
        self.outbound.try_recv().ok()
    }
}
