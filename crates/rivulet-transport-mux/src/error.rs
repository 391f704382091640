use std::io;

use rivulet_core::{OperationKind, TransportError};
use thiserror::Error;

pub(crate) const BIND: OperationKind =
    OperationKind::new("rivulet.transport.mux.bind_failed", "mux bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("rivulet.transport.mux.accept_failed", "mux accept");
pub(crate) const CONNECT: OperationKind =
    OperationKind::new("rivulet.transport.mux.connect_failed", "mux connect");
pub(crate) const RECEIVE: OperationKind =
    OperationKind::new("rivulet.transport.mux.receive_failed", "mux receive");
pub(crate) const SEND: OperationKind =
    OperationKind::new("rivulet.transport.mux.send_failed", "mux send");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("rivulet.transport.mux.configure_failed", "mux configure");
pub(crate) const WORKER: OperationKind =
    OperationKind::new("rivulet.transport.mux.worker_failed", "mux worker");

/// 多路复用套接字的路由错误。
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("outbound unit has no identity frame")]
    MissingIdentity,
    #[error("no connected peer with identity {0}")]
    UnknownPeer(String),
    #[error("pair socket has no connected peer")]
    NoPeer,
    #[error("socket event source is gone")]
    SourceGone,
}

impl MuxError {
    pub(crate) fn into_transport(self, kind: OperationKind) -> TransportError {
        let io_kind = match self {
            Self::MissingIdentity => io::ErrorKind::InvalidInput,
            Self::UnknownPeer(_) => io::ErrorKind::HostUnreachable,
            Self::NoPeer | Self::SourceGone => io::ErrorKind::NotConnected,
        };
        TransportError::io(kind, io::Error::new(io_kind, self))
    }
}
