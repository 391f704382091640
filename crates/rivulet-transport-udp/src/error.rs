use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use rivulet_core::{OperationKind, TransportError};
use thiserror::Error;

use crate::MulticastInterface;

pub(crate) const BIND: OperationKind =
    OperationKind::new("rivulet.transport.udp.bind_failed", "udp bind");
pub(crate) const RECEIVE: OperationKind =
    OperationKind::new("rivulet.transport.udp.receive_failed", "udp receive");
pub(crate) const SEND: OperationKind =
    OperationKind::new("rivulet.transport.udp.send_failed", "udp send");
pub(crate) const JOIN: OperationKind =
    OperationKind::new("rivulet.transport.udp.join_failed", "udp multicast join");
pub(crate) const LEAVE: OperationKind =
    OperationKind::new("rivulet.transport.udp.leave_failed", "udp multicast leave");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("rivulet.transport.udp.configure_failed", "udp configure");

/// 数据报适配器特有的参数错误。
///
/// 这些错误在进入原生调用之前就被发现，以 `InvalidInput`（或 `NotConnected`）包装进对应操作的
/// [`TransportError::Io`]，从而保留稳定错误码。
#[derive(Debug, Error)]
pub enum UdpError {
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("multicast group {group} and interface {interface:?} belong to different address families")]
    FamilyMismatch {
        group: IpAddr,
        interface: MulticastInterface,
    },
    #[error("no datagram peer known yet and no default remote configured")]
    NoPeer,
    #[error("datagram target {target} does not match socket family of {local}")]
    TargetFamily { target: SocketAddr, local: SocketAddr },
}

impl UdpError {
    pub(crate) fn into_transport(self, kind: OperationKind) -> TransportError {
        let io_kind = match self {
            Self::NoPeer => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::InvalidInput,
        };
        TransportError::io(kind, io::Error::new(io_kind, self))
    }
}
