use rivulet_core::OperationKind;

pub(crate) const BIND: OperationKind =
    OperationKind::new("rivulet.transport.tcp.bind_failed", "tcp bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("rivulet.transport.tcp.accept_failed", "tcp accept");
pub(crate) const CONNECT: OperationKind =
    OperationKind::new("rivulet.transport.tcp.connect_failed", "tcp connect");
pub(crate) const READ: OperationKind =
    OperationKind::new("rivulet.transport.tcp.read_failed", "tcp read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("rivulet.transport.tcp.write_failed", "tcp write");
pub(crate) const FLUSH: OperationKind =
    OperationKind::new("rivulet.transport.tcp.flush_failed", "tcp flush");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("rivulet.transport.tcp.configure_failed", "tcp configure");
