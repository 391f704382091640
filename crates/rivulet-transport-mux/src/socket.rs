//! 多路复用套接字的抽象契约。
//!
//! 套接字不是线程安全的：它被移交给唯一的工作线程独占，其余线程只能通过
//! [`Interrupter`] 唤醒阻塞中的 `recv`，让工作线程去处理排队的写入。

use std::{fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use rivulet_core::TransportError;
use serde::Deserialize;

use crate::frame::Multipart;

/// 对端身份帧。
pub type Identity = Bytes;

/// 套接字模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// 身份路由：入站单元以对端身份帧开头，出站单元必须以目标身份帧开头。
    #[default]
    Router,
    /// 单一对端：不携带身份帧。
    Pair,
}

impl SocketKind {
    pub fn routes_by_identity(self) -> bool {
        matches!(self, Self::Router)
    }
}

/// 一次阻塞 `recv` 的结果。
#[derive(Debug)]
pub enum SocketEvent {
    /// 一个完整的入站单元；路由模式下首帧为身份。
    Message(Multipart),
    /// 对端断开；单一对端模式下身份为 `None`。
    Disconnected(Option<Identity>),
    /// 被 [`Interrupter`] 唤醒。
    Interrupted,
}

/// 唤醒阻塞在 [`MultipartSocket::recv`] 上的工作线程。
#[derive(Clone)]
pub struct Interrupter {
    wake: Arc<dyn Fn() + Send + Sync + 'static>,
}

impl Interrupter {
    pub fn new<F>(wake: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            wake: Arc::new(wake),
        }
    }

    pub fn interrupt(&self) {
        (self.wake)();
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupter")
    }
}

/// 由工作线程独占驱动的多帧套接字。
///
/// # 契约（What）
/// - `recv` 阻塞直到有事件；[`Interrupter::interrupt`] 必须能让它尽快返回
///   [`SocketEvent::Interrupted`]；
/// - `send` 在路由模式下从单元首帧读取目标身份；
/// - 除 `interrupter()` 返回的句柄外，实现不需要支持跨线程调用。
pub trait MultipartSocket: Send + 'static {
    fn kind(&self) -> SocketKind;

    fn recv(&mut self) -> Result<SocketEvent, TransportError>;

    fn send(&mut self, unit: Multipart) -> Result<(), TransportError>;

    fn interrupter(&self) -> Interrupter;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// 以十六进制呈现身份，用于日志与错误信息。
pub(crate) fn display_identity(identity: &[u8]) -> String {
    identity.iter().map(|byte| format!("{byte:02x}")).collect()
}
