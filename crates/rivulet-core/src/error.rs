//! # 传输错误域
//!
//! ## 意图（Why）
//! - 各传输实现（流式、数据报、多路复用套接字）产生的故障需要合流为同一个错误类型，
//!   这样 Promise 与响应式序列的错误终止信号才能携带一致的语义；
//! - 生命周期误用（重复启动、未启动即关闭）必须以显式错误暴露，而不是静默忽略。
//!
//! ## 契约（What）
//! - [`TransportError`] 可 `Clone`：同一个失败可能同时解析写入完成 Promise 与通道错误通知；
//!   因此底层 `io::Error` 被包裹在 `Arc` 中共享；
//! - 每个变体提供稳定的 [`TransportError::code`]，格式为 `rivulet.<域>.<语义>`；
//! - [`TransportError::is_transient`] 标识对端复位、断管等常见断连，调用方据此降低日志级别。
//!
//! ## 实现（How）
//! - 底层操作由 [`OperationKind`] 描述（稳定错误码 + 默认文案），各传输 crate 在自己的
//!   `error` 模块中声明常量表，再通过 [`TransportError::io`] 归一化。

use std::{borrow::Cow, fmt, io, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{codec::CodecError, dispatcher::DispatchError};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    /// 声明一个操作描述，供各传输实现构造常量表。
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

/// 通道层通用操作。
pub mod ops {
    use super::OperationKind;

    pub const CHANNEL_READ: OperationKind =
        OperationKind::new("rivulet.channel.read_failed", "channel read");
    pub const CHANNEL_WRITE: OperationKind =
        OperationKind::new("rivulet.channel.write_failed", "channel write");
    pub const CHANNEL_CLOSE: OperationKind =
        OperationKind::new("rivulet.channel.close_failed", "channel close");
}

const INVALID_STATE_CODE: &str = "rivulet.lifecycle.invalid_state";
const CLOSED_CODE: &str = "rivulet.channel.closed";
const CODEC_CODE: &str = "rivulet.codec.failed";
const OVERFLOW_CODE: &str = "rivulet.reassembly.overflow";
const DISPATCH_CODE: &str = "rivulet.dispatch.rejected";
const TIMEOUT_CODE: &str = "rivulet.promise.timeout";
const UNSUPPORTED_CODE: &str = "rivulet.config.unsupported";

/// 传输层统一错误。
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// 生命周期误用：重复启动、启动前操作、未启动即关闭等。
    #[error("{operation}: invalid lifecycle state: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: Cow<'static, str>,
    },
    /// 原生 IO 失败。
    #[error("{message}: {source}", message = .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: Arc<io::Error>,
    },
    /// 操作尚未完成时通道或适配器已被关闭。
    #[error("{operation} aborted: closed during operation")]
    Closed { operation: &'static str },
    /// 编解码失败，由编解码器决定语义，此处原样透传。
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    /// 未解码的残余字节超过硬上限。
    #[error("{pending} pending bytes exceed reassembly limit of {limit}")]
    ReassemblyOverflow { pending: usize, limit: usize },
    /// 调度器拒绝任务（通常是已关闭）。
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// 有界等待超时。
    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),
    /// 配置项在当前实现中不受支持。
    #[error("unsupported configuration: {0}")]
    Unsupported(Cow<'static, str>),
}

impl TransportError {
    /// 将 IO 错误归一化为传输错误。
    pub fn io(kind: OperationKind, error: io::Error) -> Self {
        Self::Io {
            kind,
            source: Arc::new(error),
        }
    }

    /// 构造生命周期错误。
    pub fn invalid_state(operation: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    /// 构造“操作期间被关闭”错误。
    pub fn closed(operation: &'static str) -> Self {
        Self::Closed { operation }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => INVALID_STATE_CODE,
            Self::Io { kind, .. } => kind.code,
            Self::Closed { .. } => CLOSED_CODE,
            Self::Codec(_) => CODEC_CODE,
            Self::ReassemblyOverflow { .. } => OVERFLOW_CODE,
            Self::Dispatch(_) => DISPATCH_CODE,
            Self::Timeout(_) => TIMEOUT_CODE,
            Self::Unsupported(_) => UNSUPPORTED_CODE,
        }
    }

    /// 是否为常见的瞬时断连（对端复位、断管、连接中止）。
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    /// 是否为生命周期误用。
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// 若为 IO 错误，返回其 [`io::ErrorKind`]。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// 判断 IO 错误是否属于可降级记录的断连。
pub fn is_transient_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}
