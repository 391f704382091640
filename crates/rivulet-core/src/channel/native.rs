use std::{fmt, net::SocketAddr};

use bytes::Bytes;

use crate::promise::Promise;

/// 各传输为 [`NetChannel`](super::NetChannel) 提供的原生能力集合。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 通道只有一个具体类型；流式、数据报、多路复用三种传输的差异收敛到这组能力里，
///   而不是为每种传输派生一个通道子类型。
///
/// ## 契约（What）
/// - `write`：提交一个已编码帧；`flush = true` 时要求原生层立即发出缓冲数据；
///   完成（或失败）时解析 `completion`；
/// - `close`：释放原生资源，完成时解析 `completion`；由通道的关闭标志保证只调用一次，
///   失败后可能被再次调用；
/// - 所有方法都不得阻塞调用线程，在途的 `completion` 在原生资源释放时必须以
///   “关闭期间中止”失败，不得永远挂起。
pub trait NativeConnection: Send + Sync + 'static {
    fn write(&self, frame: Bytes, flush: bool, completion: Promise<()>);

    fn flush(&self, completion: Promise<()>);

    fn close(&self, completion: Promise<()>);

    /// 对端地址；仅面向连接的传输提供。
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    /// 日志中使用的简短描述。
    fn describe(&self) -> String {
        match self.remote_address() {
            Some(addr) => addr.to_string(),
            None => "unconnected".to_owned(),
        }
    }
}

impl fmt::Debug for dyn NativeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
