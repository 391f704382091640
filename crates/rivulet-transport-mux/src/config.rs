use std::{fmt, io, net::SocketAddr, sync::Arc};

use serde::Deserialize;
use socket2::Socket;

use crate::{frame::DEFAULT_MAX_FRAME, socket::SocketKind};

/// 监听套接字的配置钩子，在通用选项之后、绑定之前调用。
pub type SocketConfigurer = Arc<dyn Fn(&Socket) -> io::Result<()> + Send + Sync + 'static>;

/// 多路复用套接字选项。
///
/// ## 契约（What）
/// - `kind` 缺省为 `router`；
/// - `listen_address` 覆盖构造服务端时给出的地址；
/// - `io_threads` 大于 1 时，各通道的解码运行在同名线程池上，否则沿用通道设置里的 I/O 调度器；
/// - `configurer` 不参与反序列化。
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MuxSocketOptions {
    kind: SocketKind,
    listen_address: Option<SocketAddr>,
    io_threads: usize,
    max_frame: usize,
    #[serde(skip)]
    configurer: Option<SocketConfigurer>,
}

impl Default for MuxSocketOptions {
    fn default() -> Self {
        Self {
            kind: SocketKind::Router,
            listen_address: None,
            io_threads: 1,
            max_frame: DEFAULT_MAX_FRAME,
            configurer: None,
        }
    }
}

impl MuxSocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: SocketKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_listen_address(mut self, address: SocketAddr) -> Self {
        self.listen_address = Some(address);
        self
    }

    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    pub fn with_configurer(mut self, configurer: SocketConfigurer) -> Self {
        self.configurer = Some(configurer);
        self
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.listen_address
    }

    pub fn io_threads(&self) -> usize {
        self.io_threads
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn configurer(&self) -> Option<&SocketConfigurer> {
        self.configurer.as_ref()
    }
}

impl fmt::Debug for MuxSocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSocketOptions")
            .field("kind", &self.kind)
            .field("listen_address", &self.listen_address)
            .field("io_threads", &self.io_threads)
            .field("max_frame", &self.max_frame)
            .field("configurer", &self.configurer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_toml_with_defaults() {
        let options: MuxSocketOptions = toml::from_str(
            r#"
            kind = "pair"
            listen_address = "127.0.0.1:5555"
            "#,
        )
        .unwrap();
        assert_eq!(options.kind(), SocketKind::Pair);
        assert_eq!(options.listen_address(), Some("127.0.0.1:5555".parse().unwrap()));
        assert_eq!(options.io_threads(), 1, "未给出的字段应回落到默认值");
        assert_eq!(options.max_frame(), DEFAULT_MAX_FRAME);
        assert!(options.configurer().is_none());
    }

    #[test]
    fn io_thread_hint_is_at_least_one() {
        assert_eq!(MuxSocketOptions::new().with_io_threads(0).io_threads(), 1);
    }
}
