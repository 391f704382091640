//! # 适配器配置值
//!
//! ## 意图（Why）
//! - 缓冲区大小、backlog、地址复用、`TCP_NODELAY`/`SO_KEEPALIVE` 等选项在适配器构造时读取，
//!   之后保持只读，不参与并发核心；
//! - 配置可以从 TOML 等外部来源反序列化，缺省字段回落到与常见服务端一致的默认值。
//!
//! ## 契约（What）
//! - [`ServerSocketOptions`] 使用 `with_*` 构造、同名 getter 读取；
//! - [`SslOptions`] 只被携带与观察，适配器遇到它会以不受支持的配置拒绝启动；
//! - [`ChannelInitializer`] 是通道创建后、开始读取前调用的扩展钩子。

use std::{fmt, io, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use socket2::Socket;

use crate::channel::NetChannel;

/// 通道初始化钩子：在通道交给“新通道回调”之前运行，可注册监听器或空闲超时。
pub type ChannelInitializer<C> = Arc<dyn Fn(&NetChannel<C>) + Send + Sync + 'static>;

/// 服务端套接字选项。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把套接字级调优集中在一个不可变值里，适配器只需调用 [`ServerSocketOptions::apply`]，
///   不必直接操作 `socket2`。
///
/// ## 契约（What）
/// - 默认值：`backlog = 1000`、`keep_alive = true`、`linger = 5s`、`tcp_no_delay = true`、
///   收发缓冲各 1 MiB、`reuse_addr = true`、单次读取块 16 KiB；
/// - `tcp_no_delay` 由流式适配器在连接建立后设置，`apply` 不处理它。
///
/// ## 注意事项（Trade-offs）
/// - 内核可能调整缓冲区大小（Linux 会翻倍），读取实际值应查询套接字本身；
/// - `linger` 在 Linux 上按秒取整。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSocketOptions {
    rcvbuf: usize,
    sndbuf: usize,
    backlog: i32,
    reuse_addr: bool,
    tcp_no_delay: bool,
    keep_alive: bool,
    linger_secs: Option<u64>,
    read_chunk_size: usize,
}

impl Default for ServerSocketOptions {
    fn default() -> Self {
        Self {
            rcvbuf: 1024 * 1024,
            sndbuf: 1024 * 1024,
            backlog: 1000,
            reuse_addr: true,
            tcp_no_delay: true,
            keep_alive: true,
            linger_secs: Some(5),
            read_chunk_size: 16 * 1024,
        }
    }
}

impl ServerSocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rcvbuf(mut self, bytes: usize) -> Self {
        self.rcvbuf = bytes;
        self
    }

    pub fn with_sndbuf(mut self, bytes: usize) -> Self {
        self.sndbuf = bytes;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_reuse_addr(mut self, enabled: bool) -> Self {
        self.reuse_addr = enabled;
        self
    }

    pub fn with_tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = enabled;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// `None` 表示遵循内核默认的关闭行为。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_secs = linger.map(|d| d.as_secs());
        self
    }

    /// 单次原生读取的块大小，最小为 1。
    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes.max(1);
        self
    }

    pub fn rcvbuf(&self) -> usize {
        self.rcvbuf
    }

    pub fn sndbuf(&self) -> usize {
        self.sndbuf
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn reuse_addr(&self) -> bool {
        self.reuse_addr
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_secs.map(Duration::from_secs)
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    /// 将流式套接字相关选项落到 `socket` 上。
    pub fn apply(&self, socket: &Socket) -> io::Result<()> {
        self.apply_buffers(socket)?;
        socket.set_keepalive(self.keep_alive)?;
        socket.set_linger(self.linger())?;
        Ok(())
    }

    /// 仅应用缓冲区与地址复用，供数据报套接字使用。
    pub fn apply_buffers(&self, socket: &Socket) -> io::Result<()> {
        socket.set_recv_buffer_size(self.rcvbuf)?;
        socket.set_send_buffer_size(self.sndbuf)?;
        socket.set_reuse_address(self.reuse_addr)?;
        Ok(())
    }
}

/// TLS 选项。当前仅被携带，适配器遇到它时拒绝启动。
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SslOptions {
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    key_password: Option<String>,
    trust_all: bool,
}

impl SslOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate = Some(path.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    pub fn with_key_password(mut self, password: impl Into<String>) -> Self {
        self.key_password = Some(password.into());
        self
    }

    pub fn with_trust_all(mut self, trust_all: bool) -> Self {
        self.trust_all = trust_all;
        self
    }

    pub fn certificate(&self) -> Option<&PathBuf> {
        self.certificate.as_ref()
    }

    pub fn private_key(&self) -> Option<&PathBuf> {
        self.private_key.as_ref()
    }

    pub fn trust_all(&self) -> bool {
        self.trust_all
    }
}

impl fmt::Debug for SslOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslOptions")
            .field("certificate", &self.certificate)
            .field("private_key", &self.private_key)
            .field(
                "key_password",
                &self.key_password.as_ref().map(|_| "<redacted>"),
            )
            .field("trust_all", &self.trust_all)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_server_conventions() {
        let opts = ServerSocketOptions::default();
        assert_eq!(opts.backlog(), 1000);
        assert!(opts.keep_alive());
        assert!(opts.tcp_no_delay());
        assert!(opts.reuse_addr());
        assert_eq!(opts.linger(), Some(Duration::from_secs(5)));
        assert_eq!(opts.rcvbuf(), 1024 * 1024);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let opts: ServerSocketOptions = toml::from_str(
            r#"
            backlog = 64
            tcp_no_delay = false
            linger_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(opts.backlog(), 64);
        assert!(!opts.tcp_no_delay());
        assert_eq!(opts.linger(), Some(Duration::ZERO));
        assert_eq!(opts.sndbuf(), 1024 * 1024, "未出现的字段应取默认值");
    }

    #[test]
    fn ssl_debug_redacts_password() {
        let ssl = SslOptions::new()
            .with_certificate("/etc/cert.pem")
            .with_key_password("hunter2");
        let rendered = format!("{ssl:?}");
        assert!(!rendered.contains("hunter2"), "口令不得出现在调试输出中");
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn options_apply_to_a_real_socket() {
        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        ServerSocketOptions::default()
            .with_linger(None)
            .apply(&socket)
            .unwrap();
        assert!(socket.keepalive().unwrap());
        assert!(socket.reuse_address().unwrap());
    }
}
