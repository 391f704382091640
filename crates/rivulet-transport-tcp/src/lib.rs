#![doc = r#"
# rivulet-transport-tcp

## 定位（Why）
- 面向连接的流式传输适配器：[`TcpServer`] 接受连接，[`TcpClient`] 主动连接；
- 每条连接对应一个 [`rivulet_core::NetChannel`]，入站字节经通道的重组器还原为消息。

## 结构（How）
- `connection`：把 Tokio `TcpStream` 拆成读写任务，实现 [`rivulet_core::NativeConnection`]；
- `server`/`client`：绑定或连接、生命周期守卫、存活通道登记；
- `error`：稳定错误码表（`rivulet.transport.tcp.*`）。

## 约束（What）
- 必须在 Tokio 运行时中构造通道设置（见 [`rivulet_core::Environment::current`]）；
- TLS 不在本 crate 范围内，携带 [`rivulet_core::SslOptions`] 时启动失败。
"#]

mod client;
mod connection;
mod error;
mod server;

pub use client::TcpClient;
pub use server::{DEFAULT_LISTEN_ADDRESS, TcpServer};
