#![doc = r#"
# rivulet-transport-mux

## 定位（Why）
- 一个物理套接字、多个逻辑对端：入站单元按对端身份分组，每个身份对应一个
  [`rivulet_core::NetChannel`]；
- 套接字本身不是线程安全的，由专属工作线程独占，其它线程的写入经队列交给它。

## 结构（How）
- `frame`：多帧单元 [`Multipart`] 与 `[flags][len][payload]` 线格式；
- `socket`：[`MultipartSocket`] 契约、[`SocketKind`]、可跨线程唤醒 `recv` 的 [`Interrupter`]；
- `tcp_socket`/`memory`：TCP 承载实现与脚本化的内存实现；
- `worker`/`demux`：工作线程的收发循环与按身份物化通道的解复用器；
- `server`/`client`：[`MuxServer`] 生命周期与异步对端 [`MuxClient`]；
- `config`：可从 TOML 读取的 [`MuxSocketOptions`]。

## 约束（What）
- 路由模式下出站单元以目标身份帧开头，由通道写路径自动加上；
- 空单元是显式关闭标记，对端断开是隐式关闭。
"#]

mod client;
mod config;
mod connection;
mod demux;
mod error;
mod frame;
mod memory;
mod server;
mod socket;
mod tcp_socket;
mod worker;

pub use client::MuxClient;
pub use config::{MuxSocketOptions, SocketConfigurer};
pub use error::MuxError;
pub use frame::{DEFAULT_MAX_FRAME, FRAME_HEADER_LEN, Multipart, MultipartDecoder};
pub use memory::{MemoryPeer, MemorySocket};
pub use server::{DEFAULT_MUX_ADDRESS, MuxServer};
pub use socket::{Identity, Interrupter, MultipartSocket, SocketEvent, SocketKind};
pub use tcp_socket::TcpMuxSocket;
