#![doc = r#"
# rivulet-transport-udp

## 定位（Why）
- 无连接的数据报传输适配器：一个绑定的套接字对应一个 [`rivulet_core::NetChannel`]；
- 支持 IPv4/IPv6 多播组的加入与离开，二者都以 [`rivulet_core::Promise`] 返回结果。

## 结构（How）
- `connection`：写任务串行化 `send_to`，读任务把每个报文交给通道；
- `server`：[`DatagramServer`] 的绑定、生命周期与多播操作；
- `error`：稳定错误码表（`rivulet.transport.udp.*`）与参数错误 [`UdpError`]。

## 约束（What）
- 报文与流式传输一样经过通道的重组器，跨报文的长度帧同样可以拼接；
- `join`/`leave` 在启动完成之前调用会以“not started”生命周期错误立即失败。
"#]

mod connection;
mod error;
mod server;

use std::net::{IpAddr, Ipv4Addr};

pub use error::UdpError;
pub use server::{DEFAULT_DATAGRAM_ADDRESS, DatagramServer};

/// 多播加入/离开时使用的本地接口。
///
/// IPv4 以接口地址标识，IPv6 以接口索引标识（0 表示由系统选择）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MulticastInterface {
    V4(Ipv4Addr),
    V6(u32),
}

impl MulticastInterface {
    /// 与 `group` 同族、由系统选择的接口。
    pub fn any_for(group: IpAddr) -> Self {
        match group {
            IpAddr::V4(_) => Self::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => Self::V6(0),
        }
    }

    fn matches(self, group: IpAddr) -> bool {
        matches!(
            (self, group),
            (Self::V4(_), IpAddr::V4(_)) | (Self::V6(_), IpAddr::V6(_))
        )
    }
}
