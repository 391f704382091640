use std::net::SocketAddr;

use bytes::BytesMut;
use rivulet_core::{TransportError, error::ops};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    error::{CONNECT, RECEIVE, SEND},
    frame::{DEFAULT_MAX_FRAME, Multipart, MultipartDecoder},
};

const READ_CHUNK: usize = 8 * 1024;

/// 异步的 dealer 式对端：连接到 [`crate::MuxServer`]，以多帧单元收发。
///
/// 不携带身份帧；路由模式下服务端会为每条连接分配身份。发送空单元即显式关闭本对端的逻辑通道。
#[derive(Debug)]
pub struct MuxClient {
    stream: TcpStream,
    buffer: BytesMut,
    decoder: MultipartDecoder,
    peer: SocketAddr,
}

impl MuxClient {
    pub async fn connect(address: SocketAddr) -> Result<Self, TransportError> {
        Self::connect_with_limit(address, DEFAULT_MAX_FRAME).await
    }

    pub async fn connect_with_limit(
        address: SocketAddr,
        max_frame: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| TransportError::io(CONNECT, err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| TransportError::io(CONNECT, err))?;
        debug!(%address, "mux client connected");
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            decoder: MultipartDecoder::new(max_frame),
            peer: address,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, unit: impl Into<Multipart>) -> Result<(), TransportError> {
        let bytes = unit.into().to_bytes();
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|err| TransportError::io(SEND, err))
    }

    /// 发送空单元，请求服务端关闭本对端的逻辑通道。
    pub async fn send_close_marker(&mut self) -> Result<(), TransportError> {
        self.send(Multipart::new()).await
    }

    /// 接收下一个单元；服务端断开时返回 `None`。
    pub async fn recv(&mut self) -> Result<Option<Multipart>, TransportError> {
        loop {
            if let Some(unit) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(unit));
            }
            self.buffer.reserve(READ_CHUNK);
            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|err| TransportError::io(RECEIVE, err))?;
            if read == 0 {
                return Ok(None);
            }
        }
    }

    /// 半关闭写方向后释放连接。
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.stream
            .shutdown()
            .await
            .map_err(|err| TransportError::io(ops::CHANNEL_CLOSE, err))
    }
}
