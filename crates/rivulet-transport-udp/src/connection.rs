//! 数据报套接字的原生能力：写任务串行化发送，读任务把每个报文作为一个入站块交给通道。

use std::{net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rivulet_core::{
    Codec, CompletionGuard, InboundChunk, NativeConnection, NetChannel, Promise, TransportError,
    error::is_transient_io,
};
use tokio::{net::UdpSocket, sync::mpsc, task::AbortHandle};
use tracing::{debug, trace};

use crate::error::{RECEIVE, SEND, UdpError};

pub(crate) enum Command {
    Send {
        frame: Bytes,
        target: SocketAddr,
        completion: CompletionGuard<()>,
    },
    Close(CompletionGuard<()>),
}

/// 一个已绑定数据报套接字的原生能力。
///
/// 写入目标：显式 `send_to` 的地址；否则配置的默认远端；否则最近一个报文的发送方。
#[derive(Debug)]
pub(crate) struct DatagramConnection {
    commands: mpsc::UnboundedSender<Command>,
    local: SocketAddr,
    default_remote: Option<SocketAddr>,
    last_peer: Mutex<Option<SocketAddr>>,
}

impl DatagramConnection {
    pub(crate) fn send_frame_to(&self, frame: Bytes, target: SocketAddr, completion: Promise<()>) {
        let completion = CompletionGuard::new(completion, "send");
        if target.is_ipv4() != self.local.is_ipv4() {
            completion.fail(
                UdpError::TargetFamily {
                    target,
                    local: self.local,
                }
                .into_transport(SEND),
            );
            return;
        }
        let _ = self.commands.send(Command::Send {
            frame,
            target,
            completion,
        });
    }

    pub(crate) fn last_peer(&self) -> Option<SocketAddr> {
        *self.last_peer.lock()
    }

    fn observe_peer(&self, peer: SocketAddr) {
        *self.last_peer.lock() = Some(peer);
    }
}

impl NativeConnection for DatagramConnection {
    fn write(&self, frame: Bytes, _flush: bool, completion: Promise<()>) {
        match self.default_remote.or_else(|| self.last_peer()) {
            Some(target) => self.send_frame_to(frame, target, completion),
            None => {
                completion.fail(UdpError::NoPeer.into_transport(SEND));
            }
        }
    }

    fn flush(&self, completion: Promise<()>) {
        // 报文在 send_to 返回时已交给内核，没有用户态缓冲。
        completion.complete(());
    }

    fn close(&self, completion: Promise<()>) {
        if let Err(rejected) = self
            .commands
            .send(Command::Close(CompletionGuard::new(completion, "close")))
        {
            if let Command::Close(guard) = rejected.0 {
                guard.complete(());
            }
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.default_remote.or_else(|| self.last_peer())
    }

    fn describe(&self) -> String {
        format!("udp {}", self.local)
    }
}

/// 创建原生连接并返回写任务所需的队列接收端。
pub(crate) fn connection(
    local: SocketAddr,
    default_remote: Option<SocketAddr>,
) -> (Arc<DatagramConnection>, mpsc::UnboundedReceiver<Command>) {
    let (commands, queue) = mpsc::unbounded_channel();
    (
        Arc::new(DatagramConnection {
            commands,
            local,
            default_remote,
            last_peer: Mutex::new(None),
        }),
        queue,
    )
}

pub(crate) async fn read_loop<C: Codec>(
    socket: Arc<UdpSocket>,
    native: Arc<DatagramConnection>,
    channel: NetChannel<C>,
    max_datagram: usize,
) {
    let mut buf = vec![0u8; max_datagram.max(1)];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                trace!(channel = channel.id(), %peer, len, "datagram received");
                native.observe_peer(peer);
                channel.receive(InboundChunk::Bytes(BytesMut::from(&buf[..len])));
            }
            // ICMP 不可达会以复位的形式出现在下一次 recv 上，不影响后续报文。
            Err(err) if is_transient_io(&err) || err.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!(channel = channel.id(), error = %err, "ignoring transient datagram error");
            }
            Err(err) => {
                channel.fail(TransportError::io(RECEIVE, err));
                return;
            }
        }
    }
}

pub(crate) async fn write_loop(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::UnboundedReceiver<Command>,
    reader: AbortHandle,
) {
    while let Some(command) = queue.recv().await {
        match command {
            Command::Send {
                frame,
                target,
                completion,
            } => {
                let outcome = socket
                    .send_to(&frame, target)
                    .await
                    .map(|_| ())
                    .map_err(|err| TransportError::io(SEND, err));
                completion.resolve(outcome);
            }
            Command::Close(completion) => {
                reader.abort();
                queue.close();
                while let Ok(pending) = queue.try_recv() {
                    drop(pending);
                }
                completion.complete(());
                return;
            }
        }
    }
    reader.abort();
}
