//! # 单条 TCP 连接的原生驱动
//!
//! ## 意图（Why）
//! - [`NetChannel`] 只认识 [`NativeConnection`]；本模块把一条 Tokio `TcpStream` 拆成读写两半，
//!   分别由独立任务驱动，向通道交付入站块、执行出站命令；
//! - 写入来自任意线程，经无界命令队列串行化，保证原生写顺序与提交顺序一致。
//!
//! ## 逻辑（How）
//! - 读任务循环 `read_buf`，每次把已读字节 `split` 成独立块交给 [`NetChannel::receive`]；
//!   读到 EOF 时关闭通道，读失败时以 [`READ`] 错误终止通道；
//! - 写任务持有 `BufWriter`，按序执行 `Write`/`Flush`/`Close`；`Close` 刷出并半关闭写端、
//!   中止读任务，随后把仍在队列中的命令以“关闭期间中止”失败。
//!
//! ## 注意事项（Trade-offs）
//! - 未要求 flush 的写在写入用户态缓冲后即视为完成，对端是否收到取决于后续 flush 或关闭；
//! - 命令携带 [`CompletionGuard`]，即使写任务被运行时中止，在途 Promise 也会失败而不是挂起。

use std::{net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use rivulet_core::{
    ChannelCallbacks, ChannelSettings, Codec, CompletionGuard, InboundChunk, NativeConnection,
    NetChannel, Promise, ServerSocketOptions, TransportError,
};
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, trace};

use crate::error::{CONFIGURE, FLUSH, READ, WRITE};

enum Command {
    Write {
        frame: Bytes,
        flush: bool,
        completion: CompletionGuard<()>,
    },
    Flush(CompletionGuard<()>),
    Close(CompletionGuard<()>),
}

/// 一条 TCP 连接的原生能力。
#[derive(Debug)]
pub(crate) struct TcpConnection {
    commands: mpsc::UnboundedSender<Command>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl TcpConnection {
    fn submit(&self, command: Command) {
        // 写任务已退出时命令随发送失败被丢弃，守卫负责以 Closed 解析。
        let _ = self.commands.send(command);
    }
}

impl NativeConnection for TcpConnection {
    fn write(&self, frame: Bytes, flush: bool, completion: Promise<()>) {
        self.submit(Command::Write {
            frame,
            flush,
            completion: CompletionGuard::new(completion, "write"),
        });
    }

    fn flush(&self, completion: Promise<()>) {
        self.submit(Command::Flush(CompletionGuard::new(completion, "flush")));
    }

    fn close(&self, completion: Promise<()>) {
        if let Err(rejected) = self.commands.send(Command::Close(CompletionGuard::new(completion, "close"))) {
            // 写任务已结束，套接字随之释放，关闭视为完成。
            if let Command::Close(guard) = rejected.0 {
                guard.complete(());
            }
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn describe(&self) -> String {
        format!("tcp {} -> {}", self.local, self.peer)
    }
}

/// 为已建立的流配置套接字选项、创建通道、通知回调，然后启动读写任务。
pub(crate) fn attach<C: Codec>(
    stream: TcpStream,
    settings: &ChannelSettings<C>,
    options: &ServerSocketOptions,
    callbacks: &ChannelCallbacks<C>,
) -> Result<NetChannel<C>, TransportError> {
    stream
        .set_nodelay(options.tcp_no_delay())
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    options
        .apply(&SockRef::from(&stream))
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    let peer = stream
        .peer_addr()
        .map_err(|err| TransportError::io(CONFIGURE, err))?;
    let local = stream
        .local_addr()
        .map_err(|err| TransportError::io(CONFIGURE, err))?;

    let (read_half, write_half) = stream.into_split();
    let (commands, queue) = mpsc::unbounded_channel();
    let native = Arc::new(TcpConnection {
        commands,
        peer,
        local,
    });
    let channel = settings.open_channel(native);
    callbacks.announce(&channel);

    let runtime = settings.runtime();
    let reader = runtime.spawn(read_loop(
        read_half,
        channel.clone(),
        options.read_chunk_size(),
    ));
    runtime.spawn(write_loop(write_half, queue, reader.abort_handle()));
    debug!(channel = channel.id(), %peer, %local, "tcp connection attached");
    Ok(channel)
}

async fn read_loop<C: Codec>(mut reader: OwnedReadHalf, channel: NetChannel<C>, chunk: usize) {
    let mut buf = BytesMut::with_capacity(chunk);
    loop {
        buf.reserve(chunk);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(channel = channel.id(), "peer closed the stream");
                channel.close();
                return;
            }
            Ok(read) => {
                trace!(channel = channel.id(), read, "tcp chunk received");
                channel.receive(InboundChunk::Bytes(buf.split()));
            }
            Err(err) => {
                channel.fail(TransportError::io(READ, err));
                return;
            }
        }
    }
}

async fn write_loop(
    writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Command>,
    reader: AbortHandle,
) {
    let mut writer = BufWriter::new(writer);
    while let Some(command) = queue.recv().await {
        match command {
            Command::Write {
                frame,
                flush,
                completion,
            } => {
                let mut outcome = writer
                    .write_all(&frame)
                    .await
                    .map_err(|err| TransportError::io(WRITE, err));
                if outcome.is_ok() && flush {
                    outcome = writer
                        .flush()
                        .await
                        .map_err(|err| TransportError::io(FLUSH, err));
                }
                completion.resolve(outcome);
            }
            Command::Flush(completion) => {
                completion.resolve(
                    writer
                        .flush()
                        .await
                        .map_err(|err| TransportError::io(FLUSH, err)),
                );
            }
            Command::Close(completion) => {
                if let Err(err) = writer.flush().await {
                    debug!(error = %err, "flush before close failed");
                }
                if let Err(err) = writer.shutdown().await {
                    debug!(error = %err, "tcp shutdown failed, releasing socket anyway");
                }
                reader.abort();
                queue.close();
                while let Ok(pending) = queue.try_recv() {
                    drop(pending);
                }
                drop(writer);
                completion.complete(());
                return;
            }
        }
    }
    reader.abort();
}
