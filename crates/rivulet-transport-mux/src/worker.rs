//! # 专属工作线程
//!
//! ## 意图（Why）
//! - 多帧套接字不允许并发访问，收发都必须发生在同一个线程上；
//! - 应用线程的写入因此只能排队，再唤醒阻塞在 `recv` 上的工作线程去执行。
//!
//! ## 逻辑（How）
//! - 循环：先排空命令队列（发送、停止），再阻塞接收一个事件；
//! - 入站单元在此提取身份（路由模式弹出首帧，单对端模式使用固定身份），
//!   打上身份标签后发布到共享的广播序列；对端断开发布为该身份的结束信号；
//! - 停止时未执行的发送以“关闭中”失败，广播序列正常完成，随后释放套接字。

use std::{
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use rivulet_core::{Broadcaster, CompletionGuard, Promise, TransportError};
use tracing::{debug, error, info, warn};

use crate::{
    error::WORKER,
    frame::Multipart,
    socket::{Identity, Interrupter, MultipartSocket, SocketEvent},
};

/// 带身份标签的入站信号。
#[derive(Clone, Debug)]
pub(crate) struct Tagged {
    pub(crate) identity: Identity,
    pub(crate) signal: Signal,
}

#[derive(Clone, Debug)]
pub(crate) enum Signal {
    /// 已去掉身份帧的内容单元；为空时表示显式关闭。
    Unit(Multipart),
    /// 对端断开。
    End,
}

enum Command {
    Send {
        unit: Multipart,
        completion: CompletionGuard<()>,
    },
    Shutdown,
}

/// 工作线程句柄；发送与停止可以从任意线程调用。
pub(crate) struct Worker {
    name: String,
    commands: Sender<Command>,
    interrupter: Interrupter,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// 尚未启动的工作线程所需的命令接收端。
pub(crate) struct Pending {
    queue: Receiver<Command>,
}

impl Worker {
    pub(crate) fn new(name: impl Into<String>, interrupter: Interrupter) -> (Self, Pending) {
        let (commands, queue) = mpsc::channel();
        (
            Self {
                name: name.into(),
                commands,
                interrupter,
                thread: Mutex::new(None),
            },
            Pending { queue },
        )
    }

    /// 启动线程；调用前应完成对 `fanout` 的订阅，否则可能错过首批单元。
    pub(crate) fn start(
        &self,
        pending: Pending,
        socket: Box<dyn MultipartSocket>,
        fixed: Identity,
        fanout: Broadcaster<Tagged>,
    ) -> Result<(), TransportError> {
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-mux-worker", self.name))
            .spawn(move || run(name, socket, pending.queue, fixed, fanout))
            .map_err(|err| TransportError::io(WORKER, err))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// 排队一个出站单元；工作线程已退出时 `completion` 以关闭失败。
    pub(crate) fn send(&self, unit: Multipart, completion: Promise<()>) {
        let command = Command::Send {
            unit,
            completion: CompletionGuard::new(completion, "send"),
        };
        if self.commands.send(command).is_ok() {
            self.interrupter.interrupt();
        }
    }

    /// 请求停止并等待线程退出；幂等。
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        self.interrupter.interrupt();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(worker = %self.name, "mux worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    name: String,
    mut socket: Box<dyn MultipartSocket>,
    queue: Receiver<Command>,
    fixed: Identity,
    fanout: Broadcaster<Tagged>,
) {
    let routing = socket.kind().routes_by_identity();
    info!(worker = %name, kind = ?socket.kind(), "mux worker started");
    'worker: loop {
        loop {
            match queue.try_recv() {
                Ok(Command::Send { unit, completion }) => {
                    completion.resolve(socket.send(unit));
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break 'worker,
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.recv() {
            Ok(SocketEvent::Message(mut unit)) => {
                let identity = if routing {
                    match unit.pop_front() {
                        Some(identity) => identity,
                        None => {
                            warn!(worker = %name, "dropping routed unit without identity frame");
                            continue;
                        }
                    }
                } else {
                    fixed.clone()
                };
                fanout.emit(Tagged {
                    identity,
                    signal: Signal::Unit(unit),
                });
            }
            Ok(SocketEvent::Disconnected(identity)) => {
                fanout.emit(Tagged {
                    identity: identity.unwrap_or_else(|| fixed.clone()),
                    signal: Signal::End,
                });
            }
            Ok(SocketEvent::Interrupted) => {}
            Err(err) => {
                warn!(worker = %name, code = err.code(), %err, "mux socket failed, worker exiting");
                fanout.error(err);
                drain(&queue);
                return;
            }
        }
    }
    let abandoned = drain(&queue);
    if abandoned > 0 {
        debug!(worker = %name, abandoned, "pending sends failed at shutdown");
    }
    fanout.complete();
    drop(socket);
    info!(worker = %name, "mux worker stopped");
}

/// 丢弃剩余命令；发送的完成守卫因此以关闭失败。
fn drain(queue: &Receiver<Command>) -> usize {
    let mut count = 0;
    while let Ok(command) = queue.try_recv() {
        if let Command::Send { completion, .. } = command {
            drop(completion);
            count += 1;
        }
    }
    count
}
