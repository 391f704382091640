//! # 测试桩
//!
//! - **意图（Why）**：通道语义（关闭幂等、写失败传播、空闲检测）应当脱离真实套接字验证；
//!   本模块提供一个记录调用的 [`NativeConnection`] 实现，供本 crate 与各传输 crate 的测试共用；
//! - **契约（What）**：所有操作同步完成；`fail_next_*` 只影响下一次调用。

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    channel::NativeConnection,
    error::{TransportError, ops},
    promise::Promise,
};

/// 记录写入与关闭次数的原生连接。
#[derive(Debug, Default)]
pub struct RecordingConnection {
    written: Mutex<Vec<Bytes>>,
    flushes: AtomicUsize,
    closes: AtomicUsize,
    next_write_error: Mutex<Option<io::ErrorKind>>,
    next_close_error: Mutex<bool>,
    remote: Option<SocketAddr>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_remote(remote: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            remote: Some(remote),
            ..Self::default()
        })
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub fn flush_calls(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        *self.next_write_error.lock() = Some(kind);
    }

    pub fn fail_next_close(&self) {
        *self.next_close_error.lock() = true;
    }
}

impl NativeConnection for RecordingConnection {
    fn write(&self, frame: Bytes, flush: bool, completion: Promise<()>) {
        if let Some(kind) = self.next_write_error.lock().take() {
            completion.fail(TransportError::io(ops::CHANNEL_WRITE, io::Error::from(kind)));
            return;
        }
        self.written.lock().push(frame);
        if flush {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        completion.complete(());
    }

    fn flush(&self, completion: Promise<()>) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        completion.complete(());
    }

    fn close(&self, completion: Promise<()>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut *self.next_close_error.lock()) {
            completion.fail(TransportError::io(
                ops::CHANNEL_CLOSE,
                io::Error::other("scripted close failure"),
            ));
            return;
        }
        completion.complete(());
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }
}
