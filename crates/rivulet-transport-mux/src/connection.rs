use std::sync::Arc;

use bytes::Bytes;
use rivulet_core::{NativeConnection, Promise};

use crate::{
    frame::Multipart,
    socket::{Identity, display_identity},
    worker::Worker,
};

/// 一个逻辑对端在共享套接字上的原生能力。
///
/// 写入经工作线程发出；路由模式下每个出站单元都以本对端的身份帧开头。
/// 关闭只结束逻辑通道，共享套接字与其他对端不受影响。
pub(crate) struct MuxConnection {
    identity: Identity,
    routing: bool,
    worker: Arc<Worker>,
}

impl MuxConnection {
    pub(crate) fn new(identity: Identity, routing: bool, worker: Arc<Worker>) -> Self {
        Self {
            identity,
            routing,
            worker,
        }
    }
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("identity", &display_identity(&self.identity))
            .field("routing", &self.routing)
            .finish()
    }
}

impl NativeConnection for MuxConnection {
    fn write(&self, frame: Bytes, _flush: bool, completion: Promise<()>) {
        let mut unit = Multipart::single(frame);
        if self.routing {
            unit.push_front(self.identity.clone());
        }
        self.worker.send(unit, completion);
    }

    fn flush(&self, completion: Promise<()>) {
        completion.complete(());
    }

    fn close(&self, completion: Promise<()>) {
        completion.complete(());
    }

    fn describe(&self) -> String {
        format!("mux peer {}", display_identity(&self.identity))
    }
}
