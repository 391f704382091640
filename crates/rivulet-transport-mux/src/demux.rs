//! # 解复用器：按身份把共享套接字拆成逻辑通道
//!
//! ## 意图（Why）
//! - 工作线程只负责“收单元、打身份标签”；每个身份对应一个 [`NetChannel`]，
//!   应用看到的是与流式传输相同的通道模型。
//!
//! ## 逻辑（How）
//! - 订阅工作线程的广播序列（同步投递，运行在工作线程上，因此按到达顺序处理）；
//! - 身份第一次出现时物化通道：构造原生连接、运行初始化钩子、登记、通知“新通道”回调；
//!   之后该身份的单元逐帧交给通道的 `receive`；
//! - 空单元或对端断开结束该身份的分组并关闭通道；广播序列完成时关闭全部通道，
//!   以错误终止时让全部通道以该错误失败。
//!
//! ## 契约（What）
//! - 先到先得：同一身份在通道关闭之前只会物化一次；
//! - 通道关闭后该身份再出现时会物化一个新通道。

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use rivulet_core::{
    ChannelCallbacks, ChannelSettings, Codec, InboundChunk, NetChannel, TransportError,
};
use tracing::{debug, trace};

use crate::{
    connection::MuxConnection,
    frame::Multipart,
    socket::{Identity, display_identity},
    worker::{Signal, Tagged, Worker},
};

pub(crate) type ChannelRegistry<C> = Arc<DashMap<Identity, NetChannel<C>>>;

pub(crate) struct Demultiplexer<C: Codec> {
    settings: ChannelSettings<C>,
    callbacks: Arc<ChannelCallbacks<C>>,
    worker: Arc<Worker>,
    routing: bool,
    channels: ChannelRegistry<C>,
}

impl<C: Codec> Demultiplexer<C> {
    pub(crate) fn new(
        settings: ChannelSettings<C>,
        callbacks: Arc<ChannelCallbacks<C>>,
        worker: Arc<Worker>,
        routing: bool,
        channels: ChannelRegistry<C>,
    ) -> Self {
        Self {
            settings,
            callbacks,
            worker,
            routing,
            channels,
        }
    }

    pub(crate) fn route(&self, tagged: Tagged) {
        let Tagged { identity, signal } = tagged;
        match signal {
            Signal::Unit(unit) if unit.is_empty() => self.end(&identity, "close marker"),
            Signal::Unit(unit) => self.deliver(identity, unit),
            Signal::End => self.end(&identity, "peer disconnected"),
        }
    }

    /// 广播序列完成：关闭全部通道。
    pub(crate) fn close_all(&self) {
        for channel in self.snapshot() {
            channel.close();
        }
    }

    /// 广播序列以错误终止：全部通道以该错误失败。
    pub(crate) fn fail_all(&self, error: TransportError) {
        for channel in self.snapshot() {
            channel.fail(error.clone());
        }
    }

    fn deliver(&self, identity: Identity, unit: Multipart) {
        let existing = self
            .channels
            .get(&identity)
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closing());
        let channel = match existing {
            Some(channel) => channel,
            None => self.materialize(identity.clone()),
        };
        trace!(channel = channel.id(), frames = unit.len(), "mux unit routed");
        for frame in unit {
            channel.receive(InboundChunk::Bytes(BytesMut::from(&frame[..])));
        }
    }

    fn materialize(&self, identity: Identity) -> NetChannel<C> {
        let native = Arc::new(MuxConnection::new(
            identity.clone(),
            self.routing,
            Arc::clone(&self.worker),
        ));
        let channel = self.settings.open_channel(native);
        let id = channel.id();
        self.channels.insert(identity.clone(), channel.clone());
        let registry = Arc::clone(&self.channels);
        let key = identity.clone();
        channel.on_close(move || {
            registry.remove_if(&key, |_, current| current.id() == id);
        });
        debug!(channel = id, identity = %display_identity(&identity), "mux channel materialized");
        self.callbacks.announce(&channel);
        channel
    }

    fn end(&self, identity: &Identity, reason: &'static str) {
        if let Some((_, channel)) = self.channels.remove(identity) {
            debug!(channel = channel.id(), identity = %display_identity(identity), reason, "mux group ended");
            channel.close();
        }
    }

    fn snapshot(&self) -> Vec<NetChannel<C>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
