use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures::Sink;

use super::NetChannel;
use crate::{codec::Codec, error::TransportError, promise::Promise};

/// 通道的出站 sink。
///
/// - `start_send` 立即把值交给 [`NetChannel::send`]，不等待原生完成；
/// - `poll_flush` 等待最近一次写入完成后再请求原生刷出；
/// - `poll_close` 在刷出之后关闭通道。
pub struct ChannelSink<C: Codec> {
    channel: NetChannel<C>,
    last_write: Option<Promise<()>>,
    flushing: Option<Promise<()>>,
    closing: Option<Promise<()>>,
}

impl<C: Codec> ChannelSink<C> {
    pub(crate) fn new(channel: NetChannel<C>) -> Self {
        Self {
            channel,
            last_write: None,
            flushing: None,
            closing: None,
        }
    }

    /// 写入一个值并返回其完成 Promise，不经过 `Sink` 的就绪协议。
    pub fn accept(&self, message: C::Out) -> Promise<()> {
        self.channel.send(message)
    }

    pub fn channel(&self) -> &NetChannel<C> {
        &self.channel
    }
}

impl<C: Codec> Sink<C::Out> for ChannelSink<C> {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.channel.is_closing() {
            return Poll::Ready(Err(TransportError::closed("out")));
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: C::Out) -> Result<(), Self::Error> {
        let this = self.get_mut();
        this.last_write = Some(this.channel.send(item));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if let Some(write) = this.last_write.as_mut() {
            let outcome = ready!(Pin::new(write).poll(cx));
            this.last_write = None;
            outcome?;
            this.flushing = Some(this.channel.flush());
        }
        if let Some(flush) = this.flushing.as_mut() {
            let outcome = ready!(Pin::new(flush).poll(cx));
            this.flushing = None;
            return Poll::Ready(outcome);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        let closing = this.closing.get_or_insert_with(|| this.channel.close());
        Pin::new(closing).poll(cx)
    }
}
