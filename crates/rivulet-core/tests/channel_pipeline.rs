//! 通道读写管线的跨组件行为：线程池 I/O 调度 + 长度前缀重组 + 事件投递 + 出站 sink。

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rivulet_core::{
    ChannelSettings, ChannelState, Codec, Environment, InboundChunk, LengthFieldCodec,
    SharedDispatcher, WorkerPoolDispatcher, test_stubs::RecordingConnection,
};

fn pool(name: &str) -> SharedDispatcher {
    Arc::new(WorkerPoolDispatcher::new(name, 2, 32).expect("线程池创建失败"))
}

#[tokio::test(flavor = "multi_thread")]
async fn pooled_reassembly_preserves_per_channel_order() {
    let env = Environment::current().unwrap();
    let settings = ChannelSettings::new(LengthFieldCodec::default(), &env)
        .with_io_dispatcher(pool("io"))
        .with_events_dispatcher(pool("events"));
    let channel = settings.open_channel(RecordingConnection::new());
    let mut inbound = channel.in_().subscribe_stream();

    let codec = LengthFieldCodec::default();
    let mut wire = Vec::new();
    for i in 0..100u32 {
        let payload = Bytes::from(i.to_be_bytes().repeat((i % 7 + 1) as usize));
        wire.extend_from_slice(&codec.encode(payload).unwrap());
    }
    for piece in wire.chunks(13) {
        channel.receive(InboundChunk::Bytes(BytesMut::from(piece)));
    }

    for i in 0..100u32 {
        let message = tokio::time::timeout(Duration::from_secs(5), inbound.next())
            .await
            .expect("等待入站消息超时")
            .unwrap()
            .unwrap();
        assert_eq!(&message[..4], &i.to_be_bytes(), "第 {i} 条消息乱序");
        assert_eq!(message.len(), 4 * (i % 7 + 1) as usize);
    }
    assert_eq!(channel.reassembly_stats().chunks, wire.chunks(13).count() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_sink_writes_flushes_and_closes() {
    let env = Environment::current().unwrap();
    let native = RecordingConnection::new();
    let channel = ChannelSettings::new(LengthFieldCodec::default(), &env).open_channel(native.clone());

    let mut out = channel.out();
    out.send(Bytes::from_static(b"one")).await.unwrap();
    out.send(Bytes::from_static(b"two")).await.unwrap();
    out.close().await.unwrap();

    let written = native.written();
    assert_eq!(written.len(), 2);
    assert_eq!(&written[0][4..], b"one");
    assert!(native.flush_calls() >= 2, "每次 send 之后 sink 都应刷出");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(native.close_calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn decode_failure_terminates_inbound_with_codec_error() {
    let env = Environment::current().unwrap();
    let channel = ChannelSettings::new(LengthFieldCodec::new(8), &env)
        .open_channel(RecordingConnection::new());
    let mut inbound = channel.in_().subscribe_stream();

    channel.receive(InboundChunk::Bytes(BytesMut::from(&[0u8, 0, 0, 64][..])));
    let err = inbound.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), "rivulet.codec.failed");
    assert!(inbound.next().await.is_none());
    channel
        .terminated()
        .await_timeout(Duration::from_secs(1))
        .unwrap();
}
