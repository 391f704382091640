//! 解复用器在内存套接字上的行为：身份隔离、身份前缀、关闭标记、单对端与停止。

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use rivulet_core::{ChannelSettings, Environment, LifecycleState, NetChannel, RawCodec};
use rivulet_transport_mux::{MemoryPeer, MemorySocket, Multipart, MuxServer, SocketKind};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

type Seen = Arc<Mutex<Vec<(u64, Bytes)>>>;
type Opened = Arc<Mutex<Vec<NetChannel<RawCodec>>>>;

fn echo_server(kind: SocketKind) -> (MuxServer<RawCodec>, MemoryPeer, Seen, Opened) {
    let env = Environment::current().unwrap();
    let (socket, peer) = MemorySocket::pair(kind);
    let server = MuxServer::with_socket(Box::new(socket), ChannelSettings::new(RawCodec, &env));
    let seen: Seen = Arc::default();
    let opened: Opened = Arc::default();
    let sink = Arc::clone(&seen);
    let registry = Arc::clone(&opened);
    server.on_channel(move |channel: NetChannel<RawCodec>| {
        registry.lock().push(channel.clone());
        let sink = Arc::clone(&sink);
        let replier = channel.clone();
        let id = channel.id();
        channel.in_().consume(move |payload: Bytes| {
            sink.lock().push((id, payload.clone()));
            replier.send(Bytes::from(payload.to_ascii_uppercase()));
        });
    });
    (server, peer, seen, opened)
}

fn routed(identity: &'static [u8], payload: &'static [u8]) -> Multipart {
    vec![Bytes::from_static(identity), Bytes::from_static(payload)].into()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待条件成立超时");
}

#[tokio::test(flavor = "multi_thread")]
async fn each_identity_gets_its_own_channel_and_prefixed_replies() {
    let (server, mut peer, seen, opened) = echo_server(SocketKind::Router);
    server.start().await.unwrap();

    peer.deliver(routed(b"\x00A", b"a1"));
    peer.deliver(routed(b"\x00B", b"b1"));
    peer.deliver(routed(b"\x00A", b"a2"));
    eventually(|| seen.lock().len() == 3).await;

    assert_eq!(opened.lock().len(), 2, "两个身份应各物化一个通道");
    assert_eq!(server.channel_count(), 2);
    let seen = seen.lock().clone();
    let first = seen[0].0;
    let for_a: Vec<_> = seen.iter().filter(|(id, _)| *id == first).map(|(_, p)| p.clone()).collect();
    assert_eq!(for_a, vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]);

    let mut replies = Vec::new();
    for _ in 0..3 {
        let unit = timeout(WAIT, peer.next_sent()).await.unwrap().unwrap();
        replies.push(unit.into_frames().into_iter().collect::<Vec<_>>());
    }
    replies.sort();
    assert_eq!(
        replies,
        vec![
            vec![Bytes::from_static(b"\x00A"), Bytes::from_static(b"A1")],
            vec![Bytes::from_static(b"\x00A"), Bytes::from_static(b"A2")],
            vec![Bytes::from_static(b"\x00B"), Bytes::from_static(b"B1")],
        ],
        "回复必须以目标身份帧开头"
    );
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn close_marker_and_disconnect_end_their_group_only() {
    let (server, peer, seen, opened) = echo_server(SocketKind::Router);
    server.start().await.unwrap();
    peer.deliver(routed(b"\x00A", b"x"));
    peer.deliver(routed(b"\x00B", b"y"));
    eventually(|| seen.lock().len() == 2).await;
    let channels = opened.lock().clone();

    peer.deliver(Multipart::single(Bytes::from_static(b"\x00A")));
    timeout(WAIT, channels[0].terminated()).await.unwrap().unwrap();
    eventually(|| server.channel_count() == 1).await;
    assert!(!channels[1].is_closing(), "关闭标记只影响自己的身份");

    peer.disconnect(Some(Bytes::from_static(b"\x00B")));
    timeout(WAIT, channels[1].terminated()).await.unwrap().unwrap();
    eventually(|| server.channel_count() == 0).await;

    peer.deliver(routed(b"\x00A", b"again"));
    eventually(|| opened.lock().len() == 3).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_closing_its_channel_keeps_worker_routing() {
    let env = Environment::current().unwrap();
    let (socket, peer) = MemorySocket::pair(SocketKind::Router);
    let server = MuxServer::with_socket(Box::new(socket), ChannelSettings::new(RawCodec, &env));
    let delivered: Arc<Mutex<Vec<Bytes>>> = Arc::default();
    let sink = Arc::clone(&delivered);
    server.on_channel(move |channel: NetChannel<RawCodec>| {
        let sink = Arc::clone(&sink);
        let closer = channel.clone();
        channel.in_().consume(move |payload: Bytes| {
            sink.lock().push(payload);
            closer.close();
        });
    });
    server.start().await.unwrap();

    peer.deliver(routed(b"\x00A", b"bye"));
    peer.deliver(routed(b"\x00B", b"hello"));
    eventually(|| delivered.lock().len() == 2).await;
    assert_eq!(
        *delivered.lock(),
        vec![Bytes::from_static(b"bye"), Bytes::from_static(b"hello")],
        "消费者在回调里关闭自己的通道后，其他身份仍应被投递"
    );
    eventually(|| server.channel_count() == 0).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_socket_uses_one_fixed_identity_without_prefix() {
    let (server, mut peer, seen, opened) = echo_server(SocketKind::Pair);
    server.start().await.unwrap();
    assert_eq!(server.kind(), SocketKind::Pair);

    peer.deliver(Multipart::single(Bytes::from_static(b"one")));
    peer.deliver(Multipart::single(Bytes::from_static(b"two")));
    eventually(|| seen.lock().len() == 2).await;
    assert_eq!(opened.lock().len(), 1, "单对端模式只有一个逻辑通道");

    let reply = timeout(WAIT, peer.next_sent()).await.unwrap().unwrap();
    assert_eq!(reply, Multipart::single(Bytes::from_static(b"ONE")), "单对端回复不带身份帧");

    peer.disconnect(None);
    let channel = opened.lock()[0].clone();
    timeout(WAIT, channel.terminated()).await.unwrap().unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_interrupts_blocking_receive_and_closes_channels() {
    let (server, mut peer, seen, opened) = echo_server(SocketKind::Router);
    assert!(server.shutdown().await.unwrap_err().is_invalid_state(), "未启动即关闭必须失败");

    server.start().await.unwrap();
    assert!(server.start().await.unwrap_err().is_invalid_state());
    peer.deliver(routed(b"\x00A", b"hi"));
    eventually(|| seen.lock().len() == 1).await;
    let _ = timeout(WAIT, peer.next_sent()).await.unwrap();

    timeout(WAIT, server.shutdown())
        .await
        .expect("关闭必须能唤醒阻塞中的接收")
        .unwrap();
    assert_eq!(server.state(), LifecycleState::Stopped);

    let channel = opened.lock()[0].clone();
    timeout(WAIT, channel.terminated()).await.unwrap().unwrap();
    let late = channel.send(Bytes::from_static(b"late")).await.unwrap_err();
    assert_eq!(late.code(), "rivulet.channel.closed");
    assert!(
        timeout(WAIT, peer.next_sent()).await.unwrap().is_none(),
        "工作线程退出后套接字应被释放"
    );
}
