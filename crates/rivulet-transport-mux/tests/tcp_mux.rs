//! TCP 承载的多路复用服务端：多个客户端互相隔离、关闭标记、单对端模式与启动失败。

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use rivulet_core::{
    ChannelSettings, Environment, LifecycleState, NetChannel, RawCodec, ServerSocketOptions,
    SslOptions, TransportError,
};
use rivulet_transport_mux::{MuxClient, MuxServer, MuxSocketOptions, Multipart, SocketKind};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn upper_echo(server: &MuxServer<RawCodec>) {
    server.on_channel(|channel: NetChannel<RawCodec>| {
        let replier = channel.clone();
        channel.in_().consume(move |payload: Bytes| {
            replier.send_and_flush(Bytes::from(payload.to_ascii_uppercase()));
        });
    });
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待条件成立超时");
}

async fn recv_single(client: &mut MuxClient) -> Bytes {
    let unit = timeout(WAIT, client.recv())
        .await
        .expect("等待回复超时")
        .unwrap()
        .expect("服务端不应提前断开");
    assert_eq!(unit.len(), 1, "身份帧不应出现在客户端收到的单元里");
    unit.into_frames().pop_front().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn router_keeps_clients_isolated() {
    let env = Environment::current().unwrap();
    let server = MuxServer::new(any_port(), ChannelSettings::new(RawCodec, &env));
    upper_echo(&server);
    server.start().await.unwrap();
    let address = server.local_addr().expect("启动后应能取得监听地址");

    let mut left = MuxClient::connect(address).await.unwrap();
    let mut right = MuxClient::connect(address).await.unwrap();
    left.send(Bytes::from_static(b"alpha")).await.unwrap();
    right.send(Bytes::from_static(b"beta")).await.unwrap();
    left.send(Bytes::from_static(b"gamma")).await.unwrap();

    assert_eq!(recv_single(&mut right).await, Bytes::from_static(b"BETA"));
    assert_eq!(recv_single(&mut left).await, Bytes::from_static(b"ALPHA"));
    assert_eq!(recv_single(&mut left).await, Bytes::from_static(b"GAMMA"));
    assert_eq!(server.channel_count(), 2);

    left.send_close_marker().await.unwrap();
    eventually(|| server.channel_count() == 1).await;

    drop(right);
    eventually(|| server.channel_count() == 0).await;

    server.shutdown().await.unwrap();
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_frame_unit_is_delivered_frame_by_frame() {
    let env = Environment::current().unwrap();
    let server = MuxServer::new(any_port(), ChannelSettings::new(RawCodec, &env));
    upper_echo(&server);
    server.start().await.unwrap();

    let mut client = MuxClient::connect(server.local_addr().unwrap()).await.unwrap();
    let unit: Multipart = vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")].into();
    client.send(unit).await.unwrap();
    assert_eq!(recv_single(&mut client).await, Bytes::from_static(b"ONE"));
    assert_eq!(recv_single(&mut client).await, Bytes::from_static(b"TWO"));

    client.close().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_mode_serves_a_single_peer() {
    let env = Environment::current().unwrap();
    let server = MuxServer::with_options(
        any_port(),
        ChannelSettings::new(RawCodec, &env),
        ServerSocketOptions::default(),
        MuxSocketOptions::default().with_kind(SocketKind::Pair).with_io_threads(2),
        None,
    );
    upper_echo(&server);
    server.start().await.unwrap();

    let mut client = MuxClient::connect(server.local_addr().unwrap()).await.unwrap();
    client.send(Bytes::from_static(b"solo")).await.unwrap();
    assert_eq!(recv_single(&mut client).await, Bytes::from_static(b"SOLO"));
    assert_eq!(server.channel_count(), 1);

    drop(client);
    eventually(|| server.channel_count() == 0).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_disconnects_clients() {
    let env = Environment::current().unwrap();
    let server = MuxServer::new(any_port(), ChannelSettings::new(RawCodec, &env));
    upper_echo(&server);
    server.start().await.unwrap();

    let mut client = MuxClient::connect(server.local_addr().unwrap()).await.unwrap();
    client.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(recv_single(&mut client).await, Bytes::from_static(b"PING"));

    timeout(WAIT, server.shutdown()).await.unwrap().unwrap();
    let after = timeout(WAIT, client.recv()).await.expect("客户端应感知到断开");
    assert!(matches!(after, Ok(None) | Err(_)));
    assert_eq!(server.channel_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_failures_leave_server_restartable() {
    let env = Environment::current().unwrap();
    let tls = MuxServer::with_options(
        any_port(),
        ChannelSettings::new(RawCodec, &env),
        ServerSocketOptions::default(),
        MuxSocketOptions::default(),
        Some(SslOptions::new().with_certificate("/tmp/cert.pem")),
    );
    assert!(matches!(tls.start().await.unwrap_err(), TransportError::Unsupported(_)));
    assert_eq!(tls.state(), LifecycleState::Idle);

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = occupied.local_addr().unwrap();
    let server = MuxServer::with_options(
        any_port(),
        ChannelSettings::new(RawCodec, &env),
        ServerSocketOptions::default().with_reuse_addr(false),
        MuxSocketOptions::default().with_listen_address(address),
        None,
    );
    let err = server.start().await.unwrap_err();
    assert_eq!(err.code(), "rivulet.transport.mux.bind_failed");
    assert_eq!(server.state(), LifecycleState::Idle);

    drop(occupied);
    server.start().await.unwrap();
    assert_eq!(server.local_addr(), Some(address), "监听地址覆盖应生效");
    server.shutdown().await.unwrap();
}
