//! Liveness: silent peers are dropped after the time to live, chatty ones are not.

use futures_util::SinkExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use socket_link::protocol::Inbound;
use socket_link::{default_factory, Connection, EchoHandler, Server};

mod common;
use common::*;

#[tokio::test]
async fn test_silent_server_disconnects_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let codec = default_codec();
    let mut settings = fast_settings();
    settings.connection.ttl_secs = 2;

    let client = Connection::connect(&addr, &settings).await.unwrap();
    assert_eq!(client.time_to_live(), Duration::from_secs(2));

    let (stream, _) = listener.accept().await.unwrap();
    let mut peer = Framed::new(stream, LengthDelimitedCodec::new());
    assert_eq!(next_event(&mut peer, &codec).await, Some(Inbound::Hello));
    peer.send(codec.encode_server_ready().unwrap()).await.unwrap();
    let started = Instant::now();

    // The raw peer never pings back.
    assert!(wait_until(Duration::from_secs(5), || !client.is_connected()).await);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_pings_keep_both_ends_alive() {
    let mut settings = fast_settings();
    settings.connection.ttl_secs = 2;
    let server = Server::bind(0, default_factory::<EchoHandler>(), &settings)
        .await
        .unwrap();
    let client = Connection::connect(&addr_of(&server), &settings).await.unwrap();
    within(client.write("warm up")).await.unwrap();
    within(client.read()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(client.is_connected());
    assert_eq!(server.active_connections(), 1);
    within(client.write("still alive")).await.unwrap();
    assert_eq!(within(client.read()).await.unwrap(), "still alive");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_drops_silent_client() {
    let probe = Arc::new(Probe::default());
    let mut settings = fast_settings();
    settings.connection.ttl_secs = 2;
    let server = Server::bind(0, capturing_factory(probe.clone()), &settings)
        .await
        .unwrap();
    let codec = default_codec();

    let mut peer = raw_connect(&addr_of(&server)).await;
    raw_handshake(&mut peer, &codec).await;
    assert_eq!(server.active_connections(), 1);

    assert!(wait_until(Duration::from_secs(6), || server.active_connections() == 0).await);
    assert!(!probe.connection(0).is_connected());
    assert!(closed_by_peer(&mut peer, &codec).await);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silence_before_handshake_is_also_dropped() {
    let probe = Arc::new(Probe::default());
    let mut settings = fast_settings();
    settings.connection.ttl_secs = 2;
    let server = Server::bind(0, capturing_factory(probe.clone()), &settings)
        .await
        .unwrap();

    // Connects but never says hello.
    let _peer = raw_connect(&addr_of(&server)).await;
    assert!(wait_until(Duration::from_secs(5), || probe.connection_count() == 1).await);

    assert!(wait_until(Duration::from_secs(6), || server.active_connections() == 0).await);
    assert!(!probe.connection(0).is_ready());

    server.shutdown().await.unwrap();
}
