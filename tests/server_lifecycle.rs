//! Server status transitions, registry bookkeeping and teardown.

use std::sync::Arc;
use std::time::Duration;

use socket_link::net::ConnectionError;
use socket_link::server::{factory_fn, HandlerFactoryError};
use socket_link::{default_factory, Connection, EchoHandler, Server, ServerError, ServerStatus};

mod common;
use common::*;

async fn echo_server() -> Server {
    Server::bind(0, default_factory::<EchoHandler>(), &fast_settings())
        .await
        .unwrap()
}

async fn echo_once(addr: &str) {
    let client = Connection::connect(addr, &fast_settings()).await.unwrap();
    within(client.write("ping?")).await.unwrap();
    assert_eq!(within(client.read()).await.unwrap(), "ping?");
    client.shutdown();
}

#[tokio::test]
async fn test_close_then_open_accepts_again() {
    let server = echo_server().await;
    let addr = addr_of(&server);
    assert_eq!(server.status(), ServerStatus::Running);
    echo_once(&addr).await;

    server.close().await.unwrap();
    assert_eq!(server.status(), ServerStatus::Closed);
    assert!(server.local_addr().is_none());
    assert!(matches!(
        Connection::connect(&addr, &fast_settings()).await,
        Err(ConnectionError::FailedToConnect { .. })
    ));

    server.open().await.unwrap();
    assert_eq!(server.status(), ServerStatus::Running);
    assert_eq!(server.local_addr().map(|a| a.port()), Some(server.port()));
    echo_once(&addr).await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_close_or_open_fails() {
    let server = echo_server().await;

    assert!(matches!(server.open().await, Err(ServerError::ServerAlreadyOpened)));
    server.close().await.unwrap();
    assert!(matches!(server.close().await, Err(ServerError::ServerAlreadyClosed)));
    server.open().await.unwrap();
    assert!(matches!(server.open().await, Err(ServerError::ServerAlreadyOpened)));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shut_down_server_rejects_everything() {
    let server = echo_server().await;
    server.shutdown().await.unwrap();

    assert_eq!(server.status(), ServerStatus::ShutDown);
    assert!(matches!(server.shutdown().await, Err(ServerError::ServerShutdown)));
    assert!(matches!(server.close().await, Err(ServerError::ServerShutdown)));
    assert!(matches!(server.open().await, Err(ServerError::ServerShutdown)));
    assert!(matches!(server.start(), Err(ServerError::ServerShutdown)));
}

#[tokio::test]
async fn test_closed_server_can_shut_down() {
    let server = echo_server().await;
    server.close().await.unwrap();
    server.shutdown().await.unwrap();
    assert_eq!(server.status(), ServerStatus::ShutDown);
}

#[tokio::test]
async fn test_existing_connections_survive_close() {
    let server = echo_server().await;
    let client = Connection::connect(&addr_of(&server), &fast_settings()).await.unwrap();
    within(client.write("before")).await.unwrap();
    assert_eq!(within(client.read()).await.unwrap(), "before");

    server.close().await.unwrap();

    within(client.write("after")).await.unwrap();
    assert_eq!(within(client.read()).await.unwrap(), "after");
    assert_eq!(server.active_connections(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_start() {
    let mut settings = fast_settings();
    settings.server.manual_start = true;
    let server = Server::bind(0, default_factory::<EchoHandler>(), &settings)
        .await
        .unwrap();
    assert_eq!(server.status(), ServerStatus::WaitingLaunch);

    server.start().unwrap();
    server.start().unwrap();
    assert_eq!(server.status(), ServerStatus::Running);
    echo_once(&addr_of(&server)).await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_never_started_server_shuts_down() {
    let mut settings = fast_settings();
    settings.server.manual_start = true;
    let server = Server::bind(0, default_factory::<EchoHandler>(), &settings)
        .await
        .unwrap();

    server.shutdown().await.unwrap();
    assert_eq!(server.status(), ServerStatus::ShutDown);
}

#[tokio::test]
async fn test_factory_faults_surface_at_bind() {
    let settings = fast_settings();

    let failing = factory_fn::<EchoHandler, _>(|| Err(HandlerFactoryError::NoDefaultConstructor));
    assert!(matches!(
        Server::bind(0, failing, &settings).await,
        Err(ServerError::Handler(HandlerFactoryError::NoDefaultConstructor))
    ));

    let panicking = factory_fn::<EchoHandler, _>(|| panic!("boom"));
    assert!(matches!(
        Server::bind(0, panicking, &settings).await,
        Err(ServerError::Handler(HandlerFactoryError::ConstructorFailed(message))) if message == "boom"
    ));
}

#[tokio::test]
async fn test_port_conflict_is_a_bind_error() {
    let first = echo_server().await;
    let taken = first.port();
    assert!(matches!(
        Server::bind(taken, default_factory::<EchoHandler>(), &fast_settings()).await,
        Err(ServerError::Bind(_))
    ));
    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_double_shutdown_deregisters_once() {
    let probe = Arc::new(Probe::default());
    let server = Server::bind(0, capturing_factory(probe.clone()), &fast_settings())
        .await
        .unwrap();
    let codec = default_codec();

    let mut first = raw_connect(&addr_of(&server)).await;
    let mut second = raw_connect(&addr_of(&server)).await;
    raw_handshake(&mut first, &codec).await;
    raw_handshake(&mut second, &codec).await;
    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 2).await);

    let connection = probe.connection(0);
    connection.shutdown();
    connection.shutdown();

    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.active_connections(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_connections_track_concurrent_churn() {
    let server = echo_server().await;
    let addr = addr_of(&server);

    let mut clients = Vec::new();
    for _ in 0..10 {
        let addr = addr.clone();
        clients.push(tokio::spawn(async move {
            let client = Connection::connect(&addr, &fast_settings()).await.unwrap();
            within(client.write("hello")).await.unwrap();
            within(client.read()).await.unwrap();
            client
        }));
    }
    let mut connected = Vec::new();
    for client in clients {
        connected.push(client.await.unwrap());
    }
    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 10).await);

    for client in connected.drain(..5) {
        client.shutdown();
    }
    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 5).await);

    for _ in 0..3 {
        echo_once(&addr).await;
    }
    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 5).await);

    server.shutdown().await.unwrap();
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_shutdown_tears_down_every_connection() {
    let probe = Arc::new(Probe::default());
    let server = Server::bind(0, capturing_factory(probe.clone()), &fast_settings())
        .await
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(Connection::connect(&addr_of(&server), &fast_settings()).await.unwrap());
    }
    assert!(wait_until(Duration::from_secs(5), || server.active_connections() == 3).await);

    server.shutdown().await.unwrap();

    assert_eq!(probe.shutdown_count(), 3);
    assert_eq!(server.active_connections(), 0);
    for client in &clients {
        assert!(wait_until(Duration::from_secs(5), || !client.is_connected()).await);
    }
}

#[tokio::test]
async fn test_dropping_server_shuts_it_down() {
    let server = echo_server().await;
    let client = Connection::connect(&addr_of(&server), &fast_settings()).await.unwrap();
    within(client.write("x")).await.unwrap();
    within(client.read()).await.unwrap();

    drop(server);

    assert!(wait_until(Duration::from_secs(5), || !client.is_connected()).await);
}
