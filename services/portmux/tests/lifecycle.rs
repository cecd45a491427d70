
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    closed_by_peer, make_route, sample_detector, wait_until, ProxyHandle, RecordMode,
    RecordingBackend, TcpEchoBackend, SAMPLE_MAGIC,
};
use portmux::{CloseReason, RouteTable, ShutdownPhase};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DETECT_TIMEOUT: Duration = Duration::from_millis(300);

#[tokio::test]
async fn destination_close_reaches_client() {
    let backend = RecordingBackend::spawn(RecordMode::CloseAfter(3)).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
    assert_eq!(backend.wait_for_bytes(0, 3).await, vec![0x01, 0x02, 0x03]);

    assert!(closed_by_peer(&mut client).await);

    drop(client);
    let server = &proxy.server;
    assert!(wait_until(|| server.live_sessions() == 0).await);
}

#[tokio::test]
async fn destination_close_frees_slot_while_client_stays_silent() {
    let backend = RecordingBackend::spawn(RecordMode::CloseAfter(2)).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn_with(routes, sample_detector(DETECT_TIMEOUT), |config| {
        config.idle_timeout = Some(Duration::from_secs(30));
        config.max_connections = 1;
    })
    .await
    .unwrap();

    // The client never writes again and never closes its end.
    let mut client = proxy.connect().await;
    client.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert_eq!(backend.wait_for_bytes(0, 2).await, SAMPLE_MAGIC.to_vec());

    let server = &proxy.server;
    assert!(wait_until(|| server.live_sessions() == 0).await);
    let stats = proxy.server.stats();
    assert_eq!(stats.close_count(CloseReason::Completed), 1);
    assert_eq!(stats.close_count(CloseReason::IdleTimeout), 0);
    assert!(closed_by_peer(&mut client).await);

    let mut next = proxy.connect().await;
    next.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert_eq!(backend.wait_for_bytes(1, 2).await, SAMPLE_MAGIC.to_vec());
    drop(client);
}

#[tokio::test]
async fn client_close_reaches_destination() {
    let backend = RecordingBackend::spawn(RecordMode::UntilEof).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert_eq!(backend.wait_for_bytes(0, 2).await, SAMPLE_MAGIC.to_vec());

    drop(client);

    let eofs = &backend.eof_count;
    assert!(wait_until(|| eofs.load(Ordering::Relaxed) == 1).await);

    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::Completed) == 1).await);
    let server = &proxy.server;
    assert!(wait_until(|| server.live_sessions() == 0).await);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.bytes_to_backend, 2);
    assert_eq!(snapshot.connections_active, 0);
}

#[tokio::test]
async fn client_close_frees_slot_while_destination_stays_open() {
    let backend = RecordingBackend::spawn(RecordMode::HoldAfterEof).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn_with(routes, sample_detector(DETECT_TIMEOUT), |config| {
        config.idle_timeout = Some(Duration::from_secs(30));
        config.max_connections = 1;
    })
    .await
    .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert_eq!(backend.wait_for_bytes(0, 2).await, SAMPLE_MAGIC.to_vec());
    drop(client);

    let eofs = &backend.eof_count;
    assert!(wait_until(|| eofs.load(Ordering::Relaxed) == 1).await);

    // The backend never closes, yet the session ends well before the idle timeout.
    let server = &proxy.server;
    assert!(wait_until(|| server.live_sessions() == 0).await);
    let stats = proxy.server.stats();
    assert_eq!(stats.close_count(CloseReason::Completed), 1);
    assert_eq!(stats.close_count(CloseReason::IdleTimeout), 0);
    assert!(backend.held_peer_closed(0).await);

    let mut next = proxy.connect().await;
    next.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert_eq!(backend.wait_for_bytes(1, 2).await, SAMPLE_MAGIC.to_vec());
    assert_eq!(stats.close_count(CloseReason::CapacityExceeded), 0);
}

#[tokio::test]
async fn idle_session_is_closed() {
    let backend = RecordingBackend::spawn(RecordMode::UntilEof).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn_with(routes, sample_detector(DETECT_TIMEOUT), |config| {
        config.idle_timeout = Some(Duration::from_millis(150))
    })
    .await
    .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&SAMPLE_MAGIC).await.unwrap();

    assert!(closed_by_peer(&mut client).await);
    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::IdleTimeout) == 1).await);
}

#[tokio::test]
async fn shutdown_lets_live_sessions_finish() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("http", backend.addr)].into_iter().collect();
    let mut proxy = ProxyHandle::spawn_with(routes, sample_detector(DETECT_TIMEOUT), |config| {
        config.shutdown_grace = Duration::from_secs(5)
    })
    .await
    .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 18];
    client.read_exact(&mut buf).await.unwrap();

    let server = proxy.server.clone();
    let shutdown = tokio::spawn(async move { server.shutdown().await });

    let server = &proxy.server;
    assert!(wait_until(|| server.phase() == ShutdownPhase::Draining).await);

    // New connections are no longer accepted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    match TcpStream::connect(proxy.listen_addr).await {
        Ok(mut late) => assert!(closed_by_peer(&mut late).await),
        Err(_) => {}
    }

    // The live session still works until the client ends it.
    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"ping");
    drop(client);

    tokio::time::timeout(Duration::from_secs(2), shutdown)
        .await
        .expect("shutdown should finish once the session ends")
        .unwrap();
    proxy.shutdown().await;

    assert!(!proxy.server.is_running());
    assert_eq!(proxy.server.phase(), ShutdownPhase::Stopped);
    assert_eq!(proxy.server.stats().close_count(CloseReason::Completed), 1);
    assert_eq!(proxy.server.stats().close_count(CloseReason::Shutdown), 0);
}

#[tokio::test]
async fn shutdown_force_closes_after_grace() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("http", backend.addr)].into_iter().collect();
    let mut proxy = ProxyHandle::spawn_with(routes, sample_detector(DETECT_TIMEOUT), |config| {
        config.shutdown_grace = Duration::from_millis(100)
    })
    .await
    .unwrap();

    let mut piping = proxy.connect().await;
    piping.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 18];
    piping.read_exact(&mut buf).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), proxy.shutdown())
        .await
        .expect("shutdown should force-close within the grace period");

    assert!(closed_by_peer(&mut piping).await);
    let stats = proxy.server.stats();
    assert_eq!(stats.close_count(CloseReason::Shutdown), 1);
    assert_eq!(proxy.server.live_sessions(), 0);
    assert!(!proxy.server.is_running());
}
