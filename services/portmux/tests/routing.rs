
use std::time::Duration;

use harness::{
    closed_by_peer, make_route, sample_detector, wait_until, ProxyHandle, RecordMode,
    RecordingBackend, TcpEchoBackend, SAMPLE_MAGIC,
};
use portmux::{CloseReason, RouteTable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DETECT_TIMEOUT: Duration = Duration::from_millis(300);

#[tokio::test]
async fn sample_protocol_bytes_arrive_exactly_and_in_order() {
    let backend = RecordingBackend::spawn(RecordMode::UntilEof).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client
        .write_all(&[SAMPLE_MAGIC[0], SAMPLE_MAGIC[1], 0x03, 0x04])
        .await
        .unwrap();

    let first = backend.wait_for_bytes(0, 4).await;
    assert_eq!(first, vec![0x01, 0x02, 0x03, 0x04]);

    client.write_all(b"later bytes").await.unwrap();
    let all = backend.wait_for_bytes(0, 4 + 11).await;
    assert_eq!(&all[..4], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&all[4..], b"later bytes");
    assert_eq!(backend.connection_count(), 1);

    drop(client);
    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::Completed) == 1).await);
    assert_eq!(stats.protocol_count("sample-proto"), 1);
}

#[tokio::test]
async fn magic_split_across_writes_is_still_detected() {
    let backend = RecordingBackend::spawn(RecordMode::UntilEof).await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&[0x01]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.write_all(&[0x02, 0x03]).await.unwrap();

    assert_eq!(backend.wait_for_bytes(0, 3).await, vec![0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn websocket_upgrade_wins_over_http() {
    let http_backend = TcpEchoBackend::spawn().await.unwrap();
    let ws_backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![
        make_route("http", http_backend.addr),
        make_route("websocket", ws_backend.addr),
    ]
    .into_iter()
    .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let upgrade: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let mut ws_client = proxy.connect().await;
    ws_client.write_all(upgrade).await.unwrap();
    let mut echoed = vec![0u8; upgrade.len()];
    ws_client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, upgrade);

    let request: &[u8] = b"GET /health HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut http_client = proxy.connect().await;
    http_client.write_all(request).await.unwrap();
    let mut echoed = vec![0u8; request.len()];
    http_client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, request);

    assert_eq!(ws_backend.connection_count(), 1);
    assert_eq!(http_backend.connection_count(), 1);
}

#[tokio::test]
async fn route_lookup_ignores_case() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("HTTP", backend.addr)].into_iter().collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(b"HEAD / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"HEAD ");
}

#[tokio::test]
async fn unknown_protocol_closes_without_dialing() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("http", backend.addr)].into_iter().collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    assert!(closed_by_peer(&mut client).await);

    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::UnknownProtocol) == 1).await);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn silent_client_times_out_detection() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("http", backend.addr)].into_iter().collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(Duration::from_millis(100)))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    assert!(closed_by_peer(&mut client).await);

    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::DetectionTimeout) == 1).await);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn detected_protocol_without_route_closes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let routes: RouteTable = vec![make_route("sample-proto", backend.addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    assert!(closed_by_peer(&mut client).await);

    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::NoRouteForProtocol) == 1).await);
    assert_eq!(stats.protocol_count("http"), 1);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unreachable_endpoint_closes_client() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let routes: RouteTable = vec![make_route("sample-proto", dead_addr)]
        .into_iter()
        .collect();
    let proxy = ProxyHandle::spawn(routes, sample_detector(DETECT_TIMEOUT))
        .await
        .unwrap();

    let mut client = proxy.connect().await;
    client.write_all(&SAMPLE_MAGIC).await.unwrap();
    assert!(closed_by_peer(&mut client).await);

    let stats = proxy.server.stats();
    assert!(wait_until(|| stats.close_count(CloseReason::EndpointUnreachable) == 1).await);
}

#[tokio::test]
async fn fallback_protocol_routes_unknown_traffic() {
    let backend = RecordingBackend::spawn(RecordMode::UntilEof).await.unwrap();
    let routes: RouteTable = vec![make_route("raw", backend.addr)].into_iter().collect();
    let detector = sample_detector(DETECT_TIMEOUT).with_fallback("raw");
    let proxy = ProxyHandle::spawn(routes, detector).await.unwrap();

    let mut client = proxy.connect().await;
    client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

    assert_eq!(
        backend.wait_for_bytes(0, 21).await,
        b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()
    );
    assert_eq!(proxy.server.stats().protocol_count("raw"), 1);
}
