//! A WebSocket client that stops reading must be disconnected rather than
//! buffered for.
//!
//! Serves the real router over TCP and performs the upgrade by hand, then
//! never reads from the socket again.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{admin_token, build_test_app_with, test_engine_config};
use serde_json::json;
use stormforge_events::{Event, EventKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

async fn open_monitor_socket(addr: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/v1/ws/monitor?token={} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        admin_token()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut status = [0u8; 12];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(&status, b"HTTP/1.1 101");
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_that_stops_reading_is_disconnected() {
    let mut engine = test_engine_config("/nonexistent/hping3");
    engine.subscriber_buffer = 8;
    let t = build_test_app_with(engine, None).await;
    let ws_manager = t.state.ws_manager.clone();
    let bus = t.orchestrator().bus().clone();
    let baseline_subscribers = bus.subscriber_count();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = t.router();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let mut client = open_monitor_socket(addr).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while ws_manager.connection_count().await == 0 {
        assert!(Instant::now() < deadline, "connection never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bus.subscriber_count(), baseline_subscribers + 1);

    // Large events fill the kernel socket buffers quickly; after that only
    // the bounded queues are left, and they must not grow.
    let padding = "x".repeat(16 * 1024);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if ws_manager.connection_count().await == 0
            && bus.subscriber_count() == baseline_subscribers
        {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "stalled client still connected after {} evictions",
            bus.evicted_count()
        );
        bus.publish(&Event::new(EventKind::SystemEvent).with_data(json!({ "padding": padding })));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // The server has dropped its end: draining the socket reaches EOF.
    let mut sink = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut sink)).await;
    assert!(drained.is_ok(), "server never closed the socket");

    server.abort();
}
