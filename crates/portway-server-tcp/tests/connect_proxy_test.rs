/// End-to-end tests for the CONNECT proxy
///
/// Each test runs a real proxy on a loopback port with an echo server as the
/// upstream, and follows the lifecycle events through a broadcast observer.
use portway_core::{BroadcastObserver, ServerEvent, ServerObserver, StartError};
use portway_server_tcp::{TcpProxyServer, TcpProxyServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("portway=debug,portway_core=trace,portway_server_tcp=trace")
        .with_test_writer()
        .try_init();
}

/// Spawn an upstream that echoes everything back until the peer closes
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

fn start_proxy() -> (TcpProxyServer, SocketAddr, broadcast::Receiver<ServerEvent>) {
    init_tracing();
    let events = Arc::new(BroadcastObserver::new(256));
    let event_rx = events.subscribe();
    let observer: Arc<dyn ServerObserver> = events;

    let server = TcpProxyServer::new(
        TcpProxyServerConfig {
            address: Some(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        },
        Some(observer),
    );
    let addr = server.start().unwrap();
    (server, addr, event_rx)
}

async fn next_event(event_rx: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, event_rx.recv())
        .await
        .expect("timed out waiting for a server event")
        .expect("event channel closed")
}

/// Read a response head, byte by byte so no tunnelled bytes are consumed
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = stream.read_u8().await.unwrap();
        head.push(byte);
    }
    String::from_utf8(head).unwrap()
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 200"),
        "unexpected CONNECT response: {:?}",
        head
    );
    client
}

async fn assert_echo(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_connect_round_trip_and_prune() {
    let upstream = spawn_echo_server().await;
    let (server, proxy, mut event_rx) = start_proxy();

    assert!(matches!(next_event(&mut event_rx).await, ServerEvent::Started { .. }));

    let mut client = open_tunnel(proxy, upstream).await;
    assert_echo(&mut client, b"ping").await;

    let accepted = next_event(&mut event_rx).await;
    let tunnel_id = match &accepted {
        ServerEvent::NewSocketAccepted {
            tunnel_id,
            protocol,
            target,
            peer_addr,
            ..
        } => {
            assert_eq!(protocol, "http-connect");
            assert_eq!(target.as_deref(), Some(upstream.to_string().as_str()));
            assert_eq!(*peer_addr, Some(client.local_addr().unwrap()));
            *tunnel_id
        }
        other => panic!("expected NewSocketAccepted, got {:?}", other),
    };
    assert!(server.core().contains(&tunnel_id));
    assert_eq!(server.tunnels().len(), 1);

    // Client hangs up, the echo server follows, and the tunnel winds down
    client.shutdown().await.unwrap();
    drop(client);

    let closed = next_event(&mut event_rx).await;
    assert_eq!(closed.tunnel_id(), Some(tunnel_id));
    assert!(matches!(closed, ServerEvent::TunnelClosed { .. }));

    assert!(server.wait_drained(EVENT_TIMEOUT).await);
    assert_eq!(server.core().tunnel_count(), 0);

    assert_eq!(server.stop(), 0);
    assert!(matches!(next_event(&mut event_rx).await, ServerEvent::Stopped { .. }));
}

#[tokio::test]
async fn test_stop_force_closes_open_tunnels() {
    let upstream = spawn_echo_server().await;
    let (server, proxy, mut event_rx) = start_proxy();

    let mut first = open_tunnel(proxy, upstream).await;
    let mut second = open_tunnel(proxy, upstream).await;
    assert_echo(&mut first, b"one").await;
    assert_echo(&mut second, b"two").await;
    assert_eq!(server.core().tunnel_count(), 2);

    assert_eq!(server.stop(), 2);

    // Both clients see the relay go away
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(EVENT_TIMEOUT, first.read(&mut buf)).await;
    assert_eq!(read.unwrap().unwrap(), 0);
    let read = tokio::time::timeout(EVENT_TIMEOUT, second.read(&mut buf)).await;
    assert_eq!(read.unwrap().unwrap(), 0);

    assert!(server.wait_drained(EVENT_TIMEOUT).await);

    let mut kinds = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        kinds.push(match event {
            ServerEvent::Started { .. } => "started",
            ServerEvent::Stopped { .. } => "stopped",
            ServerEvent::NewSocketAccepted { .. } => "accepted",
            ServerEvent::TunnelClosed { .. } => "closed",
        });
    }
    assert_eq!(kinds.iter().filter(|k| **k == "accepted").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "closed").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "stopped").count(), 1);
    assert_eq!(kinds[0], "started");
}

#[tokio::test]
async fn test_wrong_method_is_rejected_without_tunnel() {
    let (server, proxy, mut event_rx) = start_proxy();
    assert!(matches!(next_event(&mut event_rx).await, ServerEvent::Started { .. }));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 405"), "got {:?}", response);
    assert!(response.contains("Allow: CONNECT"));

    assert_eq!(server.core().tunnel_count(), 0);
    assert!(event_rx.try_recv().is_err());
    server.stop();
}

#[tokio::test]
async fn test_unreachable_upstream_reports_bad_gateway() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = unused.local_addr().unwrap();
    drop(unused);

    let (server, proxy, mut event_rx) = start_proxy();
    assert!(matches!(next_event(&mut event_rx).await, ServerEvent::Started { .. }));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 502"));

    let accepted = next_event(&mut event_rx).await;
    let closed = next_event(&mut event_rx).await;
    assert!(matches!(accepted, ServerEvent::NewSocketAccepted { .. }));
    assert!(matches!(closed, ServerEvent::TunnelClosed { .. }));
    assert_eq!(accepted.tunnel_id(), closed.tunnel_id());

    assert!(server.wait_drained(EVENT_TIMEOUT).await);
    server.stop();
}

#[tokio::test]
async fn test_bind_conflict_returns_bind_error() {
    init_tracing();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let events = Arc::new(BroadcastObserver::new(16));
    let mut event_rx = events.subscribe();
    let observer: Arc<dyn ServerObserver> = events;

    let server = TcpProxyServer::new(
        TcpProxyServerConfig {
            address: Some(Ipv4Addr::LOCALHOST),
            port,
            ..Default::default()
        },
        Some(observer),
    );

    match server.start() {
        Err(StartError::Bind {
            address,
            port: failed_port,
            ..
        }) => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(failed_port, port);
        }
        other => panic!("expected a bind error, got {:?}", other),
    }

    assert!(event_rx.try_recv().is_err());
    assert_eq!(server.local_addr(), None);
}

#[tokio::test]
async fn test_bytes_pipelined_after_connect_are_forwarded() {
    let upstream = spawn_echo_server().await;
    let (server, proxy, _event_rx) = start_proxy();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nhello", upstream).as_bytes())
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    let mut echoed = [0u8; 5];
    tokio::time::timeout(EVENT_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello");

    server.stop();
    assert!(server.wait_drained(EVENT_TIMEOUT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_handshakes_leaves_no_open_tunnel() {
    let upstream = spawn_echo_server().await;

    for cycle in 0..100u32 {
        let (server, proxy, mut event_rx) = start_proxy();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", upstream).as_bytes())
            .await
            .unwrap();

        // Vary how far the handshake gets before stop()
        for _ in 0..(cycle % 64) * 50 {
            std::hint::spin_loop();
        }
        server.stop();

        // Whatever stage the connection reached, the proxy side goes away
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(EVENT_TIMEOUT, client.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "cycle {}: tunnel kept relaying after stop", cycle);

        assert!(
            server.wait_drained(EVENT_TIMEOUT).await,
            "cycle {}: {:?} still registered",
            cycle,
            server.tunnels()
        );

        let (mut accepted, mut closed) = (0, 0);
        while let Ok(event) = event_rx.try_recv() {
            match event {
                ServerEvent::NewSocketAccepted { .. } => accepted += 1,
                ServerEvent::TunnelClosed { .. } => closed += 1,
                _ => {}
            }
        }
        assert_eq!(accepted, closed, "cycle {}", cycle);
    }
}
