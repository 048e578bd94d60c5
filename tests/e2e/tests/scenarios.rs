//! Full-system scenarios: a real edge and a real origin over loopback, with
//! timers shortened where the defaults would make tests crawl.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use wisp_edge::EdgeServer;
use wisp_origin::OriginClient;
use wisp_tunnel::config::{Config, Mode, PathConfig};
use wisp_tunnel::TargetAddr;

const PSK: &str = "e2e shared secret";

fn init() {
    rustls::crypto::ring::default_provider().install_default().ok();
    wisp_logging::test_global("wisp_tunnel=debug,wisp_edge=debug,wisp_origin=debug,info");
}

/// Reserves a loopback port. Racy in principle, fine in practice for tests.
async fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn edge_config(listen: &[SocketAddr], tcp_forward: Vec<String>, udp_forward: Vec<String>) -> Config {
    let mut config = Config {
        mode: Mode::Server,
        psk: PSK.to_owned(),
        ..Default::default()
    };

    config.listen_ports = listen.iter().map(|a| a.to_string()).collect();
    config.forward.tcp = tcp_forward;
    config.forward.udp = udp_forward;
    config.advanced.cleanup_interval = 1;
    config.advanced.udp_flow_timeout = 2;
    config.stealth.conn_jitter_ms = 10;
    config.stealth.fake_traffic = false;
    config.mux.keepalive = 5;
    config.stealth.keepalive_jitter = 0;

    config
}

fn origin_config(edges: &[SocketAddr], pool: usize) -> Config {
    let mut config = Config {
        mode: Mode::Client,
        psk: PSK.to_owned(),
        ..Default::default()
    };

    config.paths = edges
        .iter()
        .map(|addr| PathConfig {
            addr: addr.to_string(),
            connection_pool: pool,
            retry_interval: 1,
            dial_timeout: 5,
            ..Default::default()
        })
        .collect();
    config.advanced.cleanup_interval = 1;
    config.stealth.conn_jitter_ms = 10;
    config.mux.keepalive = 5;
    config.stealth.keepalive_jitter = 0;

    config
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Mapped listeners come up asynchronously with the rest of the edge; retry
/// briefly instead of racing them.
async fn connect_mapped(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    panic!("mapped port {addr} never came up")
}

async fn await_sessions(edge: &Arc<EdgeServer>, want: usize) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while edge.pool().count() < want {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("edge never reached {want} session(s)"));
}

#[tokio::test]
async fn smoke_tcp_relay() {
    init();

    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let mapped_port = free_port().await;

    let edge = Arc::new(
        EdgeServer::new(edge_config(
            &[tunnel_port],
            vec![format!("{mapped_port}->{echo}")],
            vec![],
        ))
        .unwrap(),
    );
    tokio::spawn(edge.clone().run());

    let origin = Arc::new(OriginClient::new(origin_config(&[tunnel_port], 1)).unwrap());
    tokio::spawn(origin.run());

    await_sessions(&edge, 1).await;

    let mut user = connect_mapped(mapped_port).await;
    user.write_all(b"hello").await.unwrap();

    let mut buf = vec![0u8; 5];
    user.read_exact(&mut buf).await.unwrap();

    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn burst_split_survives_the_full_stack() {
    init();

    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let mapped_port = free_port().await;

    let mut edge_cfg = edge_config(&[tunnel_port], vec![format!("{mapped_port}->{echo}")], vec![]);
    edge_cfg.stealth.burst_split = true;
    edge_cfg.stealth.max_burst_size = 1024;

    let mut origin_cfg = origin_config(&[tunnel_port], 1);
    origin_cfg.stealth.burst_split = true;
    origin_cfg.stealth.max_burst_size = 1024;

    let edge = Arc::new(EdgeServer::new(edge_cfg).unwrap());
    tokio::spawn(edge.clone().run());

    let origin = Arc::new(OriginClient::new(origin_cfg).unwrap());
    tokio::spawn(origin.run());

    await_sessions(&edge, 1).await;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    let mut user = connect_mapped(mapped_port).await;
    user.write_all(&payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    user.read_exact(&mut received).await.unwrap();

    assert_eq!(received, payload);
}

#[tokio::test]
async fn origin_forward_stream_is_dialed_by_the_edge() {
    init();

    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;

    let edge = Arc::new(EdgeServer::new(edge_config(&[tunnel_port], vec![], vec![])).unwrap());
    tokio::spawn(edge.clone().run());

    let origin = Arc::new(OriginClient::new(origin_config(&[tunnel_port], 1)).unwrap());
    tokio::spawn(origin.clone().run());

    await_sessions(&edge, 1).await;

    // The origin's own pool must hold the session before it can open streams.
    tokio::time::timeout(Duration::from_secs(15), async {
        while origin.pool().count() < 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("origin pool never populated");

    let target = TargetAddr::parse(&format!("tcp://{echo}")).unwrap();

    let (mut stream, _guard) = origin.open_stream(&target).await.unwrap();

    stream.write_all(b"forward ping").await.unwrap();
    stream.flush().await.unwrap();

    let mut buf = vec![0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"forward ping");
}

#[tokio::test]
async fn dpi_probe_gets_the_decoy() {
    init();

    let tunnel_port = free_port().await;

    let edge = Arc::new(EdgeServer::new(edge_config(&[tunnel_port], vec![], vec![])).unwrap());
    tokio::spawn(edge.clone().run());

    // Give the listener a moment to come up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut probe = TcpStream::connect(tunnel_port).await.unwrap();
    probe
        .write_all(b"GET / HTTP/1.1\r\nHost: attacker.local\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), probe.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                response.extend_from_slice(&buf[..n]);
                if response.windows(4).any(|w| w == b"\r\n\r\n") && response.len() > 200 {
                    break;
                }
            }
            Ok(Err(_)) => break,
        }
    }

    let response = String::from_utf8_lossy(&response);

    assert!(response.contains("404"), "got: {response}");
    assert!(response.contains("nginx/1.24.0"), "got: {response}");
    assert_eq!(edge.pool().count(), 0, "no session may result from a probe");
}

#[tokio::test]
async fn udp_relay_reallocates_after_idle_timeout() {
    init();

    let echo = spawn_udp_echo().await;
    let tunnel_port = free_port().await;

    // UDP mappings reuse the TCP port-reservation trick for a free port.
    let mapped_port = free_port().await;

    let edge = Arc::new(
        EdgeServer::new(edge_config(
            &[tunnel_port],
            vec![],
            vec![format!("{mapped_port}->{echo}")],
        ))
        .unwrap(),
    );
    tokio::spawn(edge.clone().run());

    let origin = Arc::new(OriginClient::new(origin_config(&[tunnel_port], 1)).unwrap());
    tokio::spawn(origin.run());

    await_sessions(&edge, 1).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(mapped_port).await.unwrap();

    let payload = vec![0x5A; 512];
    let mut buf = vec![0u8; 2048];

    // First exchange allocates a flow. UDP gives no delivery guarantee, so
    // retry the first datagram until the reply arrives.
    let n = request_udp_echo(&client, &payload, &mut buf).await;
    assert_eq!(&buf[..n], payload.as_slice());

    // Outlive udp_flow_timeout (2 s) plus a sweep period.
    tokio::time::sleep(Duration::from_secs(5)).await;

    // A fresh packet must be served by a newly allocated flow.
    let n = request_udp_echo(&client, &payload, &mut buf).await;
    assert_eq!(&buf[..n], payload.as_slice());
}

async fn request_udp_echo(client: &UdpSocket, payload: &[u8], buf: &mut [u8]) -> usize {
    for _ in 0..20 {
        // The mapping socket may not be up yet; refused sends just retry.
        if client.send(payload).await.is_err() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        match tokio::time::timeout(Duration::from_secs(1), client.recv(buf)).await {
            Ok(Ok(n)) => return n,
            _ => continue,
        }
    }

    panic!("no UDP echo after 20 attempts")
}

#[tokio::test]
async fn killed_session_is_evicted_and_replaced() {
    init();

    let tunnel_port = free_port().await;

    let edge = Arc::new(EdgeServer::new(edge_config(&[tunnel_port], vec![], vec![])).unwrap());
    tokio::spawn(edge.clone().run());

    let origin = Arc::new(OriginClient::new(origin_config(&[tunnel_port], 2)).unwrap());
    tokio::spawn(origin.clone().run());

    await_sessions(&edge, 2).await;

    // Kill one session from the edge side.
    let victim = edge.pool().snapshot().into_iter().next().unwrap();
    victim.session().close().await;

    // Within one cleanup interval it disappears...
    tokio::time::timeout(Duration::from_secs(5), async {
        while edge
            .pool()
            .snapshot()
            .iter()
            .any(|e| Arc::ptr_eq(e, &victim))
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("killed session must be evicted");

    // ...and the origin worker dials a replacement.
    await_sessions(&edge, 2).await;
}

#[tokio::test]
async fn multi_port_edge_balances_streams_round_robin() {
    init();

    let echo = spawn_tcp_echo().await;
    let port_a = free_port().await;
    let port_b = free_port().await;
    let mapped_port = free_port().await;

    let edge = Arc::new(
        EdgeServer::new(edge_config(
            &[port_a, port_b],
            vec![format!("{mapped_port}->{echo}")],
            vec![],
        ))
        .unwrap(),
    );
    tokio::spawn(edge.clone().run());

    // One origin worker per edge port.
    let origin = Arc::new(OriginClient::new(origin_config(&[port_a, port_b], 1)).unwrap());
    tokio::spawn(origin.run());

    await_sessions(&edge, 2).await;

    // Hold ten mapped connections open and check the per-session spread.
    let mut users = Vec::new();
    for _ in 0..10 {
        let mut user = connect_mapped(mapped_port).await;
        user.write_all(b"ping").await.unwrap();

        let mut buf = vec![0u8; 4];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        users.push(user);
    }

    let spread: Vec<usize> = edge
        .pool()
        .snapshot()
        .iter()
        .map(|e| e.active_streams())
        .collect();

    assert_eq!(spread.len(), 2);
    assert_eq!(spread.iter().sum::<usize>(), 10);
    assert_eq!(spread, vec![5, 5], "round-robin must balance evenly");

    drop(users);
}
