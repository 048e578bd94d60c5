//! The port-mapping engine: public TCP/UDP listeners bridged onto tunnel
//! substreams.
//!
//! TCP is one substream per accepted connection, spliced until either side
//! ends. UDP keeps a per-peer flow table: the first datagram from a peer
//! allocates a substream, later datagrams reuse it, and a sweeper closes
//! flows that have gone quiet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wisp_tunnel::config::{AdvancedConfig, MappingSpec};
use wisp_tunnel::relay;
use wisp_tunnel::target::{Proto, TargetAddr};
use wisp_tunnel::{SessionPool, StreamGuard, StreamKind};

/// Datagrams queued per UDP flow while its substream is busy; overflow drops.
const UDP_FLOW_QUEUE: usize = 64;

/// Upper bound on the flow sweeper period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub fn parse_all(specs: &[String]) -> Result<Vec<MappingSpec>> {
    specs
        .iter()
        .map(|s| MappingSpec::parse(s).with_context(|| format!("Invalid mapping `{s}`")))
        .collect()
}

/// Serves one `"bind->target"` TCP mapping forever.
pub async fn run_tcp_mapping(
    pool: Arc<SessionPool>,
    spec: MappingSpec,
    advanced: AdvancedConfig,
) -> Result<()> {
    let listener = TcpListener::bind(&spec.bind)
        .await
        .with_context(|| format!("Failed to bind TCP mapping on {}", spec.bind))?;

    let target = TargetAddr::new(Proto::Tcp, spec.target.authority());

    tracing::info!(bind = %spec.bind, %target, "tcp mapping up");

    loop {
        let (conn, peer) = listener.accept().await.context("TCP mapping accept failed")?;
        conn.set_nodelay(true).ok();

        let pool = pool.clone();
        let target = target.clone();
        let max_streams = advanced.max_streams_per_session;

        tokio::spawn(async move {
            match pool.open_stream(StreamKind::Reverse, &target, max_streams).await {
                Ok((stream, guard)) => {
                    let _guard = guard;

                    match relay::splice(conn, stream).await {
                        Ok((up, down)) => {
                            tracing::trace!(%peer, bytes_up = up, bytes_down = down, "tcp flow done")
                        }
                        Err(e) => tracing::trace!(%peer, "tcp flow ended: {e}"),
                    }
                }
                // No session, no service: the user connection closes at once.
                Err(e) => tracing::debug!(%peer, "rejecting user connection: {e}"),
            }
        });
    }
}

struct UdpFlow {
    tx: mpsc::Sender<Bytes>,
    last_activity: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

/// Serves one `"bind->target"` UDP mapping forever.
pub async fn run_udp_mapping(
    pool: Arc<SessionPool>,
    spec: MappingSpec,
    advanced: AdvancedConfig,
) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(&spec.bind)
            .await
            .with_context(|| format!("Failed to bind UDP mapping on {}", spec.bind))?,
    );

    let target = TargetAddr::new(Proto::Udp, spec.target.authority());

    tracing::info!(bind = %spec.bind, %target, "udp mapping up");

    let flows: Arc<Mutex<HashMap<SocketAddr, UdpFlow>>> = Arc::default();
    let flows_total = Arc::new(AtomicU64::new(0));

    let sweeper = spawn_flow_sweeper(flows.clone(), advanced.udp_flow_timeout());

    let result = udp_recv_loop(&socket, &pool, &target, advanced, &flows, &flows_total).await;

    sweeper.abort();
    for (_, flow) in flows.lock().drain() {
        flow.task.abort();
    }

    result
}

async fn udp_recv_loop(
    socket: &Arc<UdpSocket>,
    pool: &Arc<SessionPool>,
    target: &TargetAddr,
    advanced: AdvancedConfig,
    flows: &Arc<Mutex<HashMap<SocketAddr, UdpFlow>>>,
    flows_total: &Arc<AtomicU64>,
) -> Result<()> {
    let mut buf = vec![0u8; advanced.udp_buffer_size.max(2048)];

    loop {
        let (n, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("UDP mapping receive failed")?;

        let datagram = Bytes::copy_from_slice(&buf[..n]);

        // Fast path: a known peer reuses its substream.
        let existing = {
            let flows = flows.lock();
            flows.get(&peer).map(|flow| {
                flow.last_activity.store(unix_now(), Ordering::Relaxed);
                flow.tx.clone()
            })
        };

        if let Some(tx) = existing {
            if tx.try_send(datagram).is_err() {
                // Queue full or flow just died; UDP is lossy by contract.
                tracing::trace!(%peer, "dropping datagram");
            }
            continue;
        }

        match pool
            .open_stream(StreamKind::Reverse, target, advanced.max_streams_per_session)
            .await
        {
            Ok((stream, guard)) => {
                let (tx, rx) = mpsc::channel(UDP_FLOW_QUEUE);
                let last_activity = Arc::new(AtomicU64::new(unix_now()));

                let task = tokio::spawn(run_udp_flow(
                    stream,
                    guard,
                    rx,
                    socket.clone(),
                    peer,
                    last_activity.clone(),
                ));

                let _ = tx.try_send(datagram);

                flows.lock().insert(
                    peer,
                    UdpFlow {
                        tx,
                        last_activity,
                        task,
                    },
                );

                let total = flows_total.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(%peer, udp_flows_total = total, "new udp flow");
            }
            Err(e) => tracing::debug!(%peer, "dropping datagram, no substream: {e}"),
        }
    }
}

/// Pumps one UDP peer's datagrams through its substream and back.
async fn run_udp_flow(
    mut stream: wisp_tunnel::StreamHandle,
    guard: StreamGuard,
    mut rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    last_activity: Arc<AtomicU64>,
) {
    let _guard = guard;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(datagram) = queued else {
                    break;
                };

                if stream.write_all(&datagram).await.is_err() {
                    break;
                }
                if stream.flush().await.is_err() {
                    break;
                }
            }
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        last_activity.store(unix_now(), Ordering::Relaxed);

                        if let Err(e) = socket.send_to(&buf[..n], peer).await {
                            tracing::trace!(%peer, "dropping return datagram: {e}");
                        }
                    }
                }
            }
        }
    }

    tracing::trace!(%peer, "udp flow closed");
}

fn spawn_flow_sweeper(
    flows: Arc<Mutex<HashMap<SocketAddr, UdpFlow>>>,
    flow_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = SWEEP_INTERVAL.min(flow_timeout).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let now = unix_now();
            let timeout_secs = flow_timeout.as_secs();

            flows.lock().retain(|peer, flow| {
                if flow.task.is_finished() {
                    return false;
                }

                let idle = now.saturating_sub(flow.last_activity.load(Ordering::Relaxed));
                if idle > timeout_secs {
                    tracing::debug!(%peer, idle, "closing idle udp flow");
                    flow.task.abort();
                    return false;
                }

                true
            });
        }
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
