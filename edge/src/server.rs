//! The edge tunnel server.
//!
//! Every configured listener speaks plain HTTP (optionally behind TLS) and
//! answers the decoy page unless a request passes the mimicry checks. Valid
//! upgrades are hijacked from the HTTP layer, wrapped in the framed crypto
//! channel, multiplexed, and registered in the session pool shared by all
//! listeners. From then on the socket carries raw packets only; a framing or
//! decryption failure closes it without ever emitting HTTP again.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use wisp_tunnel::config::{Config, Mode, TlsConfig};
use wisp_tunnel::fake::spawn_fake_traffic;
use wisp_tunnel::handshake::{self, DECOY_BODY, DECOY_SERVER};
use wisp_tunnel::mux::session_config;
use wisp_tunnel::netopt;
use wisp_tunnel::relay;
use wisp_tunnel::{
    FramedStream, Io, MuxSession, ObfsPolicies, PacketCrypto, SessionPool, StreamGuard,
};

use crate::mappings;

/// Timeout for dials the edge performs on behalf of forward substreams.
const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes that never finish their request get cut off.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EdgeServer {
    config: Config,
    pool: Arc<SessionPool>,
    tls: Option<TlsAcceptor>,
}

impl EdgeServer {
    pub fn new(config: Config) -> Result<Self> {
        debug_assert_eq!(config.mode, Mode::Server);

        let tls = config
            .tls
            .as_ref()
            .map(tls_acceptor)
            .transpose()
            .context("Failed to load TLS identity")?;

        Ok(Self {
            config,
            pool: SessionPool::new(),
            tls,
        })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Binds all listeners and mappings and serves until one of them fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tasks = JoinSet::new();

        let health = self
            .pool
            .spawn_health_monitor(self.config.advanced.cleanup_interval());

        for bind in self.config.listeners() {
            let listener = TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind tunnel listener on {bind}"))?;

            tracing::info!(%bind, "tunnel listener up");

            let server = self.clone();
            tasks.spawn(async move { server.accept_loop(listener).await });
        }

        for spec in mappings::parse_all(&self.config.forward.tcp)? {
            let pool = self.pool.clone();
            let advanced = self.config.advanced;
            tasks.spawn(async move { mappings::run_tcp_mapping(pool, spec, advanced).await });
        }

        for spec in mappings::parse_all(&self.config.forward.udp)? {
            let pool = self.pool.clone();
            let advanced = self.config.advanced;
            tasks.spawn(async move { mappings::run_udp_mapping(pool, spec, advanced).await });
        }

        let result = match tasks.join_next().await {
            Some(joined) => joined.context("task panicked")?,
            None => Ok(()),
        };

        health.abort();
        tasks.shutdown().await;

        result
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("tunnel listener failed")?;

            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, peer).await {
                    tracing::debug!(%peer, "connection ended: {e:#}");
                }
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = netopt::tune_stream(&stream, &self.config.advanced) {
            tracing::debug!(%peer, "failed to tune tunnel socket: {e}");
        }

        let io: Box<dyn Io> = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .context("TLS accept failed")?,
            ),
            None => Box::new(stream),
        };

        let server = self.clone();

        hyper::server::conn::http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(
                TokioIo::new(io),
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, peer).await }
                }),
            )
            .with_upgrades()
            .await
            .context("http connection failed")?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if !handshake::is_tunnel_upgrade(&req, &self.config.mimic) {
            tracing::debug!(%peer, path = %req.uri().path(), "serving decoy");
            return Ok(decoy_response());
        }

        if self.pool.count() >= self.config.advanced.max_connections {
            tracing::warn!(%peer, "session limit reached; serving decoy");
            return Ok(decoy_response());
        }

        let upgrade = hyper::upgrade::on(req);
        let server = self.clone();

        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => server.run_session(upgraded, peer).await,
                Err(e) => tracing::debug!(%peer, "upgrade never completed: {e}"),
            }
        });

        Ok(switching_protocols())
    }

    /// Runs one tunnel session on a hijacked connection until it dies.
    async fn run_session(self: Arc<Self>, upgraded: hyper::upgrade::Upgraded, peer: SocketAddr) {
        let policies = ObfsPolicies::from_config(&self.config.obfs, &self.config.stealth);
        let crypto = PacketCrypto::new(&self.config.psk, policies.padding);

        let framed = FramedStream::new(TokioIo::new(upgraded), crypto, policies);
        let (session, mut incoming) = MuxSession::new_server(
            framed,
            session_config(&self.config.mux, &self.config.stealth),
        );

        let entry = self.pool.add(session, peer.to_string());

        tracing::info!(%peer, sessions = self.pool.count(), "tunnel session established");

        let fake = self.config.stealth.fake_traffic.then(|| {
            spawn_fake_traffic(entry.clone(), self.config.stealth.fake_traffic_interval)
        });

        while let Some(stream) = incoming.recv().await {
            let guard = StreamGuard::new(entry.clone());

            tokio::spawn(async move {
                let _guard = guard;

                if let Err(e) = relay::dispatch_inbound(stream, TARGET_DIAL_TIMEOUT).await {
                    tracing::debug!("substream ended: {e}");
                }
            });
        }

        if let Some(fake) = fake {
            fake.abort();
        }

        self.pool.remove(&entry);
        entry.session().close().await;

        tracing::info!(%peer, sessions = self.pool.count(), "tunnel session closed");
    }
}

fn switching_protocols() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header(
            http::header::SEC_WEBSOCKET_ACCEPT,
            handshake::websocket_accept_value(),
        )
        .body(Full::new(Bytes::new()))
        .expect("static response must build")
}

/// The one response every rejected request receives.
fn decoy_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(http::header::SERVER, DECOY_SERVER)
        .header(http::header::CONTENT_TYPE, "text/html")
        .body(Full::new(Bytes::from_static(DECOY_BODY.as_bytes())))
        .expect("static response must build")
}

fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&tls.cert).with_context(|| format!("Failed to open {}", tls.cert))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("Failed to parse certificate chain")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&tls.key).with_context(|| format!("Failed to open {}", tls.key))?,
    ))
    .context("Failed to parse private key")?
    .context("No private key found")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS identity")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
