//! The origin tunnel client.
//!
//! Every pool slot runs the same loop: dial, camouflage handshake, crypto
//! channel, mux session, then accept substreams until the session dies. A
//! session that dies young counts as a quick failure; enough quick failures
//! on one path rotate the worker to the next configured path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use rand::rngs::OsRng;
use rand::Rng as _;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

use wisp_tunnel::config::{Config, Mode, PathConfig, Transport};
use wisp_tunnel::fragment::Fragmented;
use wisp_tunnel::handshake::{self, HandshakeError};
use wisp_tunnel::mux::session_config;
use wisp_tunnel::netopt;
use wisp_tunnel::pool::{OpenError, StreamGuard};
use wisp_tunnel::relay;
use wisp_tunnel::{
    FramedStream, Io, MuxSession, ObfsPolicies, PacketCrypto, SessionPool, StreamHandle,
    StreamKind, TargetAddr,
};

/// Sessions that lived at least this long died of natural causes; their death
/// resets the failure counter.
const LONG_LIVED: Duration = Duration::from_secs(30);

/// Quick failures on one path before the worker rotates to the next.
const MAX_FAILS_BEFORE_SWITCH: u32 = 3;

/// Ceiling for the backoff between retries.
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Pause before re-trying the first path after a full rotation.
const WRAP_SLEEP: Duration = Duration::from_secs(10);

/// Timeout for dials the origin performs on behalf of tunneled flows.
const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("dial timed out")]
    DialTimeout,
    #[error("dial failed: {0}")]
    Dial(std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("invalid TLS server name `{0}`")]
    ServerName(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

pub struct OriginClient {
    config: Config,
    pool: Arc<SessionPool>,
    tls: TlsConnector,
}

impl OriginClient {
    pub fn new(config: Config) -> Result<Self> {
        debug_assert_eq!(config.mode, Mode::Client);

        Ok(Self {
            config,
            pool: SessionPool::new(),
            tls: insecure_tls_connector(),
        })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Opens a forward substream for an origin-local caller.
    ///
    /// Dead sessions discovered along the way are evicted by the pool.
    pub async fn open_stream(
        &self,
        target: &TargetAddr,
    ) -> Result<(StreamHandle, StreamGuard), OpenError> {
        self.pool
            .open_stream(
                StreamKind::Forward,
                target,
                self.config.advanced.max_streams_per_session,
            )
            .await
    }

    /// Spawns all pool workers and runs until one of them panics.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let health = self
            .pool
            .spawn_health_monitor(self.config.advanced.cleanup_interval());

        let mut workers = JoinSet::new();
        let mut worker_id = 0u64;

        for (path_idx, path) in self.config.paths.iter().enumerate() {
            for _ in 0..path.connection_pool.max(1) {
                let client = self.clone();
                let id = worker_id;

                workers.spawn(async move { client.worker(id, path_idx).await });
                worker_id += 1;
            }
        }

        let result = match workers.join_next().await {
            Some(joined) => joined.context("pool worker panicked"),
            None => Ok(()),
        };

        health.abort();
        workers.shutdown().await;

        result
    }

    /// One pool slot: dial, handshake, run, back off, repeat.
    async fn worker(self: Arc<Self>, id: u64, start_path: usize) {
        let stagger =
            id * 500 + OsRng.gen_range(0..=self.config.stealth.conn_jitter_ms.max(1));
        tokio::time::sleep(Duration::from_millis(stagger)).await;

        let paths = &self.config.paths;
        let mut path_idx = start_path % paths.len();
        let mut fails: u32 = 0;

        loop {
            let path = &paths[path_idx];

            match self.connect_once(path).await {
                Ok(lifetime) if lifetime >= LONG_LIVED => {
                    // A long-lived session that died is not a flaky path.
                    fails = 0;
                    continue;
                }
                Ok(_) => {
                    fails += 1;
                    tracing::debug!(remote = %path.addr, fails, "session died young");
                }
                Err(e) => {
                    fails += 1;
                    tracing::debug!(remote = %path.addr, fails, "connect failed: {e}");
                }
            }

            if fails >= MAX_FAILS_BEFORE_SWITCH {
                fails = 0;
                path_idx = (path_idx + 1) % paths.len();

                if path_idx == 0 {
                    tokio::time::sleep(WRAP_SLEEP).await;
                }

                tracing::info!(next = %paths[path_idx].addr, "rotating to next path");
                continue;
            }

            let backoff = (path.retry_interval() * fails)
                .min(BACKOFF_CAP)
                + Duration::from_millis(OsRng.gen_range(0..=500));

            tokio::time::sleep(backoff).await;
        }
    }

    /// Establishes one session and serves it to the end.
    ///
    /// Returns how long the session lived once it was up.
    async fn connect_once(&self, path: &PathConfig) -> Result<Duration, ConnectError> {
        // Dialing.
        let stream = tokio::time::timeout(path.dial_timeout(), TcpStream::connect(&path.addr))
            .await
            .map_err(|_| ConnectError::DialTimeout)?
            .map_err(ConnectError::Dial)?;

        if let Err(e) = netopt::tune_stream(&stream, &self.config.advanced) {
            tracing::debug!("failed to tune tunnel socket: {e}");
        }

        // Fragmentation wraps the raw socket so the first flight (the TLS
        // ClientHello, or the HTTP request in plain mode) gets split.
        let io: Box<dyn Io> = if self.config.fragment.enabled {
            Box::new(Fragmented::new(stream, &self.config.fragment))
        } else {
            Box::new(stream)
        };

        let io: Box<dyn Io> = match path.transport {
            Transport::Tcp => io,
            Transport::Tls => {
                let name = server_name(&self.config.mimic.fake_domain, &path.addr)?;

                Box::new(
                    self.tls
                        .connect(name, io)
                        .await
                        .map_err(ConnectError::Tls)?,
                )
            }
        };

        // Handshaking.
        let upgraded = handshake::client_handshake(io, &self.config.mimic).await?;

        let policies = ObfsPolicies::from_config(&self.config.obfs, &self.config.stealth);
        let crypto = PacketCrypto::new(&self.config.psk, policies.padding);
        let framed = FramedStream::new(upgraded, crypto, policies);

        let (session, mut incoming) = MuxSession::new_client(
            framed,
            session_config(&self.config.mux, &self.config.stealth),
        );

        // Running.
        let entry = self.pool.add(session, path.addr.clone());
        let born = Instant::now();

        tracing::info!(remote = %path.addr, sessions = self.pool.count(), "session established");

        while let Some(stream) = incoming.recv().await {
            let guard = StreamGuard::new(entry.clone());

            tokio::spawn(async move {
                let _guard = guard;

                if let Err(e) = relay::dispatch_inbound(stream, TARGET_DIAL_TIMEOUT).await {
                    tracing::debug!("substream ended: {e}");
                }
            });
        }

        // Dying.
        self.pool.remove(&entry);
        entry.session().close().await;

        let lifetime = born.elapsed();

        tracing::info!(
            remote = %path.addr,
            lived = ?lifetime,
            sessions = self.pool.count(),
            "session closed"
        );

        Ok(lifetime)
    }
}

fn server_name(fake_domain: &str, addr: &str) -> Result<ServerName<'static>, ConnectError> {
    if let Ok(name) = ServerName::try_from(fake_domain.to_owned()) {
        return Ok(name);
    }

    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);

    ServerName::try_from(host.to_owned()).map_err(|_| ConnectError::ServerName(host.to_owned()))
}

/// The TLS layer is camouflage; authenticity comes from the shared secret on
/// the framed channel, so certificates are accepted as-is.
fn insecure_tls_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
