//! Adapter over the yamux stream multiplexer.
//!
//! The session must be polled to make progress, so every session gets a driver
//! task that pumps it and hands peer-initiated substreams to the accept side
//! in arrival order. Everything else is a thin translation of the tunnel's
//! configuration onto yamux knobs, including the keepalive jitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use rand::rngs::OsRng;
use rand::Rng as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::Control;
use tokio_yamux::session::Session;

pub use tokio_yamux::stream::StreamHandle;

use crate::config::{MuxConfig, StealthConfig};
use crate::framed::FramedStream;

/// Peer-initiated substreams, in FIFO order of arrival.
pub type IncomingStreams = mpsc::Receiver<StreamHandle>;

/// Floor for the keepalive liveness timeout.
const KEEPALIVE_TIMEOUT_FLOOR: Duration = Duration::from_secs(30);

/// Multiplier from keepalive interval to liveness timeout.
const KEEPALIVE_TIMEOUT_FACTOR: u32 = 15;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("session is closed")]
    Closed,
    #[error("failed to open substream: {0}")]
    Open(String),
}

/// Translates tunnel configuration into a yamux [`YamuxConfig`].
///
/// The keepalive interval is jittered by up to `±keepalive_jitter · 500ms` so
/// sessions do not tick in lockstep; the liveness timeout is pinned to 15× the
/// interval with a 30 s floor.
pub fn session_config(mux: &MuxConfig, stealth: &StealthConfig) -> YamuxConfig {
    let base_ms = mux.keepalive.max(1) * 1000;
    let jitter_bound = stealth.keepalive_jitter * 500;

    let interval_ms = if jitter_bound == 0 {
        base_ms
    } else {
        let offset = OsRng.gen_range(0..=jitter_bound * 2) as i64 - jitter_bound as i64;
        base_ms.saturating_add_signed(offset).max(1000)
    };

    let interval = Duration::from_millis(interval_ms);
    let timeout = (interval * KEEPALIVE_TIMEOUT_FACTOR).max(KEEPALIVE_TIMEOUT_FLOOR);

    if mux.version != 1 {
        tracing::debug!(version = mux.version, "mux protocol version is fixed; ignoring");
    }
    if mux.frame_size != MuxConfig::default().frame_size {
        tracing::debug!(
            frame_size = mux.frame_size,
            "mux frame size has no counterpart here; ignoring"
        );
    }

    let mut config = YamuxConfig::default();
    config.enable_keepalive = true;
    config.keepalive_interval = interval;
    config.connection_write_timeout = timeout;
    config.max_stream_window_size = mux.max_stream.max(256 * 1024);

    config
}

/// One multiplexed session over a framed crypto channel.
///
/// Cheap handle; the heavy lifting happens in the driver task. Dropping the
/// handle does not terminate the session, [`MuxSession::close`] does.
pub struct MuxSession {
    control: Control,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl MuxSession {
    /// Wraps the accepting end of a channel.
    pub fn new_server(io: FramedStream, config: YamuxConfig) -> (Self, IncomingStreams) {
        Self::start(Session::new_server(io, config))
    }

    /// Wraps the dialing end of a channel.
    pub fn new_client(io: FramedStream, config: YamuxConfig) -> (Self, IncomingStreams) {
        Self::start(Session::new_client(io, config))
    }

    fn start(mut session: Session<FramedStream>) -> (Self, IncomingStreams) {
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));
        let (incoming_tx, incoming_rx) = mpsc::channel(16);

        let driver = tokio::spawn({
            let closed = closed.clone();

            async move {
                let mut deliver = true;

                loop {
                    match session.next().await {
                        Some(Ok(stream)) => {
                            if deliver && incoming_tx.send(stream).await.is_err() {
                                // Accept side is gone; keep pumping so opened
                                // substreams still make progress.
                                deliver = false;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!("session terminated: {e}");
                            break;
                        }
                        None => break,
                    }
                }

                closed.store(true, Ordering::SeqCst);
            }
        });

        (
            Self {
                control,
                closed,
                driver,
            },
            incoming_rx,
        )
    }

    pub async fn open_stream(&self) -> Result<StreamHandle, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }

        let mut control = self.control.clone();

        control.open_stream().await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            MuxError::Open(e.to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminates the session and the channel beneath it.
    pub async fn close(&self) {
        let mut control = self.control.clone();
        let _ = control.close().await;

        self.closed.store(true, Ordering::SeqCst);
        self.driver.abort();
    }
}
