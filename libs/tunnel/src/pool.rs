//! The session pool shared by all listeners of one peer.
//!
//! Sessions never point back at the pool: closures are discovered by the
//! health monitor polling `is_closed` and by eviction when an open fails.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_yamux::stream::StreamHandle;

use crate::mux::{MuxError, MuxSession};
use crate::tag::{self, StreamKind};
use crate::target::{self, TargetAddr};

/// One live session known to the pool.
pub struct PoolEntry {
    session: MuxSession,
    remote: String,
    created_at: Instant,
    active_streams: AtomicUsize,
}

impl PoolEntry {
    pub fn session(&self) -> &MuxSession {
        &self.session
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }
}

/// Keeps an entry's `active_streams` accurate for the lifetime of one
/// substream.
pub struct StreamGuard {
    entry: Arc<PoolEntry>,
}

impl StreamGuard {
    pub fn new(entry: Arc<PoolEntry>) -> Self {
        entry.active_streams.fetch_add(1, Ordering::Relaxed);

        Self { entry }
    }

    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.entry.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no active session")]
    NoActiveSession,
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("failed to write stream preamble: {0}")]
    Preamble(#[from] std::io::Error),
}

#[derive(Default)]
pub struct SessionPool {
    entries: RwLock<Vec<Arc<PoolEntry>>>,
    cursor: AtomicUsize,
    streams_total: AtomicU64,
}

impl SessionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, session: MuxSession, remote: impl Into<String>) -> Arc<PoolEntry> {
        let entry = Arc::new(PoolEntry {
            session,
            remote: remote.into(),
            created_at: Instant::now(),
            active_streams: AtomicUsize::new(0),
        });

        self.entries.write().push(entry.clone());

        tracing::debug!(remote = %entry.remote, sessions = self.count(), "session registered");

        entry
    }

    pub fn remove(&self, entry: &Arc<PoolEntry>) {
        self.entries.write().retain(|e| !Arc::ptr_eq(e, entry));
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// A point-in-time copy of the pool's entries.
    pub fn snapshot(&self) -> Vec<Arc<PoolEntry>> {
        self.entries.read().clone()
    }

    /// Round-robin pick, skipping closed sessions and entries at the stream
    /// cap; falls back to the least-loaded live entry.
    pub fn pick(&self, max_streams_per_session: usize) -> Result<Arc<PoolEntry>, OpenError> {
        let entries = self.entries.read().clone();

        if entries.is_empty() {
            return Err(OpenError::NoActiveSession);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % entries.len();

        for i in 0..entries.len() {
            let entry = &entries[(start + i) % entries.len()];

            if entry.session.is_closed() {
                continue;
            }
            if max_streams_per_session > 0 && entry.active_streams() >= max_streams_per_session {
                continue;
            }

            return Ok(entry.clone());
        }

        entries
            .iter()
            .filter(|e| !e.session.is_closed())
            .min_by_key(|e| e.active_streams())
            .cloned()
            .ok_or(OpenError::NoActiveSession)
    }

    /// Opens a substream on some live session and writes the stream preamble
    /// (type tag plus target header).
    ///
    /// A session that fails to open is evicted on the spot and the next one is
    /// tried.
    pub async fn open_stream(
        &self,
        kind: StreamKind,
        target: &TargetAddr,
        max_streams_per_session: usize,
    ) -> Result<(StreamHandle, StreamGuard), OpenError> {
        loop {
            let entry = self.pick(max_streams_per_session)?;

            let mut stream = match entry.session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(remote = %entry.remote, "evicting dead session: {e}");
                    self.remove(&entry);
                    entry.session.close().await;
                    continue;
                }
            };

            let guard = StreamGuard::new(entry);

            tag::write_kind(&mut stream, kind).await?;
            target::write_target(&mut stream, target).await?;

            let total = self.streams_total.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(%target, streams_total = total, "opened tunnel substream");

            return Ok((stream, guard));
        }
    }

    /// Periodically drops entries whose session has died.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let evicted: Vec<_> = {
                    let mut entries = pool.entries.write();
                    let (dead, alive) = entries
                        .drain(..)
                        .partition(|e: &Arc<PoolEntry>| e.session.is_closed());
                    *entries = alive;
                    dead
                };

                for entry in evicted {
                    tracing::debug!(remote = %entry.remote, "evicting closed session");
                    entry.session.close().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MuxConfig, StealthConfig};
    use crate::crypto::PacketCrypto;
    use crate::framed::FramedStream;
    use crate::mux::session_config;
    use crate::obfs::ObfsPolicies;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);

        let config = session_config(&MuxConfig::default(), &StealthConfig::default());

        let framed_a = FramedStream::new(a, PacketCrypto::new("", None), ObfsPolicies::default());
        let framed_b = FramedStream::new(b, PacketCrypto::new("", None), ObfsPolicies::default());

        let (client, _incoming_a) = MuxSession::new_client(framed_a, config.clone());
        let (server, incoming_b) = MuxSession::new_server(framed_b, config);

        // Keep the server's accept side alive for the duration of the test.
        std::mem::forget(incoming_b);

        (client, server)
    }

    #[tokio::test]
    async fn empty_pool_yields_no_active_session() {
        let pool = SessionPool::new();

        assert!(matches!(pool.pick(4), Err(OpenError::NoActiveSession)));
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn round_robin_alternates_between_sessions() {
        let pool = SessionPool::new();

        let (client_a, _server_a) = session_pair();
        let (client_b, _server_b) = session_pair();

        let first = pool.add(client_a, "one");
        let second = pool.add(client_b, "two");

        let mut hits = [0usize; 2];
        for _ in 0..10 {
            let picked = pool.pick(0).unwrap();

            if Arc::ptr_eq(&picked, &first) {
                hits[0] += 1;
            } else if Arc::ptr_eq(&picked, &second) {
                hits[1] += 1;
            }
        }

        assert_eq!(hits, [5, 5]);
    }

    #[tokio::test]
    async fn saturated_entries_are_skipped() {
        let pool = SessionPool::new();

        let (client_a, _server_a) = session_pair();
        let (client_b, _server_b) = session_pair();

        let busy = pool.add(client_a, "busy");
        let idle = pool.add(client_b, "idle");

        let _guards: Vec<_> = (0..4).map(|_| StreamGuard::new(busy.clone())).collect();

        for _ in 0..6 {
            let picked = pool.pick(4).unwrap();
            assert!(Arc::ptr_eq(&picked, &idle));
        }
    }

    #[tokio::test]
    async fn health_monitor_evicts_closed_sessions() {
        let pool = SessionPool::new();

        let (client, _server) = session_pair();
        let entry = pool.add(client, "doomed");

        let monitor = pool.spawn_health_monitor(Duration::from_millis(50));

        entry.session().close().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.count() != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("closed session should be evicted within one interval");

        monitor.abort();
    }

    #[tokio::test]
    async fn stream_guard_tracks_active_streams() {
        let pool = SessionPool::new();

        let (client, _server) = session_pair();
        let entry = pool.add(client, "counted");

        assert_eq!(entry.active_streams(), 0);

        let guard = StreamGuard::new(entry.clone());
        let second = StreamGuard::new(entry.clone());
        assert_eq!(entry.active_streams(), 2);

        drop(guard);
        drop(second);
        assert_eq!(entry.active_streams(), 0);
    }
}
