//! Fake idle traffic.
//!
//! A session that only carries keepalives has a recognizable rhythm. When
//! enabled, each session periodically opens a short-lived decoy substream with
//! random content, but only while the session is close to idle.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::{Rng as _, RngCore as _};
use tokio::io::AsyncWriteExt as _;
use tokio::task::JoinHandle;

use crate::pool::{PoolEntry, StreamGuard};
use crate::tag::{self, StreamKind};

/// Sessions with this many active streams carry enough real traffic.
const IDLE_STREAM_LIMIT: usize = 3;

/// Runs decoy substreams on `entry`'s session until the session closes.
///
/// Fires every `interval ± interval/2` seconds.
pub fn spawn_fake_traffic(entry: Arc<PoolEntry>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let base_ms = interval_secs.max(1) * 1000;

        loop {
            let wait = OsRng.gen_range(base_ms / 2..=base_ms + base_ms / 2);
            tokio::time::sleep(Duration::from_millis(wait)).await;

            if entry.session().is_closed() {
                break;
            }

            if entry.active_streams() >= IDLE_STREAM_LIMIT {
                continue;
            }

            let mut stream = match entry.session().open_stream().await {
                Ok(stream) => stream,
                Err(_) => break,
            };

            let _guard = StreamGuard::new(entry.clone());

            if tag::write_kind(&mut stream, StreamKind::Fake).await.is_err() {
                continue;
            }

            let mut noise = vec![0u8; OsRng.gen_range(32..=256)];
            OsRng.fill_bytes(&mut noise);

            if stream.write_all(&noise).await.is_err() || stream.flush().await.is_err() {
                continue;
            }

            tokio::time::sleep(Duration::from_millis(OsRng.gen_range(50..=250))).await;

            tracing::trace!(bytes = noise.len(), "sent fake traffic burst");
        }
    })
}
