//! First-write fragmentation.
//!
//! Splits the first oversized write on a freshly dialed connection into two
//! halves with a short random pause between them, breaking single-packet
//! signatures on the first flight (typically a TLS ClientHello). Subsequent
//! writes pass through untouched.

use std::future::Future as _;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::Rng as _;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::config::FragmentConfig;

/// A byte stream whose first large write is emitted in two delayed halves.
///
/// While a split is in progress, `poll_write` buffers the caller's bytes and
/// reports the full length once both halves are on the wire; callers must
/// resubmit the same buffer after `Pending`, which is what `write_all` does.
pub struct Fragmented<S> {
    inner: S,
    threshold: usize,
    delay: Duration,
    state: State,
}

enum State {
    FirstWritePending,
    Splitting {
        buf: Bytes,
        mid: usize,
        written: usize,
        pause: Option<Pin<Box<Sleep>>>,
    },
    Passthrough,
}

impl<S> Fragmented<S> {
    /// Wraps `inner`, drawing the split threshold and the inter-half delay now
    /// (once per dial).
    pub fn new(inner: S, config: &FragmentConfig) -> Self {
        let max = config.max_size.max(1);
        let threshold = OsRng.gen_range(config.min_size.min(max)..=max);

        let delay_max = config.max_delay.max(config.min_delay);
        let delay = Duration::from_millis(
            OsRng.gen_range(config.min_delay.min(delay_max)..=delay_max),
        );

        Self {
            inner,
            threshold,
            delay,
            state: State::FirstWritePending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Fragmented<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Fragmented<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, buf),
                State::FirstWritePending => {
                    if buf.is_empty() || buf.len() <= this.threshold {
                        this.state = State::Passthrough;
                        continue;
                    }

                    this.state = State::Splitting {
                        buf: Bytes::copy_from_slice(buf),
                        mid: buf.len() / 2,
                        written: 0,
                        pause: None,
                    };
                }
                State::Splitting {
                    buf: owned,
                    mid,
                    written,
                    pause,
                } => {
                    if *written < *mid {
                        let n = ready!(
                            Pin::new(&mut this.inner).poll_write(cx, &owned[*written..*mid])
                        )?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                        continue;
                    }

                    if let Some(sleep) = pause.as_mut() {
                        ready!(sleep.as_mut().poll(cx));
                    } else {
                        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;

                        let extra = Duration::from_millis(OsRng.gen_range(0..=2));
                        *pause = Some(Box::pin(tokio::time::sleep(this.delay + extra)));
                        continue;
                    }

                    if *written < owned.len() {
                        let n = ready!(
                            Pin::new(&mut this.inner).poll_write(cx, &owned[*written..])
                        )?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                        continue;
                    }

                    let total = owned.len();
                    this.state = State::Passthrough;
                    return Poll::Ready(Ok(total));
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn config(min_size: usize, max_size: usize) -> FragmentConfig {
        FragmentConfig {
            enabled: true,
            min_size,
            max_size,
            min_delay: 1,
            max_delay: 2,
        }
    }

    #[tokio::test]
    async fn first_large_write_arrives_complete() {
        let (a, mut b) = tokio::io::duplex(4096);

        let mut fragmented = Fragmented::new(a, &config(16, 16));

        let payload: Vec<u8> = (0..200u8).collect();
        fragmented.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; 200];
        b.read_exact(&mut received).await.unwrap();

        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn first_half_is_flushed_before_the_pause() {
        let (a, mut b) = tokio::io::duplex(4096);

        let mut fragmented = Fragmented::new(a, &config(16, 16));

        let write = tokio::spawn(async move {
            fragmented.write_all(&[0xC3; 100]).await.unwrap();
            fragmented
        });

        // The first half must be readable on its own.
        let mut received = vec![0u8; 50];
        b.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|&x| x == 0xC3));

        let mut rest = vec![0u8; 50];
        b.read_exact(&mut rest).await.unwrap();

        drop(write.await.unwrap());
    }

    #[tokio::test]
    async fn small_first_write_passes_through() {
        let (a, mut b) = tokio::io::duplex(4096);

        let mut fragmented = Fragmented::new(a, &config(64, 64));

        fragmented.write_all(b"tiny").await.unwrap();
        fragmented.write_all(&[1u8; 500]).await.unwrap();

        let mut received = vec![0u8; 504];
        b.read_exact(&mut received).await.unwrap();

        assert_eq!(&received[..4], b"tiny");
    }
}
