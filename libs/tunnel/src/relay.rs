//! Accept-side substream routing and byte relaying.
//!
//! Forward and reverse substreams differ only in which peer opened them; once
//! accepted, both carry a target header and become a plain byte relay to that
//! target. Fake substreams are drained and forgotten.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpStream, UdpSocket};

use crate::tag::{self, StreamKind, TagError};
use crate::target::{self, Proto, TargetAddr, TargetHeaderError};

/// Buffer size per splice direction.
pub const SPLICE_BUF: usize = 32 * 1024;

/// Receive buffer for the accept-side UDP pump.
const UDP_RELAY_BUF: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error(transparent)]
    Target(#[from] TargetHeaderError),
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: TargetAddr,
        source: io::Error,
    },
    #[error("timed out dialing {0}")]
    DialTimeout(TargetAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handles one accepted substream to completion.
///
/// Unknown type tags close the substream and leave the session alone.
pub async fn dispatch_inbound<S>(mut stream: S, dial_timeout: Duration) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let kind = match tag::read_kind(&mut stream).await {
        Ok(kind) => kind,
        Err(TagError::Unknown(opcode)) => {
            tracing::debug!(opcode, "closing substream with unknown type tag");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match kind {
        StreamKind::Fake => {
            drain(&mut stream).await;
            Ok(())
        }
        StreamKind::Forward | StreamKind::Reverse => {
            let target = target::read_target(&mut stream).await?;

            tracing::debug!(%target, "relaying substream");

            match target.proto() {
                Proto::Tcp => relay_tcp(stream, &target, dial_timeout).await,
                Proto::Udp => relay_udp(stream, &target).await,
            }
        }
    }
}

/// Splices two byte streams until either side ends, then closes both.
pub async fn splice<A, B>(mut a: A, mut b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional_with_sizes(&mut a, &mut b, SPLICE_BUF, SPLICE_BUF).await
}

async fn relay_tcp<S>(stream: S, target: &TargetAddr, dial_timeout: Duration) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = tokio::time::timeout(dial_timeout, TcpStream::connect(target.authority()))
        .await
        .map_err(|_| RelayError::DialTimeout(target.clone()))?
        .map_err(|source| RelayError::Dial {
            target: target.clone(),
            source,
        })?;

    conn.set_nodelay(true).ok();

    match splice(stream, conn).await {
        Ok((up, down)) => {
            tracing::trace!(%target, bytes_up = up, bytes_down = down, "relay finished");
            Ok(())
        }
        // A reset mid-relay is the normal way these flows end.
        Err(e) => {
            tracing::trace!(%target, "relay ended: {e}");
            Ok(())
        }
    }
}

/// Pumps a substream to a UDP target and back.
///
/// Each substream read is forwarded as one datagram; substream closure tears
/// the flow down (the edge's flow table owns idle timeouts).
async fn relay_udp<S>(mut stream: S, target: &TargetAddr) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = tokio::net::lookup_host(target.authority())
        .await
        .map_err(|source| RelayError::Dial {
            target: target.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| RelayError::Dial {
            target: target.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
        })?;

    let bind: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(bind).await.map_err(RelayError::Io)?;
    socket.connect(remote).await.map_err(|source| RelayError::Dial {
        target: target.clone(),
        source,
    })?;

    let mut stream_buf = vec![0u8; UDP_RELAY_BUF];
    let mut socket_buf = vec![0u8; UDP_RELAY_BUF];

    loop {
        tokio::select! {
            read = stream.read(&mut stream_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }

                // A datagram that cannot be sent is dropped, not retried.
                if let Err(e) = socket.send(&stream_buf[..n]).await {
                    tracing::trace!(%target, "dropping outbound datagram: {e}");
                }
            }
            received = socket.recv(&mut socket_buf) => {
                let n = received?;

                stream.write_all(&socket_buf[..n]).await?;
                stream.flush().await?;
            }
        }
    }

    Ok(())
}

/// Reads and discards until the peer closes or errors.
pub async fn drain<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
