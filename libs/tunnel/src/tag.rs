//! The stream-type tag: the first byte of every substream.
//!
//! Both peers may open substreams on the same session; the tag tells the
//! accepting side what it is looking at before any other byte arrives.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// How long an accepting peer waits for the tag before giving up on the
/// substream.
pub const TAG_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    /// Opened by the origin towards the edge; carries a target header.
    Forward = 0x01,
    /// Opened by the edge towards the origin; carries a target header.
    Reverse = 0x02,
    /// Idle-traffic decoy; drained and discarded.
    Fake = 0xFF,
}

impl StreamKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(StreamKind::Forward),
            0x02 => Some(StreamKind::Reverse),
            0xFF => Some(StreamKind::Fake),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("timed out waiting for the stream-type tag")]
    Deadline,
    #[error("unknown stream-type tag {0:#04x}")]
    Unknown(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub async fn write_kind<W>(stream: &mut W, kind: StreamKind) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&[kind as u8]).await?;
    stream.flush().await
}

pub async fn read_kind<R>(stream: &mut R) -> Result<StreamKind, TagError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];

    tokio::time::timeout(TAG_READ_TIMEOUT, stream.read_exact(&mut byte))
        .await
        .map_err(|_| TagError::Deadline)??;

    StreamKind::from_byte(byte[0]).ok_or(TagError::Unknown(byte[0]))
}
