//! Target addresses and the target-header codec.
//!
//! The opener of a forward or reverse substream announces where the accepting
//! side should connect: a `u16_be` length followed by an ASCII
//! `<scheme>://<host>:<port>` string. A missing scheme means TCP.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// How long an accepting peer waits for the target header. Once the header is
/// consumed the stream relays without deadlines.
pub const TARGET_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the serialized target string.
pub const MAX_TARGET_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// A dialable `<scheme>://<host>:<port>` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    proto: Proto,
    authority: String,
}

impl TargetAddr {
    pub fn new(proto: Proto, authority: impl Into<String>) -> Self {
        Self {
            proto,
            authority: authority.into(),
        }
    }

    /// Parses `tcp://host:port`, `udp://host:port` or bare `host:port`.
    ///
    /// Unknown schemes fall back to TCP, matching how scheme-less strings are
    /// treated.
    pub fn parse(s: &str) -> Result<Self, TargetParseError> {
        if s.is_empty() {
            return Err(TargetParseError::Empty);
        }
        if s.len() > MAX_TARGET_LEN {
            return Err(TargetParseError::TooLong(s.len()));
        }
        if !s.is_ascii() {
            return Err(TargetParseError::NotAscii);
        }

        let (proto, authority) = match s.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("udp") => (Proto::Udp, rest),
            Some((_, rest)) => (Proto::Tcp, rest),
            None => (Proto::Tcp, s),
        };

        if authority.is_empty() {
            return Err(TargetParseError::Empty);
        }

        let (_, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| TargetParseError::MissingPort(authority.to_owned()))?;

        port.parse::<u16>()
            .map_err(|_| TargetParseError::BadPort(authority.to_owned()))?;

        Ok(Self {
            proto,
            authority: authority.to_owned(),
        })
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    /// The `host:port` part, in the form the OS resolver accepts.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.authority)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TargetParseError {
    #[error("target address is empty")]
    Empty,
    #[error("target `{0}` is missing a port")]
    MissingPort(String),
    #[error("target `{0}` has an invalid port")]
    BadPort(String),
    #[error("target address contains non-ASCII bytes")]
    NotAscii,
    #[error("target address of {0} bytes exceeds the maximum of {MAX_TARGET_LEN}")]
    TooLong(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum TargetHeaderError {
    #[error("timed out waiting for the target header")]
    Deadline,
    #[error("target header length {0} outside 1..={MAX_TARGET_LEN}")]
    BadLength(usize),
    #[error(transparent)]
    Parse(#[from] TargetParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub async fn write_target<W>(stream: &mut W, target: &TargetAddr) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let serialized = target.to_string();

    debug_assert!(serialized.len() <= MAX_TARGET_LEN);

    stream
        .write_all(&(serialized.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(serialized.as_bytes()).await?;
    stream.flush().await
}

pub async fn read_target<R>(stream: &mut R) -> Result<TargetAddr, TargetHeaderError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(TARGET_READ_TIMEOUT, async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TARGET_LEN {
            return Err(TargetHeaderError::BadLength(len));
        }

        let mut raw = vec![0u8; len];
        stream.read_exact(&mut raw).await?;

        let s = std::str::from_utf8(&raw)
            .map_err(|_| TargetHeaderError::Parse(TargetParseError::NotAscii))?;

        Ok(TargetAddr::parse(s)?)
    })
    .await
    .map_err(|_| TargetHeaderError::Deadline)?
}
