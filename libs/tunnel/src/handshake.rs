//! The HTTP/WebSocket mimicry handshake.
//!
//! The upgrade exchange is camouflage: it is never cryptographically
//! validated, it only has to look like a browser reaching a websocket
//! endpoint. Authenticity comes from the framed crypto layer behind it.
//!
//! The client side writes its request by hand and parses the response with a
//! buffered parser so that any bytes the peer sent after the response headers
//! are preserved; those bytes are the first frames of the crypto channel and
//! losing them would kill the session.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::seq::SliceRandom as _;
use rand::{Rng as _, RngCore as _};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};

use crate::config::MimicConfig;
use crate::framed::Io;
use crate::obfs::random_alphanumeric;

/// Overall deadline for the client-side upgrade exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The decoy page impersonates this server.
pub const DECOY_SERVER: &str = "nginx/1.24.0";

/// Error page served for anything that is not a valid tunnel upgrade.
///
/// Identical for every rejection cause so probes cannot distinguish a wrong
/// host from a wrong path.
pub const DECOY_BODY: &str = "<html>\r\n\
<head><title>404 Not Found</title></head>\r\n\
<body>\r\n\
<center><h1>404 Not Found</h1></center>\r\n\
<hr><center>nginx/1.24.0</center>\r\n\
</body>\r\n\
</html>\r\n";

const MAX_RESPONSE_HEADER: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer answered with HTTP status {0}")]
    BadStatus(u16),
    #[error("peer's HTTP response was malformed")]
    Malformed,
    #[error("peer's HTTP response headers exceeded {MAX_RESPONSE_HEADER} bytes")]
    ResponseTooLarge,
    #[error("handshake timed out")]
    Deadline,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Performs the client-side upgrade and returns the stream with any
/// already-buffered post-handshake bytes replayed first.
pub async fn client_handshake<S>(
    stream: S,
    mimic: &MimicConfig,
) -> Result<PrefixedStream<S>, HandshakeError>
where
    S: Io,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(stream, mimic))
        .await
        .map_err(|_| HandshakeError::Deadline)?
}

async fn exchange<S>(mut stream: S, mimic: &MimicConfig) -> Result<PrefixedStream<S>, HandshakeError>
where
    S: Io,
{
    let request = build_request(mimic);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);

        match response.parse(&buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let code = response.code.ok_or(HandshakeError::Malformed)?;
                if code != 101 && code != 200 {
                    return Err(HandshakeError::BadStatus(code));
                }

                let leftover = Bytes::copy_from_slice(&buf[consumed..]);

                return Ok(PrefixedStream::new(leftover, stream));
            }
            Ok(httparse::Status::Partial) => {}
            Err(_) => return Err(HandshakeError::Malformed),
        }

        if buf.len() >= MAX_RESPONSE_HEADER {
            return Err(HandshakeError::ResponseTooLarge);
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Malformed);
        }
    }
}

/// Builds the upgrade request with per-dial randomized cosmetics.
pub fn build_request(mimic: &MimicConfig) -> String {
    let mut path = mimic.fake_path.replace("{rand}", &random_alphanumeric(8));
    if !path.contains('?') {
        append_query_decorators(&mut path);
    }

    let mut key = [0u8; 16];
    OsRng.fill_bytes(&mut key);
    let websocket_key = base64::engine::general_purpose::STANDARD.encode(key);

    // Decorations match the configured User-Agent's browser family and are
    // shuffled so no two dials look alike.
    let mut decorations = Archetype::detect(&mimic.user_agent).decorations(&mimic.fake_domain);
    decorations.shuffle(&mut rand::thread_rng());

    let mut request = format!("GET {path} HTTP/1.1\r\n");
    request.push_str(&format!("Host: {}\r\n", mimic.fake_domain));
    request.push_str(&format!("User-Agent: {}\r\n", mimic.user_agent));

    for (name, value) in &decorations {
        request.push_str(&format!("{name}: {value}\r\n"));
    }

    request.push_str("Connection: Upgrade\r\n");
    request.push_str("Upgrade: websocket\r\n");
    request.push_str("Sec-WebSocket-Version: 13\r\n");
    request.push_str(&format!("Sec-WebSocket-Key: {websocket_key}\r\n"));

    for (name, value) in &mimic.custom_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }

    if let Some(cookie) = &mimic.session_cookie {
        request.push_str(&format!("Cookie: {cookie}={}\r\n", random_alphanumeric(24)));
    }

    request.push_str("\r\n");
    request
}

/// The browser family a dial imitates, derived from the configured
/// User-Agent so decoration headers do not contradict it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Archetype {
    Chrome,
    Firefox,
    Safari,
}

impl Archetype {
    fn detect(user_agent: &str) -> Self {
        if user_agent.contains("Firefox") {
            Self::Firefox
        } else if user_agent.contains("Safari") && !user_agent.contains("Chrome") {
            Self::Safari
        } else {
            Self::Chrome
        }
    }

    fn decorations(self, fake_domain: &str) -> Vec<(&'static str, String)> {
        let origin = format!("https://{fake_domain}");

        let mut headers: Vec<(&'static str, String)> = vec![
            ("Accept", "*/*".to_owned()),
            ("Accept-Encoding", "gzip, deflate, br".to_owned()),
            ("Cache-Control", "no-cache".to_owned()),
            ("Pragma", "no-cache".to_owned()),
            ("Origin", origin),
        ];

        match self {
            Self::Chrome => {
                headers.push(("Accept-Language", "en-US,en;q=0.9".to_owned()));
                headers.push(("Sec-Fetch-Dest", "websocket".to_owned()));
                headers.push(("Sec-Fetch-Mode", "websocket".to_owned()));
                headers.push(("Sec-Fetch-Site", "same-origin".to_owned()));
                headers.push((
                    "sec-ch-ua",
                    "\"Not/A)Brand\";v=\"8\", \"Chromium\";v=\"126\", \"Google Chrome\";v=\"126\""
                        .to_owned(),
                ));
                headers.push(("sec-ch-ua-mobile", "?0".to_owned()));
                headers.push(("sec-ch-ua-platform", "\"Windows\"".to_owned()));
            }
            Self::Firefox => {
                headers.push(("Accept-Language", "en-US,en;q=0.5".to_owned()));
                headers.push(("Sec-Fetch-Dest", "websocket".to_owned()));
                headers.push(("Sec-Fetch-Mode", "websocket".to_owned()));
                headers.push(("Sec-Fetch-Site", "same-origin".to_owned()));
            }
            Self::Safari => {
                // Safari sends neither fetch metadata nor client hints.
                headers.push(("Accept-Language", "en-US,en;q=0.9".to_owned()));
            }
        }

        headers
    }
}

fn append_query_decorators(path: &mut String) {
    let mut rng = rand::thread_rng();

    if rng.gen_bool(1.0 / 3.0) {
        return;
    }

    const KEYS: &[&str] = &["v", "t", "sid", "r"];

    let count = rng.gen_range(1..=2usize);
    let mut keys = KEYS.to_vec();
    keys.shuffle(&mut rng);

    for (i, key) in keys.into_iter().take(count).enumerate() {
        let sep = if i == 0 { '?' } else { '&' };
        let len = rng.gen_range(6..=10);
        path.push_str(&format!("{sep}{key}={}", random_alphanumeric(len)));
    }
}

/// A `Sec-WebSocket-Accept`-shaped value. Clients never validate it, so random
/// bytes of the right shape suffice.
pub fn websocket_accept_value() -> String {
    let mut raw = [0u8; 20];
    OsRng.fill_bytes(&mut raw);

    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Whether an incoming request is a tunnel upgrade for our fake identity.
///
/// Everything else must receive the decoy, and the caller must not leak which
/// check failed.
pub fn is_tunnel_upgrade<B>(req: &http::Request<B>, mimic: &MimicConfig) -> bool {
    host_matches(req, &mimic.fake_domain)
        && header_has_token(req, http::header::CONNECTION, "upgrade")
        && header_has_token(req, http::header::UPGRADE, "websocket")
        && req.uri().path().starts_with(mimic.path_prefix())
}

fn host_matches<B>(req: &http::Request<B>, fake_domain: &str) -> bool {
    let Some(host) = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
    else {
        return false;
    };

    let host = strip_port(host);

    if host.eq_ignore_ascii_case(fake_domain) {
        return true;
    }

    if host
        .to_ascii_lowercase()
        .ends_with(&format!(".{}", fake_domain.to_ascii_lowercase()))
    {
        return true;
    }

    // IP literals are always accepted: direct-IP deployments have no domain.
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|h| h.find(']')) {
        // Bracketed IPv6 literal.
        return &host[..end + 2];
    }

    host.split(':').next().unwrap_or(host)
}

fn header_has_token<B>(req: &http::Request<B>, name: http::header::HeaderName, token: &str) -> bool {
    req.headers()
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// A byte stream that replays buffered bytes before reading from the inner
/// stream. Writes go straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
