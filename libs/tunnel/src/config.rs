//! Typed configuration surface of the tunnel core.
//!
//! Parsing the configuration file and expanding profiles is the caller's job;
//! the core only consumes these values. Free-form strings (`"bind->target"`,
//! `"scheme://host:port"`) are parsed into explicit values with explicit errors
//! so that a bad mapping fails at startup instead of at first use.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::target::{TargetAddr, TargetParseError};

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Edge: sits inside the restricted network, fronts public listeners.
    Server,
    /// Origin: sits outside, maintains the session pool and dials targets.
    Client,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Single bind address for the edge's tunnel listener.
    pub listen: Option<String>,
    /// Additional bind addresses; all listeners share one session pool.
    pub listen_ports: Vec<String>,
    /// Remote tunnel endpoints for the origin.
    pub paths: Vec<PathConfig>,
    /// Shared secret. Hashed with SHA-256 into the AES-256 key.
    /// Empty selects unencrypted framing (loopback testing only).
    pub psk: String,
    pub mimic: MimicConfig,
    pub obfs: ObfsConfig,
    pub stealth: StealthConfig,
    pub fragment: FragmentConfig,
    pub mux: MuxConfig,
    pub advanced: AdvancedConfig,
    pub forward: ForwardConfig,
    /// TLS for the edge listeners. Origin-side TLS is selected per path.
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            listen: None,
            listen_ports: Vec::new(),
            paths: Vec::new(),
            psk: String::new(),
            mimic: MimicConfig::default(),
            obfs: ObfsConfig::default(),
            stealth: StealthConfig::default(),
            fragment: FragmentConfig::default(),
            mux: MuxConfig::default(),
            advanced: AdvancedConfig::default(),
            forward: ForwardConfig::default(),
            tls: None,
        }
    }
}

impl Config {
    /// All edge listener bind addresses, in configuration order.
    pub fn listeners(&self) -> Vec<String> {
        self.listen
            .iter()
            .cloned()
            .chain(self.listen_ports.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            Mode::Server => {
                if self.listeners().is_empty() {
                    return Err(ConfigError::NoListeners);
                }
            }
            Mode::Client => {
                if self.paths.is_empty() {
                    return Err(ConfigError::NoPaths);
                }
            }
        }

        for spec in self
            .forward
            .tcp
            .iter()
            .chain(self.forward.udp.iter())
        {
            MappingSpec::parse(spec)?;
        }

        if self.obfs.enabled && self.obfs.min_padding > self.obfs.max_padding {
            return Err(ConfigError::InvertedRange("obfs padding"));
        }
        if self.stealth.random_padding && self.stealth.min_padding > self.stealth.max_padding {
            return Err(ConfigError::InvertedRange("stealth padding"));
        }
        if self.fragment.enabled && self.fragment.min_size > self.fragment.max_size {
            return Err(ConfigError::InvertedRange("fragment size"));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server mode requires at least one listen address")]
    NoListeners,
    #[error("client mode requires at least one path")]
    NoPaths,
    #[error("invalid port mapping: {0}")]
    Mapping(#[from] MappingParseError),
    #[error("{0}: min must not exceed max")]
    InvertedRange(&'static str),
}

/// One remote tunnel endpoint of the origin.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub addr: String,
    pub transport: Transport,
    /// Number of concurrently maintained sessions to this endpoint.
    pub connection_pool: usize,
    /// Base retry interval in seconds; scaled by the failure count.
    pub retry_interval: u64,
    /// Dial timeout in seconds.
    pub dial_timeout: u64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            transport: Transport::Tcp,
            connection_pool: 4,
            retry_interval: 3,
            dial_timeout: 10,
        }
    }
}

impl PathConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval.max(1))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(if self.dial_timeout == 0 {
            10
        } else {
            self.dial_timeout
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tls,
}

/// Cosmetics of the HTTP upgrade.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MimicConfig {
    /// Domain the edge answers for; anything else gets the decoy page.
    pub fake_domain: String,
    /// Request path. A `{rand}` segment is replaced per dial; the edge
    /// validates the prefix up to the first `{`.
    pub fake_path: String,
    pub user_agent: String,
    /// Extra headers emitted verbatim on the upgrade request.
    pub custom_headers: BTreeMap<String, String>,
    /// Cookie name; when set, a `Cookie` header with a random value is sent.
    pub session_cookie: Option<String>,
}

impl Default for MimicConfig {
    fn default() -> Self {
        Self {
            fake_domain: "www.example.com".to_owned(),
            fake_path: "/ws/{rand}".to_owned(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_owned(),
            custom_headers: BTreeMap::new(),
            session_cookie: None,
        }
    }
}

impl MimicConfig {
    /// The invariant prefix of [`Self::fake_path`], used for edge-side validation.
    pub fn path_prefix(&self) -> &str {
        self.fake_path
            .split('{')
            .next()
            .unwrap_or(self.fake_path.as_str())
    }
}

/// Legacy padding / write-jitter knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ObfsConfig {
    pub enabled: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ObfsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_padding: 16,
            max_padding: 128,
            min_delay_ms: 5,
            max_delay_ms: 25,
        }
    }
}

/// DPI-resistance knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    pub random_padding: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    /// Keepalive jitter in seconds; the interval moves by up to ±jitter·500ms.
    pub keepalive_jitter: u64,
    /// Upper bound of the random per-worker startup stagger.
    pub conn_jitter_ms: u64,
    pub burst_split: bool,
    pub max_burst_size: usize,
    pub fake_traffic: bool,
    /// Base interval between fake substreams, in seconds.
    pub fake_traffic_interval: u64,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            random_padding: true,
            min_padding: 32,
            max_padding: 256,
            keepalive_jitter: 5,
            conn_jitter_ms: 1000,
            burst_split: false,
            max_burst_size: 4096,
            fake_traffic: false,
            fake_traffic_interval: 30,
        }
    }
}

/// First-write fragmentation of the origin's dial (breaks ClientHello signatures).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    /// Delay range between the two halves, in milliseconds.
    pub min_delay: u64,
    pub max_delay: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 64,
            max_size: 256,
            min_delay: 10,
            max_delay: 50,
        }
    }
}

/// Pass-through tuning for the stream multiplexer.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Keepalive interval in seconds, before jitter.
    pub keepalive: u64,
    /// Per-session receive budget, bytes.
    pub max_recv: u32,
    /// Per-stream window, bytes.
    pub max_stream: u32,
    /// Accepted for compatibility; the yamux layer sizes its own frames.
    pub frame_size: u32,
    /// Accepted for compatibility; there is only one protocol version here.
    pub version: u8,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive: 30,
            max_recv: 4 * 1024 * 1024,
            max_stream: 256 * 1024,
            frame_size: 32 * 1024,
            version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub tcp_nodelay: bool,
    /// TCP keepalive period in seconds; 0 disables.
    pub tcp_keepalive: u64,
    /// Socket buffer sizes in bytes; 0 keeps the OS default.
    pub tcp_read_buffer: usize,
    pub tcp_write_buffer: usize,
    pub max_streams_per_session: usize,
    /// Upper bound on registered sessions on the edge.
    pub max_connections: usize,
    /// Idle UDP flows are closed after this many seconds.
    pub udp_flow_timeout: u64,
    /// Receive buffer handed to the UDP listener.
    pub udp_buffer_size: usize,
    /// Period of the pool health monitor, seconds.
    pub cleanup_interval: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: 15,
            tcp_read_buffer: 0,
            tcp_write_buffer: 0,
            max_streams_per_session: 64,
            max_connections: 64,
            udp_flow_timeout: 120,
            udp_buffer_size: 512 * 1024,
            cleanup_interval: 3,
        }
    }
}

impl AdvancedConfig {
    pub fn udp_flow_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_flow_timeout.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }
}

/// Edge-side `"bind->target"` port mappings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub tcp: Vec<String>,
    pub udp: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: String,
    /// PEM private key.
    pub key: String,
}

/// A parsed `"bind->target"` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSpec {
    pub bind: String,
    pub target: TargetAddr,
}

impl MappingSpec {
    pub fn parse(s: &str) -> Result<Self, MappingParseError> {
        let (bind, target) = s
            .split_once("->")
            .ok_or_else(|| MappingParseError::MissingArrow(s.to_owned()))?;

        let bind = bind.trim();
        let target = target.trim();

        if bind.is_empty() {
            return Err(MappingParseError::EmptyBind(s.to_owned()));
        }

        Ok(Self {
            bind: bind.to_owned(),
            target: TargetAddr::parse(target)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingParseError {
    #[error("`{0}` is missing the `->` separator")]
    MissingArrow(String),
    #[error("`{0}` has an empty bind address")]
    EmptyBind(String),
    #[error(transparent)]
    Target(#[from] TargetParseError),
}
