//! The tunnel data plane shared by the edge and origin roles.
//!
//! Layering, bottom up:
//!
//! 1. a raw TCP (optionally TLS) connection, camouflaged by an HTTP/WebSocket
//!    upgrade ([`handshake`]) and optionally first-write fragmented
//!    ([`fragment`]),
//! 2. the framed crypto channel ([`framed`], [`crypto`]): AES-256-GCM packets
//!    with padding, burst-splitting and timing jitter ([`obfs`]),
//! 3. a yamux session over the framed channel ([`mux`]), pooled and
//!    health-checked ([`pool`]),
//! 4. substreams carrying a one-byte type tag ([`tag`]) and a target header
//!    ([`target`]), relayed to their destinations ([`relay`]), with optional
//!    decoy traffic ([`fake`]).

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod crypto;
pub mod fake;
pub mod fragment;
pub mod framed;
pub mod handshake;
pub mod mux;
pub mod netopt;
pub mod obfs;
pub mod pool;
pub mod relay;
pub mod tag;
pub mod target;

pub use config::Config;
pub use crypto::PacketCrypto;
pub use framed::{FramedStream, Io};
pub use handshake::PrefixedStream;
pub use mux::{IncomingStreams, MuxSession, StreamHandle};
pub use obfs::ObfsPolicies;
pub use pool::{PoolEntry, SessionPool, StreamGuard};
pub use tag::StreamKind;
pub use target::{Proto, TargetAddr};
