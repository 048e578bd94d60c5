//! The edge node: public tunnel listeners plus the port-mapping engine.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod mappings;
pub mod server;

pub use server::EdgeServer;
