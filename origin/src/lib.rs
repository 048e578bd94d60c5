//! The origin node: maintains the session pool towards the edge and dials
//! final targets on behalf of tunneled flows.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod connector;

pub use connector::OriginClient;
