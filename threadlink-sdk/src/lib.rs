//! Shared types for threadlink.
//!
//! `objects` holds the queue wire format and Unthread API objects. The HTTP
//! client for the Unthread API lives in `client`, gated behind the `client`
//! cargo feature so that crates which only need the wire types do not pull
//! in `reqwest`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod objects;

#[cfg(feature = "client")]
pub mod client;
