#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod entities;
pub mod events;
pub mod framework;
pub mod ports;
pub mod processors;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_support;
