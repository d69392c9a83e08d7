//! Shared building blocks for the telemetry relay: request signatures and
//! replay protection, wire models, the live broadcast registry, event
//! storage, logging setup and the signed HTTP client.
//!
//! Every module sits behind a cargo feature of the same name; binaries enable
//! `full`.

#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "models")]
pub mod models;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "security")]
pub mod security;
#[cfg(feature = "utils")]
pub mod utils;

#[cfg(feature = "loggers")]
pub use loggers::loggerlocal::*;
