//! # Core Fan-out Module
//!
//! Live viewer bookkeeping for the relay. The registry here is owned by the
//! running service and handed to every handler through shared state; nothing
//! in this module is global.
//!
//! - **`registry`**: [`BroadcastRegistry`], which registers viewers (each
//!   optionally filtered to a single agent) and delivers accepted events and
//!   control notices to them on a best-effort basis.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Viewer registration and best-effort fan-out.
pub mod registry;

// --- Public API Re-exports ---
pub use registry::{BroadcastFrame, BroadcastRegistry, SendFailure, SubscriberSink, SubscriptionId};
