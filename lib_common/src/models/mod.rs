//! # Telemetry Models
//!
//! Wire and storage types shared by the relay server, the load emitter and
//! the live feed watcher.
//!
//! - **`event`**: the inbound [`IngestBatch`] with its [`TelemetryEvent`]s,
//!   the persisted [`EventRecord`], and the [`BroadcastPayload`] pushed to
//!   live viewers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Batch, record and broadcast payload types.
pub mod event;

pub use event::{
    BroadcastPayload, ClearRequest, ControlMessage, EventRecord, IngestBatch, NewEvent,
    TelemetryEvent, ValidationError,
};
