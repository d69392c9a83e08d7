//! # Request Authentication
//!
//! Every write accepted by the relay carries a timestamped HMAC-SHA256
//! signature over its raw body. This module verifies those signatures and
//! remembers recently accepted ones so a captured request cannot be replayed.
//!
//! ## Contained Modules:
//!
//! - **`signature`**: [`SignatureValidator`] runs the five-step check
//!   (timestamp format, drift, hex encoding, digest, replay) and exposes the
//!   signing helpers clients use to produce the `X-Signature` header.
//! - **`replay`**: [`ReplayGuard`], the time-windowed set of recently seen
//!   signatures with an atomic check-and-insert.
//! - **`error`**: [`AuthError`], one variant per failed check.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Authentication failure kinds.
pub mod error;
/// Time-windowed replay protection.
pub mod replay;
/// Timestamped HMAC signature validation.
pub mod signature;

pub use error::AuthError;
pub use replay::{ReplayGuard, ReplayRecord};
pub use signature::{compute_signature, sign_hex, SignatureSettings, SignatureValidator};

/// Header carrying the decimal Unix timestamp that was signed.
pub const SIGNATURE_TS_HEADER: &str = "X-Signature-Ts";
/// Header carrying the lowercase hex HMAC-SHA256 digest.
pub const SIGNATURE_HEADER: &str = "X-Signature";
