//! Error types for signature validation.

use thiserror::Error;

/// Reasons a signed request can be rejected.
///
/// Callers facing the network must collapse all of these into one generic
/// authentication failure; the variant is only meant for local logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The timestamp header is not an integer number of seconds.
    #[error("invalid timestamp")]
    MalformedTimestamp,

    /// The timestamp is further from the current time than the drift tolerance.
    #[error("timestamp drift too large")]
    DriftExceeded,

    /// The signature header is not valid hexadecimal.
    #[error("invalid signature encoding")]
    MalformedSignatureEncoding,

    /// The digest does not match the body and timestamp.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// The signature was already accepted within the replay window.
    #[error("replayed signature")]
    ReplayedSignature,
}

impl AuthError {
    /// A stable, machine-friendly name for structured logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedTimestamp => "malformed_timestamp",
            Self::DriftExceeded => "drift_exceeded",
            Self::MalformedSignatureEncoding => "malformed_signature_encoding",
            Self::SignatureMismatch => "signature_mismatch",
            Self::ReplayedSignature => "replayed_signature",
        }
    }
}
