//! # Signature Validator
//!
//! Agents sign `"<timestamp>.<raw body>"` with HMAC-SHA256 under a shared
//! secret and send the timestamp and lowercase hex digest in headers. The
//! validator checks, in order:
//!
//! 1. the timestamp parses as integer seconds,
//! 2. it lies within `drift_secs` of the current time,
//! 3. the signature is valid hex,
//! 4. the digest matches (constant-time),
//! 5. the signature has not been accepted before inside the replay window.
//!
//! The digest is always computed over the body bytes exactly as received.
//! Parsing and re-serializing the JSON first would let a tampered body with
//! the same structure slip through, so callers must hand in the raw bytes.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::AuthError;
use super::replay::ReplayGuard;
use crate::utils::clock::{Clock, SystemClock};

type HmacSha256 = Hmac<Sha256>;

/// Shared secret and time windows for signature validation.
#[derive(Clone)]
pub struct SignatureSettings {
    /// The shared HMAC key.
    pub secret: Vec<u8>,
    /// Maximum allowed |now - timestamp|, in seconds.
    pub drift_secs: i64,
    /// How long an accepted signature is remembered, in seconds.
    pub retention_secs: i64,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            secret: b"telemetry-hmac-secret".to_vec(),
            drift_secs: 30,
            retention_secs: 120,
        }
    }
}

impl fmt::Debug for SignatureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureSettings")
            .field("secret", &"<redacted>")
            .field("drift_secs", &self.drift_secs)
            .field("retention_secs", &self.retention_secs)
            .finish()
    }
}

fn keyed_mac(secret: &[u8], timestamp: &str, body: &[u8]) -> HmacSha256 {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Raw HMAC-SHA256 digest of `"<timestamp>.<body>"`.
pub fn compute_signature(secret: &[u8], timestamp: &str, body: &[u8]) -> Vec<u8> {
    keyed_mac(secret, timestamp, body)
        .finalize()
        .into_bytes()
        .to_vec()
}

/// Lowercase hex digest, ready for the `X-Signature` header.
pub fn sign_hex(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    hex::encode(compute_signature(secret, timestamp, body))
}

/// Validates timestamped HMAC signatures and enforces the replay window.
#[derive(Debug)]
pub struct SignatureValidator {
    settings: SignatureSettings,
    replays: ReplayGuard,
    clock: Arc<dyn Clock>,
}

impl SignatureValidator {
    /// Creates a validator reading the system clock.
    pub fn new(settings: SignatureSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Creates a validator whose drift check and replay guard share `clock`.
    pub fn with_clock(settings: SignatureSettings, clock: Arc<dyn Clock>) -> Self {
        let replays = ReplayGuard::with_clock(settings.retention_secs, clock.clone());
        Self {
            settings,
            replays,
            clock,
        }
    }

    /// The settings this validator was built with.
    pub fn settings(&self) -> &SignatureSettings {
        &self.settings
    }

    /// Signs `body` with this validator's secret.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        sign_hex(&self.settings.secret, timestamp, body)
    }

    /// Runs every check against one request.
    ///
    /// The only side effect is recording the signature in the replay guard,
    /// and that only happens once every other check has passed.
    pub fn validate(&self, timestamp: &str, signature_hex: &str, body: &[u8]) -> Result<(), AuthError> {
        let ts_value = self.validate_timestamp(timestamp)?;

        let provided = hex::decode(signature_hex).map_err(|_| AuthError::MalformedSignatureEncoding)?;

        keyed_mac(&self.settings.secret, timestamp, body)
            .verify_slice(&provided)
            .map_err(|_| AuthError::SignatureMismatch)?;

        if !self.replays.record(ts_value, &provided) {
            return Err(AuthError::ReplayedSignature);
        }
        Ok(())
    }

    fn validate_timestamp(&self, timestamp: &str) -> Result<i64, AuthError> {
        let ts_value: i64 = timestamp.parse().map_err(|_| AuthError::MalformedTimestamp)?;
        let drift = self.clock.now_secs().abs_diff(ts_value);
        if drift > self.settings.drift_secs.unsigned_abs() {
            return Err(AuthError::DriftExceeded);
        }
        Ok(ts_value)
    }
}
