//! # Data Retrieval Module
//!
//! HTTP clients used by the relay's tooling. Network concerns (URL joining,
//! retries, header injection) live here so callers only deal with bodies.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: `ApiClient`, built on `reqwest` and `reqwest-middleware`
//!   with exponential-backoff retries, plus `post_signed` for pushing raw
//!   bodies under the relay's HMAC header scheme.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware and signed posts.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse, API_TOKEN_HEADER};
