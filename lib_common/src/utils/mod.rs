//! # Utilities Module
//!
//! General-purpose helpers shared by the time-sensitive parts of the crate.
//!
//! ## Contained Modules:
//!
//! - **`clock`**: A wall-clock abstraction. Production code reads the system
//!   clock; tests inject a [`clock::ManualClock`] so drift and retention
//!   windows can be exercised without sleeping.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Wall-clock sources in whole Unix seconds.
pub mod clock;
