//! # Radio Record Module
//!
//! Turns radio lines into typed records.
//!
//! This module handles:
//! - The two wire-format generations radios emit (enveloped and legacy)
//! - Tag id CRC-suffix validation
//! - Relay offset correction of detection times

pub mod classifier;
pub mod types;

pub use classifier::classify;
pub use types::*;
