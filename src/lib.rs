//! # Station Core Library
//!
//! Telemetry ingestion and data lifecycle for a wildlife-tracking base
//! station.
//!
//! Radios attached over serial links report tag detections, node relays,
//! node health and sensor telemetry. This library classifies those lines,
//! buffers them into one CSV file per category, rotates and compresses the
//! files on a schedule, uploads them to an object store and reports station
//! health to a backend.

pub mod config;
pub mod data;
pub mod error;
pub mod record;
pub mod scheduler;
pub mod serial;
pub mod station;
