//! # Record Types
//!
//! Classified telemetry produced from radio lines, plus GPS fix records.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A tag detection, heard directly or forwarded by a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeepRecord {
    pub channel: u8,
    pub received_at: DateTime<Utc>,
    /// Detection time; earlier than `received_at` when relayed with an offset
    pub recorded_at: DateTime<Utc>,
    pub tag_id: String,
    pub rssi: Option<i32>,
    /// Relaying node, `None` when heard directly
    pub node_id: Option<String>,
    /// Tag id carried a CRC suffix that the radio checked
    pub validated: bool,
    pub error_bits: Option<u32>,
}

impl BeepRecord {
    /// True when the beep was forwarded by a node
    pub fn is_relayed(&self) -> bool {
        self.node_id.is_some()
    }
}

/// A beep forwarded by a node in the legacy wire format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRelayBeepRecord {
    pub beep: BeepRecord,
    /// Signal strength of the node as heard by the radio
    pub node_rssi: Option<i32>,
    /// Milliseconds between detection and forwarding, as reported by the node
    pub offset_ms: i64,
}

/// Health report from a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealthRecord {
    pub channel: u8,
    pub received_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub node_id: String,
    pub rssi: Option<i32>,
    pub firmware: Option<String>,
    pub battery_mv: Option<u32>,
    pub celsius: Option<f64>,
}

impl NodeHealthRecord {
    /// Battery in volts
    pub fn battery_volts(&self) -> Option<f64> {
        self.battery_mv.map(|mv| mv as f64 / 1000.0)
    }
}

/// Sensor telemetry keyed by hardware id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub channel: u8,
    pub received_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub hardware_id: String,
    pub rssi: Option<i32>,
    /// Sensor payload as sent by the device
    pub payload: serde_json::Value,
}

/// Line that matched no known record shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnrecognizedRecord {
    pub channel: u8,
    pub received_at: DateTime<Utc>,
    pub line: String,
    pub reason: String,
}

/// Result of classifying one radio line
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedRecord {
    Beep(BeepRecord),
    NodeRelayBeep(NodeRelayBeepRecord),
    NodeHealth(NodeHealthRecord),
    Telemetry(TelemetryRecord),
    Unrecognized(UnrecognizedRecord),
}

impl ClassifiedRecord {
    /// Channel the record was received on
    pub fn channel(&self) -> u8 {
        match self {
            ClassifiedRecord::Beep(r) => r.channel,
            ClassifiedRecord::NodeRelayBeep(r) => r.beep.channel,
            ClassifiedRecord::NodeHealth(r) => r.channel,
            ClassifiedRecord::Telemetry(r) => r.channel,
            ClassifiedRecord::Unrecognized(r) => r.channel,
        }
    }

    /// Tag detection carried by the record, direct or relayed
    pub fn as_beep(&self) -> Option<&BeepRecord> {
        match self {
            ClassifiedRecord::Beep(r) => Some(r),
            ClassifiedRecord::NodeRelayBeep(r) => Some(&r.beep),
            _ => None,
        }
    }
}

/// Snapshot of the GPS daemon's latest fix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsFix {
    pub time: Option<DateTime<Utc>>,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    /// 0/1 = no fix, 2 = 2D, 3 = 3D
    pub mode: u8,
}

/// One row of the GPS log; `fix` is `None` when the receiver has no fix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsRecord {
    pub recorded_at: DateTime<Utc>,
    pub fix: Option<GpsFix>,
}
