//! # CSV Formatters
//!
//! One formatter per data category. A formatter owns the category's header
//! row and turns a record into the row's fields.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::record::{BeepRecord, GpsRecord, NodeHealthRecord, TelemetryRecord};

/// Turns records of one category into CSV fields
pub trait RecordFormatter: Send + Sync {
    /// Record type this formatter accepts
    type Record;

    /// Header row, written once at the top of a new file
    fn header(&self) -> &'static [&'static str];

    /// Fields of one data row
    fn format(&self, record: &Self::Record) -> Vec<String>;
}

/// Format a timestamp, falling back to RFC 3339 if `format` is not a valid
/// strftime string
pub fn format_time(time: &DateTime<Utc>, format: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", time.format(format)).is_err() {
        return time.to_rfc3339();
    }
    out
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// `raw-data` category: tag detections
#[derive(Debug, Clone)]
pub struct BeepFormatter {
    date_format: String,
}

impl BeepFormatter {
    pub fn new(date_format: impl Into<String>) -> Self {
        Self { date_format: date_format.into() }
    }
}

impl RecordFormatter for BeepFormatter {
    type Record = BeepRecord;

    fn header(&self) -> &'static [&'static str] {
        &["Time", "RadioId", "TagId", "TagRSSI", "NodeId", "Validated", "ErrorBits"]
    }

    fn format(&self, record: &BeepRecord) -> Vec<String> {
        vec![
            format_time(&record.recorded_at, &self.date_format),
            record.channel.to_string(),
            record.tag_id.clone(),
            opt(&record.rssi),
            opt(&record.node_id),
            if record.validated { "1" } else { "0" }.to_string(),
            opt(&record.error_bits),
        ]
    }
}

/// `gps` category: periodic fix snapshots
#[derive(Debug, Clone)]
pub struct GpsFormatter {
    date_format: String,
    precision: usize,
}

impl GpsFormatter {
    pub fn new(date_format: impl Into<String>, precision: usize) -> Self {
        Self {
            date_format: date_format.into(),
            precision,
        }
    }
}

impl RecordFormatter for GpsFormatter {
    type Record = GpsRecord;

    fn header(&self) -> &'static [&'static str] {
        &["recorded at", "gps at", "latitude", "longitude", "altitude", "quality"]
    }

    fn format(&self, record: &GpsRecord) -> Vec<String> {
        let recorded_at = format_time(&record.recorded_at, &self.date_format);
        match &record.fix {
            Some(fix) => vec![
                recorded_at,
                fix.time
                    .map(|t| format_time(&t, &self.date_format))
                    .unwrap_or_default(),
                format!("{:.*}", self.precision, fix.lat),
                format!("{:.*}", self.precision, fix.lon),
                opt(&fix.alt),
                fix.mode.to_string(),
            ],
            None => vec![recorded_at, String::new(), String::new(), String::new(), String::new(), String::new()],
        }
    }
}

/// `node-health` category: node alive reports
#[derive(Debug, Clone)]
pub struct NodeHealthFormatter {
    date_format: String,
}

impl NodeHealthFormatter {
    pub fn new(date_format: impl Into<String>) -> Self {
        Self { date_format: date_format.into() }
    }
}

impl RecordFormatter for NodeHealthFormatter {
    type Record = NodeHealthRecord;

    fn header(&self) -> &'static [&'static str] {
        &["Time", "RadioId", "NodeId", "NodeRSSI", "Battery", "Celsius"]
    }

    fn format(&self, record: &NodeHealthRecord) -> Vec<String> {
        vec![
            format_time(&record.recorded_at, &self.date_format),
            record.channel.to_string(),
            record.node_id.clone(),
            opt(&record.rssi),
            opt(&record.battery_volts()),
            opt(&record.celsius),
        ]
    }
}

/// `telemetry` category: sensor payloads keyed by hardware id
#[derive(Debug, Clone)]
pub struct TelemetryFormatter {
    date_format: String,
}

impl TelemetryFormatter {
    pub fn new(date_format: impl Into<String>) -> Self {
        Self { date_format: date_format.into() }
    }
}

impl RecordFormatter for TelemetryFormatter {
    type Record = TelemetryRecord;

    fn header(&self) -> &'static [&'static str] {
        &["Time", "RadioId", "HardwareId", "RSSI", "Payload"]
    }

    fn format(&self, record: &TelemetryRecord) -> Vec<String> {
        vec![
            format_time(&record.recorded_at, &self.date_format),
            record.channel.to_string(),
            record.hardware_id.clone(),
            opt(&record.rssi),
            record.payload.to_string(),
        ]
    }
}
