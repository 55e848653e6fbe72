//! # Station Events
//!
//! Messages broadcast to attached UI collaborators, serialised as JSON
//! objects tagged with `msg_type`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::qaqc::ChannelResult;
use crate::error::Result;
use crate::record::{BeepRecord, NodeHealthRecord, TelemetryRecord};
use crate::serial::ConnectionState;

/// Capacity of the station event broadcast; slow subscribers lag
pub const EVENT_CAPACITY: usize = 256;

/// Connection summary of one radio
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioStatus {
    pub channel: u8,
    pub path: String,
    pub state: ConnectionState,
    pub last_opened: Option<DateTime<Utc>>,
}

/// Station information sent in reply to `about`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AboutInfo {
    pub station_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub radios: Vec<RadioStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg_type", rename_all = "kebab-case")]
pub enum StationEvent {
    Log { data: String },
    Beep(BeepRecord),
    NodeAlive(NodeHealthRecord),
    Telemetry(TelemetryRecord),
    RadioOpen { channel: u8, path: String },
    RadioClose { channel: u8, path: String, reason: String },
    About { data: AboutInfo },
    /// Reference tag result per channel
    Qaqc { data: Vec<ChannelResult> },
}

impl StationEvent {
    pub fn log(message: impl Into<String>) -> Self {
        StationEvent::Log { data: message.into() }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
