//! # Station Commands
//!
//! Operator commands accepted from UI and HTTP collaborators.
//!
//! The wire shape is `{"cmd": "toggle_radio", "data": {"channel": 1,
//! "type": "node"}}`; commands without arguments omit `data`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StationError};

/// Written to every radio by [`StationCommand::SaveRadio`]
pub const SAVE_COMMAND: &str = "save";

/// Demodulation mode a radio can be switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioMode {
    /// Mesh node relays
    Node,
    /// FSK life tags
    Tag,
    /// OOK node protocol
    Ook,
}

impl RadioMode {
    /// Radio command selecting this mode
    pub fn preset(&self) -> &'static str {
        match self {
            RadioMode::Node => "preset:node2",
            RadioMode::Tag => "preset:fsktag",
            RadioMode::Ook => "preset:node3",
        }
    }
}

/// Commands dispatched into a running station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum StationCommand {
    /// Broadcast station and radio information
    About,
    /// Persist the current configuration on every radio
    SaveRadio,
    /// Switch one radio's demodulation mode
    ToggleRadio {
        channel: u8,
        #[serde(rename = "type")]
        mode: RadioMode,
    },
    /// Run a health checkin now
    Checkin,
    /// Run an upload pass now
    UploadNow,
    /// Report whether the reference tag is heard on every channel
    Qaqc,
}

impl StationCommand {
    /// Parse a JSON command
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` for unknown commands or malformed arguments.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StationError::InvalidCommand(e.to_string()))
    }
}
