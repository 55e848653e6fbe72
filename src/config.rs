//! # Configuration Module
//!
//! Handles loading and validating station configuration from TOML files,
//! and reading the station identity file.

use chrono::format::{Item, StrftimeItems};
use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StationError};

/// Number of radio channels a station can host
pub const MAX_RADIO_CHANNELS: u8 = 5;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub station: StationConfig,

    #[serde(default = "default_radios")]
    pub radios: Vec<RadioConfig>,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub gps: GpsConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub checkin: CheckinConfig,

    #[serde(default)]
    pub qaqc: QaqcConfig,
}

/// Station identity configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StationConfig {
    #[serde(default = "default_id_file")]
    pub id_file: String,
}

/// One radio receiver bound to a serial device
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    pub channel: u8,

    pub path: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Commands written to the radio after every successful open
    #[serde(default = "default_radio_commands")]
    pub config: Vec<String>,

    /// Persist this channel's records to disk
    #[serde(default = "default_true")]
    pub record: bool,
}

/// Serial reconnection behaviour shared by all radios
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_true")]
    pub restart_on_close: bool,
}

/// Data recording configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RecordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_date_format")]
    pub date_format: String,

    #[serde(default = "default_flush_data_cache_seconds")]
    pub flush_data_cache_seconds: u64,

    #[serde(default = "default_rotation_frequency_minutes")]
    pub rotation_frequency_minutes: u64,

    #[serde(default = "default_upload_frequency_minutes")]
    pub upload_frequency_minutes: u64,

    #[serde(default = "default_checkin_frequency_minutes")]
    pub checkin_frequency_minutes: u64,

    #[serde(default = "default_sensor_data_frequency_minutes")]
    pub sensor_data_frequency_minutes: u64,

    #[serde(default = "default_base_log_directory")]
    pub base_log_directory: String,
}

/// GPS fix recording configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub record: bool,

    #[serde(default = "default_seconds_between_fixes")]
    pub seconds_between_fixes: u64,

    #[serde(default = "default_gps_precision")]
    pub precision: usize,
}

/// Object store upload configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub rotated_min_age_seconds: u64,

    #[serde(default = "default_third_party_directory")]
    pub third_party_directory: String,

    #[serde(default = "default_third_party_prefix")]
    pub third_party_prefix: String,

    #[serde(default = "default_third_party_min_age_minutes")]
    pub third_party_min_age_minutes: u64,

    #[serde(default = "default_upload_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Health checkin configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CheckinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkin_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_hardware_endpoint")]
    pub hardware_endpoint: String,

    #[serde(default = "default_min_beep_count")]
    pub min_beep_count: u64,

    #[serde(default = "default_max_sensor_records")]
    pub max_sensor_records: usize,

    #[serde(default = "default_checkin_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// On-site QA/QC verification configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QaqcConfig {
    #[serde(default = "default_qaqc_tag")]
    pub tag: String,

    #[serde(default = "default_qaqc_beep_threshold")]
    pub beep_threshold: u64,
}

// Default value functions
fn default_true() -> bool { true }

fn default_id_file() -> String { "/etc/station-id".to_string() }

fn default_radios() -> Vec<RadioConfig> {
    [
        "/dev/serial/by-path/platform-3f980000.usb-usb-0:1.2.2:1.0",
        "/dev/serial/by-path/platform-3f980000.usb-usb-0:1.3.1:1.0",
        "/dev/serial/by-path/platform-3f980000.usb-usb-0:1.3.2:1.0",
        "/dev/serial/by-path/platform-3f980000.usb-usb-0:1.3.3:1.0",
        "/dev/serial/by-path/platform-3f980000.usb-usb-0:1.3.4:1.0",
    ]
    .iter()
    .zip(1u8..)
    .map(|(path, channel)| RadioConfig {
        channel,
        path: path.to_string(),
        baud_rate: default_baud_rate(),
        config: default_radio_commands(),
        record: true,
    })
    .collect()
}
fn default_baud_rate() -> u32 { 115_200 }
fn default_radio_commands() -> Vec<String> { vec!["preset:fsktag".to_string()] }

fn default_restart_delay_ms() -> u64 { 15_000 }

fn default_date_format() -> String { "%Y-%m-%d %H:%M:%S".to_string() }
fn default_flush_data_cache_seconds() -> u64 { 5 }
fn default_rotation_frequency_minutes() -> u64 { 60 }
fn default_upload_frequency_minutes() -> u64 { 60 }
fn default_checkin_frequency_minutes() -> u64 { 10 }
fn default_sensor_data_frequency_minutes() -> u64 { 1 }
fn default_base_log_directory() -> String { "/data".to_string() }

fn default_seconds_between_fixes() -> u64 { 60 }
fn default_gps_precision() -> usize { 6 }

fn default_upload_endpoint() -> String { "https://s3.amazonaws.com".to_string() }
fn default_bucket() -> String { "ctt-motus-development".to_string() }
fn default_third_party_directory() -> String { "/data/SGdata".to_string() }
fn default_third_party_prefix() -> String { "ctt/data".to_string() }
fn default_third_party_min_age_minutes() -> u64 { 61 }
fn default_upload_timeout_seconds() -> u64 { 60 }

fn default_checkin_endpoint() -> String {
    "http://station.internetofwildlife.com/station/v2/checkin/".to_string()
}
fn default_hardware_endpoint() -> String { "http://localhost:3000/".to_string() }
fn default_min_beep_count() -> u64 { 5 }
fn default_max_sensor_records() -> usize { 100 }
fn default_checkin_timeout_seconds() -> u64 { 30 }

fn default_qaqc_tag() -> String { "78787878".to_string() }
fn default_qaqc_beep_threshold() -> u64 { 3 }

impl Default for Config {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            radios: default_radios(),
            serial: SerialConfig::default(),
            record: RecordConfig::default(),
            gps: GpsConfig::default(),
            upload: UploadConfig::default(),
            checkin: CheckinConfig::default(),
            qaqc: QaqcConfig::default(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self { id_file: default_id_file() }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            restart_on_close: true,
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            date_format: default_date_format(),
            flush_data_cache_seconds: default_flush_data_cache_seconds(),
            rotation_frequency_minutes: default_rotation_frequency_minutes(),
            upload_frequency_minutes: default_upload_frequency_minutes(),
            checkin_frequency_minutes: default_checkin_frequency_minutes(),
            sensor_data_frequency_minutes: default_sensor_data_frequency_minutes(),
            base_log_directory: default_base_log_directory(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record: true,
            seconds_between_fixes: default_seconds_between_fixes(),
            precision: default_gps_precision(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_upload_endpoint(),
            bucket: default_bucket(),
            auth_token: None,
            rotated_min_age_seconds: 0,
            third_party_directory: default_third_party_directory(),
            third_party_prefix: default_third_party_prefix(),
            third_party_min_age_minutes: default_third_party_min_age_minutes(),
            timeout_seconds: default_upload_timeout_seconds(),
        }
    }
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_checkin_endpoint(),
            hardware_endpoint: default_hardware_endpoint(),
            min_beep_count: default_min_beep_count(),
            max_sensor_records: default_max_sensor_records(),
            timeout_seconds: default_checkin_timeout_seconds(),
        }
    }
}

impl Default for QaqcConfig {
    fn default() -> Self {
        Self {
            tag: default_qaqc_tag(),
            beep_threshold: default_qaqc_beep_threshold(),
        }
    }
}

impl SerialConfig {
    /// Fixed delay before a closed radio is reopened
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl RecordConfig {
    /// Directory holding the active category files
    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_log_directory)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use station_core::config::Config;
    ///
    /// let config = Config::load("/etc/station-core.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::with_capacity(self.radios.len());
        for radio in &self.radios {
            if radio.channel == 0 || radio.channel > MAX_RADIO_CHANNELS {
                return Err(invalid(format!(
                    "radio channel {} is out of range (must be 1-{})",
                    radio.channel, MAX_RADIO_CHANNELS
                )));
            }
            if seen.contains(&radio.channel) {
                return Err(invalid(format!("radio channel {} is configured twice", radio.channel)));
            }
            seen.push(radio.channel);

            if radio.path.is_empty() {
                return Err(invalid(format!("radio {} path cannot be empty", radio.channel)));
            }
            if radio.baud_rate == 0 {
                return Err(invalid(format!("radio {} baud_rate must be greater than 0", radio.channel)));
            }
        }

        if self.serial.restart_delay_ms == 0 || self.serial.restart_delay_ms > 600_000 {
            return Err(invalid("restart_delay_ms must be between 1 and 600000"));
        }

        if self.record.base_log_directory.is_empty() {
            return Err(invalid("base_log_directory cannot be empty"));
        }

        if self.record.date_format.is_empty()
            || StrftimeItems::new(&self.record.date_format).any(|item| matches!(item, Item::Error))
        {
            return Err(invalid(format!("date_format '{}' is not a valid strftime format", self.record.date_format)));
        }

        for (name, value) in [
            ("flush_data_cache_seconds", self.record.flush_data_cache_seconds),
            ("rotation_frequency_minutes", self.record.rotation_frequency_minutes),
            ("upload_frequency_minutes", self.record.upload_frequency_minutes),
            ("checkin_frequency_minutes", self.record.checkin_frequency_minutes),
            ("sensor_data_frequency_minutes", self.record.sensor_data_frequency_minutes),
            ("seconds_between_fixes", self.gps.seconds_between_fixes),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.gps.precision > 12 {
            return Err(invalid("gps precision must be between 0 and 12"));
        }

        if self.upload.enabled && (self.upload.endpoint.is_empty() || self.upload.bucket.is_empty()) {
            return Err(invalid("upload endpoint and bucket cannot be empty when enabled"));
        }

        if self.checkin.enabled && self.checkin.endpoint.is_empty() {
            return Err(invalid("checkin endpoint cannot be empty when enabled"));
        }

        if self.checkin.max_sensor_records == 0 {
            return Err(invalid("max_sensor_records must be greater than 0"));
        }

        if self.qaqc.tag.is_empty() {
            return Err(invalid("qaqc tag cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(msg: impl std::fmt::Display) -> StationError {
    StationError::Config(toml::de::Error::custom(msg))
}

/// Identity of this base station, read from a JSON file at startup
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    pub id: String,
}

impl StationIdentity {
    /// Read the station identity file (`{"id": "..."}`)
    ///
    /// # Errors
    ///
    /// Returns `StationId` if the file is missing, unparsable or holds an
    /// empty id. The station cannot name its data files without it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| StationError::StationId(format!("{}: {}", path.display(), e)))?;
        let identity: StationIdentity = serde_json::from_str(&contents)
            .map_err(|e| StationError::StationId(format!("{}: {}", path.display(), e)))?;
        if identity.id.trim().is_empty() {
            return Err(StationError::StationId(format!("{}: empty station id", path.display())));
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.radios.len(), 5);
        assert_eq!(config.radios[0].channel, 1);
        assert_eq!(config.radios[4].channel, 5);
        assert_eq!(config.radios[2].config, vec!["preset:fsktag".to_string()]);
        assert_eq!(config.serial.restart_delay_ms, 15_000);
        assert_eq!(config.record.flush_data_cache_seconds, 5);
        assert_eq!(config.checkin.min_beep_count, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let toml_content = r#"
[station]
id_file = "/tmp/station-id"

[[radios]]
channel = 2
path = "/dev/ttyACM1"
config = ["preset:node2"]

[record]
base_log_directory = "/tmp/data"
flush_data_cache_seconds = 10
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.station.id_file, "/tmp/station-id");
        assert_eq!(config.radios.len(), 1);
        assert_eq!(config.radios[0].channel, 2);
        assert_eq!(config.radios[0].baud_rate, 115_200);
        assert!(config.radios[0].record);
        assert_eq!(config.record.flush_data_cache_seconds, 10);
        assert_eq!(config.record.rotation_frequency_minutes, 60);
    }

    #[test]
    fn test_radio_channel_out_of_range() {
        let mut config = Config::default();
        config.radios[0].channel = 6;
        assert!(config.validate().is_err());

        config.radios[0].channel = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_radio_channel() {
        let mut config = Config::default();
        config.radios[1].channel = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_radio_path() {
        let mut config = Config::default();
        config.radios[3].path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_restart_delay_zero() {
        let mut config = Config::default();
        config.serial.restart_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::default();
        config.record.flush_data_cache_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.record.rotation_frequency_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gps.seconds_between_fixes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_date_format_rejected() {
        let mut config = Config::default();
        config.record.date_format = "%Y-%m-%dT%H:%M:%S%.3fZ".to_string();
        assert!(config.validate().is_ok());

        config.record.date_format = "%Q".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_endpoint_required_when_enabled() {
        let mut config = Config::default();
        config.upload.endpoint = String::new();
        assert!(config.validate().is_err());

        config.upload.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_restart_delay_duration() {
        let config = SerialConfig::default();
        assert_eq!(config.restart_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_station_identity_load() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{"id": "A1B2C3D4E5F6"}"#).unwrap();
        temp_file.flush().unwrap();

        let identity = StationIdentity::load(temp_file.path()).unwrap();
        assert_eq!(identity.id, "A1B2C3D4E5F6");
    }

    #[test]
    fn test_station_identity_missing_file() {
        let result = StationIdentity::load("/nonexistent/station-id");
        match result {
            Err(StationError::StationId(msg)) => assert!(msg.contains("/nonexistent/station-id")),
            other => panic!("Expected StationId error, got: {:?}", other),
        }
    }

    #[test]
    fn test_station_identity_empty_id() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{"id": "  "}"#).unwrap();
        temp_file.flush().unwrap();

        assert!(matches!(
            StationIdentity::load(temp_file.path()),
            Err(StationError::StationId(_))
        ));
    }
}
