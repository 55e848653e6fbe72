//! # Data Lifecycle Module
//!
//! Category logs, rotation and upload, tied together by [`DataManager`].
//!
//! This module handles:
//! - Buffering records into one CSV file per category
//! - Periodic flushes of every category
//! - The sequential per-category rotate, upload and cleanup chain
//! - Detection statistics

pub mod formatter;
pub mod logger;
pub mod rotation;
pub mod stats;
pub mod upload;

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{GpsConfig, RecordConfig};
use crate::error::Result;
use crate::record::{BeepRecord, GpsRecord, NodeHealthRecord, TelemetryRecord};

pub use formatter::{BeepFormatter, GpsFormatter, NodeHealthFormatter, RecordFormatter, TelemetryFormatter};
pub use logger::{CategoryLog, LogSink};
pub use rotation::{RotationManager, RotationRecord};
pub use stats::StatsAggregator;
pub use upload::{HttpObjectStore, ObjectStore, UploadManager, UploadOutcome, UploadSummary};

/// Prefix of every station data file name
pub const FILE_PREFIX: &str = "CTT";

/// Data categories, each with its own CSV file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    RawData,
    Gps,
    NodeHealth,
    Telemetry,
}

impl Category {
    /// Rotation order
    pub const ALL: [Category; 4] = [
        Category::RawData,
        Category::Gps,
        Category::NodeHealth,
        Category::Telemetry,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Category::RawData => "raw-data",
            Category::Gps => "gps",
            Category::NodeHealth => "node-health",
            Category::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// `CTT-{station_id}-{suffix}`
pub fn file_stem(station_id: &str, category: Category) -> String {
    format!("{}-{}-{}", FILE_PREFIX, station_id, category.suffix())
}

/// `CTT-{station_id}-{suffix}.csv`
pub fn file_name(station_id: &str, category: Category) -> String {
    format!("{}.csv", file_stem(station_id, category))
}

/// Owns the category logs and drives flush, rotation and upload
pub struct DataManager {
    station_id: String,
    base_dir: PathBuf,
    beeps: CategoryLog<BeepFormatter>,
    gps: CategoryLog<GpsFormatter>,
    node_health: CategoryLog<NodeHealthFormatter>,
    telemetry: CategoryLog<TelemetryFormatter>,
    rotation: RotationManager,
    uploader: Option<UploadManager>,
}

impl fmt::Debug for DataManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataManager")
            .field("station_id", &self.station_id)
            .field("base_dir", &self.base_dir)
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}

impl DataManager {
    /// # Arguments
    ///
    /// * `station_id` - Station identifier used in file names
    /// * `record` - Base directory and date format
    /// * `gps` - Coordinate precision of the GPS log
    /// * `uploader` - Upload target, `None` to keep rotated files locally
    pub fn new(
        station_id: impl Into<String>,
        record: &RecordConfig,
        gps: &GpsConfig,
        uploader: Option<UploadManager>,
    ) -> Self {
        let station_id = station_id.into();
        let base_dir = record.base_dir();
        let path = |category| base_dir.join(file_name(&station_id, category));

        Self {
            beeps: CategoryLog::new(
                Category::RawData,
                path(Category::RawData),
                BeepFormatter::new(&record.date_format),
            ),
            gps: CategoryLog::new(
                Category::Gps,
                path(Category::Gps),
                GpsFormatter::new(&record.date_format, gps.precision),
            ),
            node_health: CategoryLog::new(
                Category::NodeHealth,
                path(Category::NodeHealth),
                NodeHealthFormatter::new(&record.date_format),
            ),
            telemetry: CategoryLog::new(
                Category::Telemetry,
                path(Category::Telemetry),
                TelemetryFormatter::new(&record.date_format),
            ),
            rotation: RotationManager::new(&base_dir),
            uploader,
            station_id,
            base_dir,
        }
    }

    /// Create the base log directory
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn rotation(&self) -> &RotationManager {
        &self.rotation
    }

    pub fn uploader(&self) -> Option<&UploadManager> {
        self.uploader.as_ref()
    }

    pub fn record_beep(&self, record: &BeepRecord) {
        self.beeps.append(record);
    }

    pub fn record_gps(&self, record: &GpsRecord) {
        self.gps.append(record);
    }

    pub fn record_node_health(&self, record: &NodeHealthRecord) {
        self.node_health.append(record);
    }

    pub fn record_telemetry(&self, record: &TelemetryRecord) {
        self.telemetry.append(record);
    }

    /// Every category log, in rotation order
    pub fn logs(&self) -> [&dyn LogSink; 4] {
        [&self.beeps, &self.gps, &self.node_health, &self.telemetry]
    }

    /// Flush every category; failures are logged and the rest continue
    ///
    /// Returns the number of rows written.
    pub async fn flush_all(&self) -> usize {
        let mut written = 0;
        for log in self.logs() {
            match log.flush().await {
                Ok(rows) => written += rows,
                Err(e) => error!("Failed to flush {} data to {}: {}", log.category(), log.path().display(), e),
            }
        }
        written
    }

    /// Rotate each category in turn, uploading its compressed files before
    /// moving to the next
    ///
    /// Uploads are skipped when another upload pass is running; those files
    /// go out on a later cycle. Returns the compressed files produced.
    pub async fn rotate_and_upload(&self) -> Vec<PathBuf> {
        let guard = self.uploader.as_ref().and_then(|u| u.try_begin());
        if self.uploader.is_some() && guard.is_none() {
            debug!("Upload in progress, rotating without upload");
        }

        let mut compressed = Vec::new();
        for log in self.logs() {
            let stem = file_stem(&self.station_id, log.category());
            match self.rotate_category(log, &stem).await {
                Ok(mut paths) => compressed.append(&mut paths),
                Err(e) => {
                    warn!("Rotation of {} failed, retrying next cycle: {}", log.category(), e);
                    continue;
                }
            }

            if let (Some(uploader), Some(guard)) = (&self.uploader, &guard) {
                let summary = uploader.upload_pending(guard, Some(&stem)).await;
                if summary.failed > 0 {
                    warn!("{} {} files left for the next upload", summary.failed, log.category());
                }
            }
        }
        compressed
    }

    async fn rotate_category(&self, log: &dyn LogSink, stem: &str) -> Result<Vec<PathBuf>> {
        let mut paths = self.rotation.recover(stem).await?;
        if let Some(path) = log.rotate(&self.rotation).await? {
            paths.push(path);
        }
        Ok(paths)
    }

    /// Run a full upload pass, if uploads are configured
    pub async fn upload_all(&self) -> Option<UploadOutcome> {
        let uploader = self.uploader.as_ref()?;
        let outcome = uploader.upload_all().await;
        if outcome == UploadOutcome::Skipped {
            info!("Upload already running, skipped this cycle");
        }
        Some(outcome)
    }
}
