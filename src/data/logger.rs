//! # Category Log
//!
//! Buffered CSV writer for one data category.
//!
//! Records are formatted on [`CategoryLog::append`] and held in memory;
//! only [`CategoryLog::flush`] touches disk. A flush takes the whole buffer
//! at once, so records appended while it writes wait for the next flush.
//! Rows drained by a failed flush are not requeued.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::formatter::RecordFormatter;
use super::rotation::RotationManager;
use super::Category;
use crate::error::Result;

/// Category-agnostic view of a log, for the flush and rotation cycles
#[async_trait]
pub trait LogSink: Send + Sync {
    fn category(&self) -> Category;

    fn path(&self) -> &Path;

    /// Rows waiting for the next flush
    fn pending(&self) -> usize;

    /// Write buffered rows; returns how many were written
    async fn flush(&self) -> Result<usize>;

    /// Rotate the file underneath this log; returns the compressed path
    async fn rotate(&self, rotation: &RotationManager) -> Result<Option<PathBuf>>;
}

/// In-memory buffer + formatter + append-only file for one category
pub struct CategoryLog<F: RecordFormatter> {
    category: Category,
    path: PathBuf,
    formatter: F,
    buffer: Mutex<Vec<Vec<String>>>,
    /// Held while appending to or renaming the file
    file_lock: tokio::sync::Mutex<()>,
}

impl<F: RecordFormatter> std::fmt::Debug for CategoryLog<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryLog")
            .field("category", &self.category)
            .field("path", &self.path)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<F: RecordFormatter> CategoryLog<F> {
    pub fn new(category: Category, path: impl Into<PathBuf>, formatter: F) -> Self {
        Self {
            category,
            path: path.into(),
            formatter,
            buffer: Mutex::new(Vec::new()),
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Format a record and buffer the row; never touches disk
    pub fn append(&self, record: &F::Record) {
        let row = self.formatter.format(record);
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(row);
    }

    fn take_rows(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    async fn write_rows(&self, rows: &[Vec<String>]) -> Result<()> {
        let _file = self.file_lock.lock().await;

        let exists = tokio::fs::metadata(&self.path).await.is_ok();
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        if !exists {
            writer.write_record(self.formatter.header())?;
        }
        for row in rows {
            writer.write_record(row)?;
        }
        let contents = writer.into_inner().map_err(|e| e.into_error())?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&contents).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<F: RecordFormatter> LogSink for CategoryLog<F> {
    fn category(&self) -> Category {
        self.category
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn pending(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    async fn flush(&self) -> Result<usize> {
        let rows = self.take_rows();
        if rows.is_empty() {
            return Ok(0);
        }

        self.write_rows(&rows).await?;
        debug!("Flushed {} {} rows to {}", rows.len(), self.category, self.path.display());
        Ok(rows.len())
    }

    async fn rotate(&self, rotation: &RotationManager) -> Result<Option<PathBuf>> {
        let record = {
            let _file = self.file_lock.lock().await;
            rotation.move_aside(&self.path).await?
        };
        match record {
            Some(record) => rotation.compress(&record).await.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::formatter::{BeepFormatter, TelemetryFormatter};
    use crate::record::{BeepRecord, TelemetryRecord};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn beep(tag_id: &str) -> BeepRecord {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        BeepRecord {
            channel: 1,
            received_at: at,
            recorded_at: at,
            tag_id: tag_id.to_string(),
            rssi: Some(-60),
            node_id: None,
            validated: false,
            error_bits: None,
        }
    }

    fn log(dir: &TempDir) -> CategoryLog<BeepFormatter> {
        CategoryLog::new(
            Category::RawData,
            dir.path().join("CTT-test-raw-data.csv"),
            BeepFormatter::new("%Y-%m-%d %H:%M:%S"),
        )
    }

    #[tokio::test]
    async fn test_append_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        log.append(&beep("AAAA0001"));
        assert_eq!(log.pending(), 1);
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_flush_empty_buffer_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        assert_eq!(log.flush().await.unwrap(), 0);
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_flush_writes_header_once_and_keeps_order() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        log.append(&beep("AAAA0001"));
        log.append(&beep("AAAA0002"));
        assert_eq!(log.flush().await.unwrap(), 2);
        assert_eq!(log.pending(), 0);

        log.append(&beep("AAAA0003"));
        assert_eq!(log.flush().await.unwrap(), 1);

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let expected = "Time,RadioId,TagId,TagRSSI,NodeId,Validated,ErrorBits\r\n\
                        2024-05-01 12:00:00,1,AAAA0001,-60,,0,\r\n\
                        2024-05-01 12:00:00,1,AAAA0002,-60,,0,\r\n\
                        2024-05-01 12:00:00,1,AAAA0003,-60,,0,\r\n";
        assert_eq!(contents, expected);
        assert_eq!(contents.matches("Time,RadioId").count(), 1);
    }

    #[tokio::test]
    async fn test_flush_quotes_fields_with_separators() {
        let dir = TempDir::new().unwrap();
        let log = CategoryLog::new(
            Category::Telemetry,
            dir.path().join("CTT-test-telemetry.csv"),
            TelemetryFormatter::new("%Y-%m-%d %H:%M:%S"),
        );
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        log.append(&TelemetryRecord {
            channel: 2,
            received_at: at,
            recorded_at: at,
            hardware_id: "say \"hi\"".to_string(),
            rssi: None,
            payload: serde_json::json!({"a": 1, "b": 2}),
        });
        log.flush().await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let expected = concat!(
            "Time,RadioId,HardwareId,RSSI,Payload\r\n",
            r#"2024-05-01 12:00:00,2,"say ""hi""",,"{""a"":1,""b"":2}""#,
            "\r\n",
        );
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_header_not_written_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        std::fs::write(log.path(), "existing\r\n").unwrap();

        log.append(&beep("AAAA0001"));
        log.flush().await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.starts_with("existing\r\n2024-05-01"));
        assert!(!contents.contains("TagId"));
    }

    #[tokio::test]
    async fn test_failed_flush_drops_rows() {
        let dir = TempDir::new().unwrap();
        let log = CategoryLog::new(
            Category::RawData,
            dir.path().join("missing-dir").join("data.csv"),
            BeepFormatter::new("%Y-%m-%d %H:%M:%S"),
        );

        log.append(&beep("AAAA0001"));
        assert!(log.flush().await.is_err());
        assert_eq!(log.pending(), 0);
    }

    #[tokio::test]
    async fn test_rotate_then_flush_starts_new_file_with_header() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        let rotation = RotationManager::new(dir.path());

        log.append(&beep("AAAA0001"));
        log.flush().await.unwrap();

        let compressed = log.rotate(&rotation).await.unwrap().unwrap();
        assert!(compressed.exists());
        assert!(!log.path().exists());

        log.append(&beep("AAAA0002"));
        log.flush().await.unwrap();
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.starts_with("Time,RadioId"));
        assert!(contents.contains("AAAA0002"));
        assert!(!contents.contains("AAAA0001"));
    }
}
