//! # File Rotation
//!
//! Moves an active category file aside, gzips it and removes the
//! uncompressed copy.
//!
//! Rotation is split in two steps so the caller can hold the category's
//! file lock only for the rename:
//!
//! 1. [`RotationManager::move_aside`] renames `{base}/{stem}.csv` to
//!    `{base}/rotated/{stem}.{timestamp}.csv`
//! 2. [`RotationManager::compress`] writes `{stem}.{timestamp}.csv.gz` and,
//!    once the gzip stream is closed and synced, deletes the `.csv`
//!
//! A failed compression leaves the rotated `.csv` in place; the next cycle
//! picks it up through [`RotationManager::recover`].

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Name of the rotated-files subdirectory under the base log directory
pub const ROTATED_DIR: &str = "rotated";

/// Timestamp embedded in rotated file names; sorts chronologically
pub const ROTATION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S_%3f";

/// Paths involved in rotating one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRecord {
    pub source: PathBuf,
    pub rotated: PathBuf,
    pub compressed: PathBuf,
}

/// Rotates category files into `{base}/rotated/`
#[derive(Debug, Clone)]
pub struct RotationManager {
    rotated_dir: PathBuf,
}

impl RotationManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            rotated_dir: base_dir.as_ref().join(ROTATED_DIR),
        }
    }

    pub fn rotated_dir(&self) -> &Path {
        &self.rotated_dir
    }

    /// Rotate `source` completely. Returns `None` when there is no file.
    pub async fn rotate(&self, source: &Path) -> Result<Option<PathBuf>> {
        match self.move_aside(source).await? {
            Some(record) => self.compress(&record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Rename `source` into the rotated directory under a timestamped name
    ///
    /// # Errors
    ///
    /// Returns an error if the rotated directory cannot be created or the
    /// rename fails; `source` is untouched in that case.
    pub async fn move_aside(&self, source: &Path) -> Result<Option<RotationRecord>> {
        match tokio::fs::metadata(source).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Nothing to rotate at {}", source.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        tokio::fs::create_dir_all(&self.rotated_dir).await?;

        let record = self.record_for(source, Utc::now());
        tokio::fs::rename(source, &record.rotated).await?;
        debug!("Moved {} to {}", source.display(), record.rotated.display());
        Ok(Some(record))
    }

    /// Gzip `record.rotated` into `record.compressed`, then remove it
    ///
    /// # Errors
    ///
    /// Any failure removes the partial `.gz` and keeps the rotated `.csv`.
    pub async fn compress(&self, record: &RotationRecord) -> Result<PathBuf> {
        let rotated = record.rotated.clone();
        let compressed = record.compressed.clone();

        let result = tokio::task::spawn_blocking(move || gzip_file(&rotated, &compressed))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|r| r);

        if let Err(e) = result {
            warn!("Failed to compress {}: {}", record.rotated.display(), e);
            if let Err(remove_err) = tokio::fs::remove_file(&record.compressed).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial {}: {}", record.compressed.display(), remove_err);
                }
            }
            return Err(e.into());
        }

        tokio::fs::remove_file(&record.rotated).await?;
        info!("Rotated {} to {}", record.source.display(), record.compressed.display());
        Ok(record.compressed.clone())
    }

    /// Compress rotated copies of `stem` that an earlier cycle left behind
    ///
    /// Returns the compressed paths, oldest first. A missing rotated
    /// directory yields an empty list.
    pub async fn recover(&self, stem: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.", stem);
        let mut orphans = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.rotated_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(orphans),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".csv") {
                orphans.push(entry.path());
            }
        }
        orphans.sort();

        let mut recovered = Vec::with_capacity(orphans.len());
        for rotated in orphans {
            warn!("Recovering uncompressed rotation {}", rotated.display());
            let record = RotationRecord {
                source: rotated.clone(),
                compressed: gz_path(&rotated),
                rotated,
            };
            recovered.push(self.compress(&record).await?);
        }
        Ok(recovered)
    }

    fn record_for(&self, source: &Path, at: DateTime<Utc>) -> RotationRecord {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = source
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "csv".to_string());

        let rotated = self.rotated_dir.join(format!(
            "{}.{}.{}",
            stem,
            at.format(ROTATION_TIMESTAMP_FORMAT),
            extension
        ));
        RotationRecord {
            source: source.to_path_buf(),
            compressed: gz_path(&rotated),
            rotated,
        }
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

fn gzip_file(source: &Path, target: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(target)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;

    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn rotated_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_rotated_name_layout() {
        let manager = RotationManager::new("/data");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap()
            + chrono::Duration::milliseconds(7);
        let record = manager.record_for(Path::new("/data/CTT-abc-gps.csv"), at);

        assert_eq!(
            record.rotated,
            PathBuf::from("/data/rotated/CTT-abc-gps.2024-05-01_130405_007.csv")
        );
        assert_eq!(
            record.compressed,
            PathBuf::from("/data/rotated/CTT-abc-gps.2024-05-01_130405_007.csv.gz")
        );
    }

    #[tokio::test]
    async fn test_rotate_missing_file_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path());

        let result = manager.rotate(&dir.path().join("CTT-abc-gps.csv")).await.unwrap();
        assert!(result.is_none());
        assert!(!manager.rotated_dir().exists());
    }

    #[tokio::test]
    async fn test_rotate_leaves_exactly_one_gz() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path());
        let source = dir.path().join("CTT-abc-raw-data.csv");
        std::fs::write(&source, "Time,RadioId\r\nrow\r\n").unwrap();

        let compressed = manager.rotate(&source).await.unwrap().unwrap();

        assert!(!source.exists());
        let names = rotated_files(manager.rotated_dir());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("CTT-abc-raw-data."));
        assert!(names[0].ends_with(".csv.gz"));
        assert_eq!(read_gz(&compressed), "Time,RadioId\r\nrow\r\n");
    }

    #[tokio::test]
    async fn test_failed_compression_keeps_rotated_csv() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path());
        let source = dir.path().join("CTT-abc-gps.csv");
        std::fs::write(&source, "data").unwrap();

        let mut record = manager.move_aside(&source).await.unwrap().unwrap();
        record.compressed = dir.path().join("no-such-dir").join("out.csv.gz");

        assert!(manager.compress(&record).await.is_err());
        assert!(record.rotated.exists());
        assert!(!record.compressed.exists());
    }

    #[tokio::test]
    async fn test_recover_compresses_orphans_only_for_stem() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path());
        std::fs::create_dir_all(manager.rotated_dir()).unwrap();
        let rotated = manager.rotated_dir();
        std::fs::write(rotated.join("CTT-abc-gps.2024-05-01_000000_000.csv"), "a").unwrap();
        std::fs::write(rotated.join("CTT-abc-gps.2024-05-01_010000_000.csv.gz"), "b").unwrap();
        std::fs::write(rotated.join("CTT-abc-raw-data.2024-05-01_000000_000.csv"), "c").unwrap();

        let recovered = manager.recover("CTT-abc-gps").await.unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(read_gz(&recovered[0]), "a");
        assert_eq!(
            rotated_files(rotated),
            vec![
                "CTT-abc-gps.2024-05-01_000000_000.csv.gz",
                "CTT-abc-gps.2024-05-01_010000_000.csv.gz",
                "CTT-abc-raw-data.2024-05-01_000000_000.csv",
            ]
        );
    }

    #[tokio::test]
    async fn test_recover_without_rotated_dir() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path());
        assert!(manager.recover("CTT-abc-gps").await.unwrap().is_empty());
    }
}
