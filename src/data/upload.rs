//! # Upload Manager
//!
//! Pushes compressed files to an object store and removes the local copy
//! once the store confirms the transfer with an ETag.
//!
//! Only one upload pass runs at a time. A caller that finds a pass in
//! progress skips its cycle; failed files stay on disk for the next one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::error::{Result, StationError};

/// Key prefix for rotated station data
pub const TAG_DATA_PREFIX: &str = "tag-data";

/// Extension of files eligible for upload
const UPLOAD_EXTENSION: &str = "gz";

/// Remote storage that accepts whole objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`; returns the store's ETag
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<String>;
}

/// Object store reached with plain HTTP `PUT {endpoint}/{bucket}/{key}`
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    auth_token: Option<String>,
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl HttpObjectStore {
    /// Build a store client from the `[upload]` section
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<String> {
        let url = self.object_url(key);
        debug!("PUT {} ({} bytes)", url, body.len());

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StationError::Upload(format!(
                "{} returned status {}",
                key,
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default();
        if etag.is_empty() {
            return Err(StationError::Upload(format!("{} stored without an ETag", key)));
        }
        Ok(etag)
    }
}

/// Proof that the caller holds the single-flight upload flag
///
/// The flag is released when the guard is dropped.
#[derive(Debug)]
pub struct UploadGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Files uploaded and failed in one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
}

impl UploadSummary {
    fn merge(&mut self, other: UploadSummary) {
        self.uploaded += other.uploaded;
        self.failed += other.failed;
    }
}

/// Result of [`UploadManager::upload_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Another pass was already running
    Skipped,
    Completed(UploadSummary),
}

/// Co-located data written by other software, uploaded as-is
#[derive(Debug, Clone)]
struct ThirdPartySource {
    directory: PathBuf,
    prefix: String,
    min_age: Duration,
}

/// Uploads rotated station files and third-party data
pub struct UploadManager {
    store: Arc<dyn ObjectStore>,
    station_id: String,
    rotated_dir: PathBuf,
    rotated_min_age: Duration,
    third_party: Option<ThirdPartySource>,
    uploading: AtomicBool,
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("station_id", &self.station_id)
            .field("rotated_dir", &self.rotated_dir)
            .field("uploading", &self.is_uploading())
            .finish_non_exhaustive()
    }
}

impl UploadManager {
    /// # Arguments
    ///
    /// * `store` - Destination for uploads
    /// * `station_id` - Station identifier used in object keys
    /// * `rotated_dir` - Directory holding compressed rotated files
    /// * `config` - Minimum ages and third-party source
    pub fn new(
        store: Arc<dyn ObjectStore>,
        station_id: impl Into<String>,
        rotated_dir: impl Into<PathBuf>,
        config: &UploadConfig,
    ) -> Self {
        let third_party = (!config.third_party_directory.is_empty()).then(|| ThirdPartySource {
            directory: PathBuf::from(&config.third_party_directory),
            prefix: config.third_party_prefix.trim_end_matches('/').to_string(),
            min_age: Duration::from_secs(config.third_party_min_age_minutes * 60),
        });

        Self {
            store,
            station_id: station_id.into(),
            rotated_dir: rotated_dir.into(),
            rotated_min_age: Duration::from_secs(config.rotated_min_age_seconds),
            third_party,
            uploading: AtomicBool::new(false),
        }
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::Acquire)
    }

    /// Claim the upload flag; `None` while another pass holds it
    pub fn try_begin(&self) -> Option<UploadGuard<'_>> {
        self.uploading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| UploadGuard { flag: &self.uploading })
    }

    /// Upload every eligible rotated and third-party file
    ///
    /// Returns [`UploadOutcome::Skipped`] immediately if a pass is running.
    pub async fn upload_all(&self) -> UploadOutcome {
        let Some(guard) = self.try_begin() else {
            debug!("Upload already in progress, skipping");
            return UploadOutcome::Skipped;
        };

        let mut summary = self.upload_pending(&guard, None).await;
        summary.merge(self.upload_third_party(&guard).await);

        if summary.uploaded > 0 || summary.failed > 0 {
            info!(
                "Upload pass finished: {} uploaded, {} failed",
                summary.uploaded, summary.failed
            );
        }
        UploadOutcome::Completed(summary)
    }

    /// Upload rotated files, optionally only those of one file stem
    pub async fn upload_pending(&self, _guard: &UploadGuard<'_>, stem: Option<&str>) -> UploadSummary {
        let mut summary = UploadSummary::default();

        let files = match candidate_files(&self.rotated_dir, false, self.rotated_min_age).await {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list {}: {}", self.rotated_dir.display(), e);
                return summary;
            }
        };
        let prefix = stem.map(|s| format!("{}.", s));

        for path in files {
            if let Some(prefix) = &prefix {
                if !file_name(&path).starts_with(prefix.as_str()) {
                    continue;
                }
            }
            match self.upload_tag_file(&path).await {
                Ok(()) => summary.uploaded += 1,
                Err(e) => {
                    warn!("Failed to upload {}: {}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn upload_third_party(&self, _guard: &UploadGuard<'_>) -> UploadSummary {
        let mut summary = UploadSummary::default();
        let Some(source) = &self.third_party else {
            return summary;
        };

        let files = match candidate_files(&source.directory, true, source.min_age).await {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list {}: {}", source.directory.display(), e);
                return summary;
            }
        };

        for path in files {
            let key = format!("{}/{}", source.prefix, file_name(&path));
            match self.upload_and_remove(&path, &key).await {
                Ok(()) => summary.uploaded += 1,
                Err(e) => {
                    warn!("Failed to upload {}: {}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Upload one rotated file under its `tag-data` key
    async fn upload_tag_file(&self, path: &Path) -> Result<()> {
        let modified: DateTime<Utc> = tokio::fs::metadata(path).await?.modified()?.into();
        let key = tag_data_key(&self.station_id, &modified, &file_name(path));
        self.upload_and_remove(path, &key).await
    }

    async fn upload_and_remove(&self, path: &Path, key: &str) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        let etag = self.store.put_object(key, body).await?;
        if etag.is_empty() {
            return Err(StationError::Upload(format!("{} not confirmed by store", key)));
        }

        tokio::fs::remove_file(path).await?;
        info!("Uploaded {} as {} (etag {})", path.display(), key, etag);
        Ok(())
    }
}

/// Object key of a rotated station file
pub fn tag_data_key(station_id: &str, modified: &DateTime<Utc>, basename: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        TAG_DATA_PREFIX,
        station_id,
        modified.format("%Y-%m-%d"),
        basename
    )
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_old_enough(modified: SystemTime, min_age: Duration) -> bool {
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age >= min_age,
        Err(_) => min_age.is_zero(),
    }
}

/// `.gz` files at least `min_age` old, sorted by path
///
/// With `nested`, files are taken from the immediate subdirectories of `dir`
/// instead of `dir` itself. A missing directory yields no files.
async fn candidate_files(dir: &Path, nested: bool, min_age: Duration) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if nested {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
    } else {
        dirs.push(dir.to_path_buf());
    }

    let mut files = Vec::new();
    for dir in dirs {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(UPLOAD_EXTENSION) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if metadata.is_file() && is_old_enough(metadata.modified()?, min_age) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
