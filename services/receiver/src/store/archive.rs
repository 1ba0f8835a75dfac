//! Filesystem archive backend.
//!
//! Layout: `root/<YYYY-MM-DD>/<HHMMSS>.<mmm>.<ext>` with a sibling
//! `<HHMMSS>.<mmm>.json` sidecar holding the capture metadata. The two files
//! are written independently, so a crash in between can leave either one
//! without its sibling. Two captures in the same millisecond share a name and
//! the last write wins.

use super::{ImageStore, StoreError, StoredImage};
use crate::retention::RetentionTrigger;
use crate::validator::CapturedImage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

/// Date format used for day-bucket directory names.
pub const DAY_BUCKET_FORMAT: &str = "%Y-%m-%d";

/// Capture metadata written next to every archived image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    pub width: u32,
    pub height: u32,
    pub time_s: i64,
    pub time_us: i64,
}

impl From<&CapturedImage> for SidecarMetadata {
    fn from(image: &CapturedImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            time_s: image.capture_seconds,
            time_us: image.capture_micros,
        }
    }
}

/// Name of the UTC day bucket holding a capture.
pub fn day_bucket(captured_at: &DateTime<Utc>) -> String {
    captured_at.format(DAY_BUCKET_FORMAT).to_string()
}

/// `HHMMSS.mmm`, shared by the image and its sidecar.
fn file_stem(captured_at: &DateTime<Utc>) -> String {
    captured_at.format("%H%M%S%.3f").to_string()
}

/// Image file name for a capture.
pub fn image_filename(captured_at: &DateTime<Utc>, extension: &str) -> String {
    format!("{}.{}", file_stem(captured_at), extension)
}

/// Sidecar file name for a capture.
pub fn metadata_filename(captured_at: &DateTime<Utc>) -> String {
    format!("{}.json", file_stem(captured_at))
}

/// Day-bucketed directory tree rooted at a configured path.
pub struct FilesystemArchive {
    root: PathBuf,
    image_extension: String,
    retention: Option<RetentionTrigger>,
}

impl FilesystemArchive {
    /// Create an archive under `root`; the root itself must already exist.
    pub fn new(root: impl Into<PathBuf>, image_extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            image_extension: image_extension.into(),
            retention: None,
        }
    }

    /// Report every successful write to the retention manager.
    pub fn with_retention(mut self, trigger: RetentionTrigger) -> Self {
        self.retention = Some(trigger);
        self
    }

    /// Root directory of the archive
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make sure the bucket directory exists and really is a directory.
    async fn ensure_bucket(dir: &Path) -> Result<(), StoreError> {
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => return Err(StoreError::PathConflict(dir.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        }

        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o755);

        match builder.create(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Created day bucket");
                Ok(())
            }
            // Another connection created it first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(StoreError::PathConflict(dir.to_path_buf())),
            },
            Err(source) => Err(StoreError::Io {
                path: dir.to_path_buf(),
                source,
            }),
        }
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    fs::write(path, contents)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait::async_trait]
impl ImageStore for FilesystemArchive {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self, image), fields(capture_s = image.capture_seconds, size_bytes = image.payload.len()))]
    async fn persist(&self, image: &CapturedImage) -> Result<StoredImage, StoreError> {
        let captured_at = image
            .captured_at()
            .ok_or_else(|| StoreError::out_of_range(image))?;

        let bucket_dir = self.root.join(day_bucket(&captured_at));
        Self::ensure_bucket(&bucket_dir).await?;

        let metadata_path = bucket_dir.join(metadata_filename(&captured_at));
        let image_path = bucket_dir.join(image_filename(&captured_at, &self.image_extension));

        let sidecar = serde_json::to_vec_pretty(&SidecarMetadata::from(image))?;
        write_file(&metadata_path, &sidecar).await?;
        write_file(&image_path, &image.payload).await?;

        if let Some(trigger) = &self.retention {
            trigger.record_write();
        }

        debug!(path = %image_path.display(), "Image archived");

        Ok(StoredImage::Files {
            image_path,
            metadata_path,
        })
    }
}
