//! Persistence backends for validated images.
//!
//! Two interchangeable backends sit behind [`ImageStore`]:
//! - [`PostgresStore`]: an `images` row plus an `image_metadata` row
//! - [`FilesystemArchive`]: a day-bucketed directory tree with a JSON sidecar

pub mod archive;
pub mod postgres;

use crate::validator::CapturedImage;
use std::path::PathBuf;
use thiserror::Error;

pub use archive::{day_bucket, image_filename, metadata_filename, FilesystemArchive, SidecarMetadata};
pub use postgres::{PostgresStore, RelationalEntry};

/// Errors raised while persisting an image.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path exists and is not a directory: {}", .0.display())]
    PathConflict(PathBuf),

    #[error("Capture time out of range: {seconds}s + {micros}us")]
    TimestampOutOfRange { seconds: i64, micros: i64 },

    #[error("Image dimensions {width}x{height} exceed the column range")]
    DimensionsOutOfRange { width: u32, height: u32 },

    #[error("Failed to serialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn out_of_range(image: &CapturedImage) -> Self {
        StoreError::TimestampOutOfRange {
            seconds: image.capture_seconds,
            micros: image.capture_micros,
        }
    }
}

/// Where an image ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredImage {
    /// Relational backend: id of the `images` row
    Row { image_id: i64 },
    /// Filesystem backend: the image file and its sidecar
    Files {
        image_path: PathBuf,
        metadata_path: PathBuf,
    },
}

impl std::fmt::Display for StoredImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredImage::Row { image_id } => write!(f, "images/{}", image_id),
            StoredImage::Files { image_path, .. } => write!(f, "{}", image_path.display()),
        }
    }
}

/// A backend that durably stores captured images.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Short backend name for logs
    fn kind(&self) -> &'static str;

    /// Persist one image. Failures drop the image; nothing is retried.
    async fn persist(&self, image: &CapturedImage) -> Result<StoredImage, StoreError>;
}
