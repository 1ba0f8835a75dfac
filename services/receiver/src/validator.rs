//! Validation of decoded messages before they reach persistence.

use crate::message::ImageMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a decoded message was not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Message has no metadata")]
    MissingMetadata,

    #[error("Message has no payload")]
    MissingPayload,

    #[error("Message payload is empty")]
    EmptyPayload,
}

/// An image that carries everything needed to persist it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub capture_seconds: i64,
    pub capture_micros: i64,
    pub width: u32,
    pub height: u32,
    pub payload: Bytes,
}

impl CapturedImage {
    /// Capture time as microseconds since the epoch, `None` on overflow.
    pub fn timestamp_micros(&self) -> Option<i64> {
        self.capture_seconds
            .checked_mul(1_000_000)?
            .checked_add(self.capture_micros)
    }

    /// Capture time as a UTC instant, `None` when out of range.
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.timestamp_micros()?)
    }
}

/// Check a decoded message and turn it into a persistable image.
pub fn validate(message: ImageMessage) -> Result<CapturedImage, Rejection> {
    let metadata = message.metadata.ok_or(Rejection::MissingMetadata)?;
    let payload = message.data.ok_or(Rejection::MissingPayload)?;
    if payload.is_empty() {
        return Err(Rejection::EmptyPayload);
    }

    Ok(CapturedImage {
        capture_seconds: metadata.time_s,
        capture_micros: metadata.time_us,
        width: metadata.width,
        height: metadata.height,
        payload: Bytes::from(payload),
    })
}
