//! Size quota for the filesystem archive.
//!
//! Usage is recomputed from a full recursive scan each sweep and is never
//! persisted. When the archive is over quota, whole day buckets are removed,
//! oldest first. Buckets dated today (UTC) or later are never evicted because
//! connections may still be writing into them.

use crate::store::archive::DAY_BUCKET_FORMAT;
use chrono::{NaiveDate, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Errors from quota parsing, scanning and eviction.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("Invalid size {input:?}: {reason}")]
    Parse { input: String, reason: &'static str },

    #[error("Failed to scan {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to evict {}: {source}", .path.display())]
    Evict {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Retention task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn parse_error(input: &str, reason: &'static str) -> RetentionError {
    RetentionError::Parse {
        input: input.to_string(),
        reason,
    }
}

/// Parse a quota such as `500k`, `2m`, `1g` or `100` (kilobytes) into bytes.
pub fn parse_max_size(text: &str) -> Result<u64, RetentionError> {
    let (digits, multiplier) = match text.char_indices().next_back() {
        None => return Err(parse_error(text, "empty size")),
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let multiplier = match unit.to_ascii_lowercase() {
                'k' => 1024,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                _ => return Err(parse_error(text, "unit must be one of k, m, g")),
            };
            (&text[..idx], multiplier)
        }
        Some(_) => (text, 1024),
    };

    if digits.is_empty() {
        return Err(parse_error(text, "missing digits"));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_error(text, "unexpected character before unit"));
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(|| parse_error(text, "size too large"))
}

fn usage_sync(dir: &Path) -> Result<u64, RetentionError> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| RetentionError::Scan {
            path: e.path().unwrap_or(dir).to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| RetentionError::Scan {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Total size in bytes of every regular file under `dir`.
///
/// Any traversal error aborts the scan; partial totals are never returned.
pub async fn usage(dir: &Path) -> Result<u64, RetentionError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || usage_sync(&dir)).await?
}

/// Outcome of one quota sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub usage_before: u64,
    pub usage_after: u64,
    /// Names of removed buckets, oldest first
    pub evicted: Vec<String>,
}

/// Day buckets under `dir` dated strictly before `today`, sorted oldest first.
fn evictable_buckets(dir: &Path, today: NaiveDate) -> Result<Vec<(String, PathBuf)>, RetentionError> {
    let scan_error = |source| RetentionError::Scan {
        path: dir.to_path_buf(),
        source,
    };

    let mut buckets = Vec::new();
    for entry in fs::read_dir(dir).map_err(scan_error)? {
        let entry = entry.map_err(scan_error)?;
        if !entry.file_type().map_err(scan_error)?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Fixed width keeps lexicographic order chronological
        if name.len() != 10 {
            continue;
        }
        match NaiveDate::parse_from_str(&name, DAY_BUCKET_FORMAT) {
            Ok(date) if date < today => buckets.push((name, entry.path())),
            _ => {}
        }
    }

    buckets.sort();
    Ok(buckets)
}

fn enforce_quota_sync(
    dir: &Path,
    max_bytes: u64,
    today: NaiveDate,
) -> Result<EvictionReport, RetentionError> {
    let usage_before = usage_sync(dir)?;
    let mut report = EvictionReport {
        usage_before,
        usage_after: usage_before,
        evicted: Vec::new(),
    };
    if usage_before <= max_bytes {
        return Ok(report);
    }

    for (name, path) in evictable_buckets(dir, today)? {
        if report.usage_after <= max_bytes {
            break;
        }
        let size = usage_sync(&path)?;
        fs::remove_dir_all(&path).map_err(|source| RetentionError::Evict {
            path: path.clone(),
            source,
        })?;
        debug!(bucket = %name, size_bytes = size, "Evicted day bucket");
        report.usage_after = report.usage_after.saturating_sub(size);
        report.evicted.push(name);
    }

    Ok(report)
}

/// Evict the oldest day buckets until `dir` fits in `max_bytes`.
///
/// Only buckets dated before `today` are candidates, so the report can still
/// show usage above the quota when the current day alone exceeds it.
pub async fn enforce_quota(
    dir: &Path,
    max_bytes: u64,
    today: NaiveDate,
) -> Result<EvictionReport, RetentionError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || enforce_quota_sync(&dir, max_bytes, today)).await?
}

/// Cheap handle the archive uses to request a sweep after a batch of writes.
#[derive(Clone)]
pub struct RetentionTrigger {
    writes: Arc<AtomicU64>,
    every: Option<u64>,
    notify: Arc<Notify>,
}

impl RetentionTrigger {
    fn new(every: Option<u64>) -> Self {
        Self {
            writes: Arc::new(AtomicU64::new(0)),
            every: every.filter(|n| *n > 0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Count one archived image, waking the manager every `every` writes.
    pub fn record_write(&self) {
        let written = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.every {
            if written % every == 0 {
                self.notify.notify_one();
            }
        }
    }

    /// Images archived since startup.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Periodically enforces the archive quota.
pub struct RetentionManager {
    root: PathBuf,
    max_bytes: u64,
    interval: Duration,
    trigger: RetentionTrigger,
}

impl RetentionManager {
    pub fn new(
        root: impl Into<PathBuf>,
        max_bytes: u64,
        interval: Duration,
        sweep_every_writes: Option<u64>,
    ) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            interval,
            trigger: RetentionTrigger::new(sweep_every_writes),
        }
    }

    /// Handle to hand to the archive.
    pub fn trigger(&self) -> RetentionTrigger {
        self.trigger.clone()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Run one sweep against today's UTC date.
    pub async fn sweep(&self) -> Result<EvictionReport, RetentionError> {
        enforce_quota(&self.root, self.max_bytes, Utc::now().date_naive()).await
    }

    async fn sweep_and_log(&self) {
        match self.sweep().await {
            Ok(report) => {
                metrics::gauge!("receiver.archive.bytes").set(report.usage_after as f64);
                if !report.evicted.is_empty() {
                    metrics::counter!("receiver.retention.buckets_evicted")
                        .increment(report.evicted.len() as u64);
                    info!(
                        usage_before = report.usage_before,
                        usage_after = report.usage_after,
                        max_bytes = self.max_bytes,
                        evicted = ?report.evicted,
                        "Evicted day buckets"
                    );
                }
                if report.usage_after > self.max_bytes {
                    warn!(
                        usage = report.usage_after,
                        max_bytes = self.max_bytes,
                        "Archive still over quota, only buckets older than today can be evicted"
                    );
                } else {
                    debug!(usage = report.usage_after, "Archive within quota");
                }
            }
            Err(e) => {
                metrics::counter!("receiver.retention.errors").increment(1);
                error!(error = %e, "Retention sweep failed, skipping until next attempt");
            }
        }
    }

    /// Sweep on every interval tick and write-count trigger until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            root = %self.root.display(),
            max_bytes = self.max_bytes,
            interval_secs = self.interval.as_secs(),
            "Starting retention manager"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notify.notified() => {}
            }
            self.sweep_and_log().await;
        }

        info!("Retention manager stopped");
    }
}
