//! Engine-owned download state and the wire snapshots derived from it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::download::progress::ChunkProgress;
use crate::util;

/// Lifecycle of a download. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Waiting,
    Downloading,
    Completed,
    Failed,
}

/// Wire snapshot of one chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSnapshot {
    pub id: usize,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub downloaded_bytes: u64,
    pub rate_bps: f64,
    pub status: ChunkStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub backing_path: String,
}

/// Wire snapshot of a download, returned by the API and carried on every
/// broadcast event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub output_path: String,
    pub requested_chunks: usize,
    pub total_size: u64,
    pub supports_range: bool,
    pub status: DownloadStatus,
    pub progress_pct: f64,
    pub downloaded_bytes: u64,
    pub speed_bps: f64,
    #[serde(rename = "timeRemaining")]
    pub time_remaining_s: Option<u64>,
    pub chunks: Vec<ChunkSnapshot>,
    pub connect_timeout: String,
    pub read_timeout: String,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields written by the controller, read under a brief lock.
struct Core {
    status: DownloadStatus,
    total_size: u64,
    supports_range: bool,
    speed_bps: f64,
    time_remaining_s: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

/// Shared state for one download. The controller task is the only writer of
/// `core`; fetcher workers touch nothing but their own chunk's atomic
/// counter. Neither lock is ever held across I/O.
pub struct DownloadState {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub output_path: PathBuf,
    pub requested_chunks: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    core: RwLock<Core>,
    chunks: RwLock<Vec<Arc<ChunkProgress>>>,
}

impl DownloadState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        url: String,
        filename: String,
        output_path: PathBuf,
        requested_chunks: usize,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            id,
            url,
            filename,
            output_path,
            requested_chunks,
            connect_timeout,
            read_timeout,
            core: RwLock::new(Core {
                status: DownloadStatus::Pending,
                total_size: 0,
                supports_range: false,
                speed_bps: 0.0,
                time_remaining_s: None,
                started_at: None,
                error_message: None,
            }),
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.core.read().status
    }

    pub fn total_size(&self) -> u64 {
        self.core.read().total_size
    }

    /// Move to `to` unless a terminal state was already reached. Returns
    /// whether the transition happened.
    pub fn transition(&self, to: DownloadStatus) -> bool {
        let mut core = self.core.write();
        if core.status.is_terminal() {
            return false;
        }
        core.status = to;
        if to == DownloadStatus::Downloading && core.started_at.is_none() {
            core.started_at = Some(Utc::now());
        }
        true
    }

    /// Terminal error transition; no-op when already terminal.
    pub fn fail(&self, message: String) -> bool {
        let mut core = self.core.write();
        if core.status.is_terminal() {
            return false;
        }
        core.status = DownloadStatus::Error;
        core.error_message = Some(message);
        core.speed_bps = 0.0;
        core.time_remaining_s = None;
        true
    }

    pub fn set_probe_result(&self, total_size: u64, supports_range: bool) {
        let mut core = self.core.write();
        core.total_size = total_size;
        core.supports_range = supports_range;
    }

    pub fn set_chunks(&self, chunks: Vec<Arc<ChunkProgress>>) {
        *self.chunks.write() = chunks;
    }

    /// Sum of the per-chunk atomic counters. This is the source of truth
    /// for overall progress, never a value back-computed from a percentage.
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks.read().iter().map(|c| c.downloaded()).sum()
    }

    pub fn update_rates(&self, speed_bps: f64, time_remaining_s: Option<u64>) {
        let mut core = self.core.write();
        core.speed_bps = speed_bps;
        core.time_remaining_s = time_remaining_s;
    }

    pub fn snapshot(&self) -> Download {
        let chunks: Vec<ChunkSnapshot> = self.chunks.read().iter().map(|c| c.snapshot()).collect();
        let core = self.core.read();

        let downloaded = if core.status == DownloadStatus::Completed {
            core.total_size
        } else {
            chunks.iter().map(|c| c.downloaded_bytes).sum()
        };
        let progress_pct = if core.status == DownloadStatus::Completed {
            100.0
        } else if core.total_size > 0 {
            (downloaded as f64 / core.total_size as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Download {
            id: self.id.clone(),
            url: self.url.clone(),
            filename: self.filename.clone(),
            output_path: self.output_path.display().to_string(),
            requested_chunks: self.requested_chunks,
            total_size: core.total_size,
            supports_range: core.supports_range,
            status: core.status,
            progress_pct,
            downloaded_bytes: downloaded,
            speed_bps: core.speed_bps,
            time_remaining_s: core.time_remaining_s,
            chunks,
            connect_timeout: util::format_duration(self.connect_timeout),
            read_timeout: util::format_duration(self.read_timeout),
            started_at: core.started_at,
            error_message: core.error_message.clone(),
        }
    }
}
