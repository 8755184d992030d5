//! Per-chunk accounting and the overall speed sampler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::download::model::{ChunkSnapshot, ChunkStatus};
use crate::download::partition::ByteRange;

/// Progress accounting for one chunk. The fetcher worker is the only writer
/// of the byte counter; everyone else reads.
pub struct ChunkProgress {
    pub index: usize,
    pub range: ByteRange,
    pub backing_path: PathBuf,
    downloaded: AtomicU64,
    status: RwLock<ChunkStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl ChunkProgress {
    pub fn new(index: usize, range: ByteRange, backing_path: PathBuf) -> Self {
        Self {
            index,
            range,
            backing_path,
            downloaded: AtomicU64::new(0),
            status: RwLock::new(ChunkStatus::Waiting),
            started_at: RwLock::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.range.len()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Monotonic; called from the fetcher on every successful read.
    pub fn add_bytes(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn status(&self) -> ChunkStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ChunkStatus) {
        *self.status.write() = status;
        if status == ChunkStatus::Downloading {
            let mut started = self.started_at.write();
            if started.is_none() {
                *started = Some(Utc::now());
            }
        }
    }

    /// Average rate since the chunk started downloading.
    pub fn rate_bps(&self) -> f64 {
        let started = match *self.started_at.read() {
            Some(at) => at,
            None => return 0.0,
        };
        let elapsed = (Utc::now() - started).num_seconds().max(1);
        self.downloaded() as f64 / elapsed as f64
    }

    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            id: self.index,
            start: self.range.start,
            end: self.range.end,
            size: self.size(),
            downloaded_bytes: self.downloaded().min(self.size()),
            rate_bps: self.rate_bps(),
            status: self.status(),
            started_at: *self.started_at.read(),
            backing_path: self.backing_path.display().to_string(),
        }
    }
}

/// Derives bytes/sec from the delta between consecutive observations, so a
/// paused download reads as zero within one tick instead of decaying an
/// all-time average.
pub struct SpeedSampler {
    last_bytes: u64,
    last_at: Instant,
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_at: Instant::now(),
        }
    }

    pub fn sample(&mut self, now_bytes: u64) -> f64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_at).as_secs_f64();
        if dt <= 0.0 {
            return 0.0;
        }
        let delta = now_bytes.saturating_sub(self.last_bytes);
        self.last_bytes = now_bytes;
        self.last_at = now;
        delta as f64 / dt
    }
}
