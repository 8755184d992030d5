//! Per-download controller: drives probe, partition, fetch workers, the
//! progress ticker, merge and cleanup through the download state machine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::download::error::DownloadError;
use crate::download::events::{EventBus, EventKind};
use crate::download::fetch::{self, FetchOptions};
use crate::download::merge::{self, MergeProgress};
use crate::download::model::{DownloadState, DownloadStatus};
use crate::download::partition::{partition, ByteRange};
use crate::download::progress::{ChunkProgress, SpeedSampler};

const USER_AGENT: &str = concat!("TurboDL/", env!("CARGO_PKG_VERSION"));
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Cooperative pause flag. Workers check it at every suspension point and
/// park on the notify until resumed; pausing never cancels in-flight work.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            // Re-check after arming the waiter so a racing resume is never
            // missed.
            if !self.paused.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

pub struct DownloadTask {
    state: Arc<DownloadState>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    bus: EventBus,
    temp_dir: PathBuf,
}

impl DownloadTask {
    pub fn new(
        state: Arc<DownloadState>,
        gate: Arc<PauseGate>,
        cancel: CancellationToken,
        bus: EventBus,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            gate,
            cancel,
            bus,
            temp_dir,
        }
    }

    pub async fn run(self) {
        match self.execute().await {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => {
                info!(id = %self.state.id, "download cancelled");
                self.cleanup_partial_output().await;
                self.cleanup_backing_files().await;
            }
            Err(e) => {
                let message = e.to_string();
                error!(id = %self.state.id, "download failed: {message}");
                // Temporaries are gone before the state turns terminal.
                self.cleanup_partial_output().await;
                self.cleanup_backing_files().await;
                if self.state.fail(message) {
                    self.bus.publish(EventKind::Error, &self.state);
                }
            }
        }
    }

    async fn execute(&self) -> Result<(), DownloadError> {
        if !self.state.transition(DownloadStatus::Downloading) {
            // Deleted before the controller got scheduled.
            return Err(DownloadError::Cancelled);
        }
        self.bus.publish(EventKind::Status, &self.state);

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.state.connect_timeout)
            .build()?;

        let (total_size, supports_range) = self.probe(&client).await?;
        self.state.set_probe_result(total_size, supports_range);

        let chunked = supports_range && self.state.requested_chunks > 1;
        if !supports_range && self.state.requested_chunks > 1 {
            info!(
                id = %self.state.id,
                "origin does not accept range requests, falling back to a single connection"
            );
        }

        let chunks = self.build_chunks(total_size, chunked);
        self.state.set_chunks(chunks.clone());

        let ticker = self.spawn_ticker();
        let worker_cancel = self.cancel.child_token();

        let fetched = self
            .run_workers(&client, &chunks, chunked, &worker_cancel)
            .await;
        let outcome = match fetched {
            Ok(()) if chunked => self.merge(&chunks, total_size).await,
            other => other,
        };

        // Stop the ticker before any terminal event so nothing trails a
        // `completed` or `error` broadcast for this id.
        ticker.abort();
        let _ = ticker.await;

        outcome?;

        self.state.update_rates(0.0, None);
        if !self.state.transition(DownloadStatus::Completed) {
            return Err(DownloadError::Cancelled);
        }
        // The merge (or the single-file fetch) has already fsynced the
        // output by this point.
        self.bus.publish(EventKind::Completed, &self.state);
        info!(
            id = %self.state.id,
            path = %self.state.output_path.display(),
            "download completed"
        );
        Ok(())
    }

    /// HEAD the origin for size and range support.
    async fn probe(&self, client: &Client) -> Result<(u64, bool), DownloadError> {
        let request = client.head(&self.state.url).send();
        let response = match timeout(self.state.connect_timeout, request).await {
            Ok(response) => response.map_err(|e| DownloadError::ProbeFailed(e.to_string()))?,
            Err(_) => {
                return Err(DownloadError::ProbeFailed(
                    "timed out waiting for origin headers".to_string(),
                ))
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::ProbeFailed(format!(
                "origin returned status {status}"
            )));
        }

        let total_size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if total_size == 0 {
            return Err(DownloadError::ProbeUnknownSize);
        }

        let supports_range = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        info!(id = %self.state.id, total_size, supports_range, "probe complete");
        Ok((total_size, supports_range))
    }

    fn build_chunks(&self, total_size: u64, chunked: bool) -> Vec<Arc<ChunkProgress>> {
        if !chunked {
            // The single connection streams straight into the output file.
            let range = ByteRange {
                start: 0,
                end: total_size - 1,
            };
            return vec![Arc::new(ChunkProgress::new(
                0,
                range,
                self.state.output_path.clone(),
            ))];
        }

        partition(total_size, self.state.requested_chunks)
            .into_iter()
            .enumerate()
            .map(|(i, range)| Arc::new(ChunkProgress::new(i, range, self.backing_path(i))))
            .collect()
    }

    fn backing_path(&self, index: usize) -> PathBuf {
        self.temp_dir
            .join(format!("chunk_{}_{}.tmp", self.state.id, index))
    }

    /// One fetcher per chunk, all in parallel. The first fatal failure
    /// cancels the siblings; the workers are always drained before
    /// returning.
    async fn run_workers(
        &self,
        client: &Client,
        chunks: &[Arc<ChunkProgress>],
        chunked: bool,
        worker_cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if chunked {
            tokio::fs::create_dir_all(&self.temp_dir).await?;
        } else if let Some(parent) = self.state.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut workers = JoinSet::new();
        for chunk in chunks {
            let chunk = Arc::clone(chunk);
            let opts = FetchOptions {
                connect_timeout: self.state.connect_timeout,
                read_timeout: self.state.read_timeout,
                ranged: chunked,
                expected: Some(chunk.size()),
            };
            let client = client.clone();
            let url = self.state.url.clone();
            let gate = Arc::clone(&self.gate);
            let cancel = worker_cancel.clone();
            let bus = self.bus.clone();
            let state = Arc::clone(&self.state);

            workers.spawn(async move {
                fetch::fetch_chunk(&client, &url, &chunk, &opts, &gate, &cancel, || {
                    bus.publish(EventKind::Progress, &state);
                })
                .await
            });
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(DownloadError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = outcome {
                if first_error.is_none() && !matches!(e, DownloadError::Cancelled) {
                    warn!(id = %self.state.id, "worker failed, cancelling siblings: {e}");
                    first_error = Some(e);
                    worker_cancel.cancel();
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Recomputes aggregates at 4 Hz and publishes a progress event until
    /// the download reaches a terminal state. Runs through pauses so the
    /// published speed falls to zero within one tick.
    fn spawn_ticker(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut sampler = SpeedSampler::new();
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if state.status().is_terminal() {
                    break;
                }

                let downloaded = state.downloaded_bytes();
                let speed = sampler.sample(downloaded);
                let total = state.total_size();
                let remaining = if speed > 0.0 && total > downloaded {
                    Some(((total - downloaded) as f64 / speed).round() as u64)
                } else {
                    None
                };
                state.update_rates(speed, remaining);
                bus.publish(EventKind::Progress, &state);
            }
        })
    }

    async fn merge(
        &self,
        chunks: &[Arc<ChunkProgress>],
        total_size: u64,
    ) -> Result<(), DownloadError> {
        let backing: Vec<PathBuf> = chunks.iter().map(|c| c.backing_path.clone()).collect();
        let progress = MergeProgress::default();

        info!(id = %self.state.id, chunks = backing.len(), "merging chunks");
        merge::merge_with_retry(&self.state.output_path, &backing, total_size, &progress).await?;
        info!(id = %self.state.id, merged = progress.merged(), "merge verified");

        // Backing files outlive every retry; only a fully verified merge may
        // remove them.
        for path in &backing {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("failed to remove backing file {}: {e}", path.display());
            }
        }
        Ok(())
    }

    async fn cleanup_backing_files(&self) {
        for index in 0..self.state.requested_chunks {
            let path = self.backing_path(index);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {e}", path.display()),
            }
        }
    }

    /// A cancelled or failed download leaves no half-written artifact
    /// behind; completed outputs are never touched.
    async fn cleanup_partial_output(&self) {
        if self.state.status() == DownloadStatus::Completed {
            return;
        }
        match tokio::fs::remove_file(&self.state.output_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "failed to remove partial output {}: {e}",
                self.state.output_path.display()
            ),
        }
    }
}
