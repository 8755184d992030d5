//! Streams one HTTP response body into a backing file, honoring pause,
//! cancellation and the inactivity timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::download::error::DownloadError;
use crate::download::model::ChunkStatus;
use crate::download::progress::ChunkProgress;
use crate::download::task::PauseGate;

/// Workers publish an extra progress event whenever this many new bytes
/// landed since the last one, keeping per-chunk bars fluid even if the
/// ticker is briefly starved.
const PUBLISH_BYTE_INTERVAL: u64 = 1024 * 1024;

/// Slack between the advertised range size and the bytes actually received,
/// for origins that report an off-by-one end byte.
const SIZE_TOLERANCE: u64 = 1024;

pub struct FetchOptions {
    pub connect_timeout: Duration,
    /// Inactivity bound: the fetch fails only when this much time passes
    /// without a single byte, never on a slow but steady transfer.
    pub read_timeout: Duration,
    /// Ranged request requiring `206 Partial Content` when true; plain GET
    /// accepting `200 OK` otherwise.
    pub ranged: bool,
    /// Expected body length when known. `None` only on the single-file
    /// path against an origin that omitted Content-Length.
    pub expected: Option<u64>,
}

/// Fetch one chunk into its backing file, tracking status transitions on
/// the way out. A cancelled fetch leaves the chunk status untouched; the
/// controller owns cleanup.
pub async fn fetch_chunk<F>(
    client: &Client,
    url: &str,
    chunk: &Arc<ChunkProgress>,
    opts: &FetchOptions,
    gate: &PauseGate,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<(), DownloadError>
where
    F: Fn(),
{
    chunk.set_status(ChunkStatus::Downloading);

    let result = stream_body(client, url, chunk, opts, gate, cancel, &on_progress).await;
    match &result {
        Ok(()) => chunk.set_status(ChunkStatus::Completed),
        Err(DownloadError::Cancelled) => {}
        Err(_) => chunk.set_status(ChunkStatus::Failed),
    }
    result
}

async fn stream_body<F>(
    client: &Client,
    url: &str,
    chunk: &Arc<ChunkProgress>,
    opts: &FetchOptions,
    gate: &PauseGate,
    cancel: &CancellationToken,
    on_progress: &F,
) -> Result<(), DownloadError>
where
    F: Fn(),
{
    let mut request = client.get(url);
    if opts.ranged {
        request = request.header(
            header::RANGE,
            format!("bytes={}-{}", chunk.range.start, chunk.range.end),
        );
    }

    // The client bounds the TCP connect; this bounds the wait for response
    // headers.
    let response = match timeout(opts.connect_timeout, request.send()).await {
        Ok(response) => response?,
        Err(_) => return Err(DownloadError::ConnectTimeout),
    };

    let status = response.status();
    let acceptable = if opts.ranged {
        status == StatusCode::PARTIAL_CONTENT
    } else {
        status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT
    };
    if !acceptable {
        return Err(DownloadError::ChunkHttpStatus {
            index: chunk.index,
            status,
        });
    }

    if let Some(parent) = chunk.backing_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(&chunk.backing_path).await?;
    let mut stream = response.bytes_stream();

    let mut written: u64 = 0;
    let mut since_publish: u64 = 0;
    let mut last_activity = Instant::now();

    loop {
        // Suspension point before the read. Time spent parked at the gate
        // does not count as inactivity.
        if wait_if_paused(gate, cancel).await? {
            last_activity = Instant::now();
        }

        let idle_budget = opts
            .read_timeout
            .checked_sub(last_activity.elapsed())
            .ok_or(DownloadError::InactivityTimeout(opts.read_timeout))?;

        let item = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = timeout(idle_budget, stream.next()) => match next {
                Ok(item) => item,
                Err(_) => return Err(DownloadError::InactivityTimeout(opts.read_timeout)),
            },
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(e.into()),
            None => break,
        };
        last_activity = Instant::now();

        // Suspension point before the write: a pause issued mid-read keeps
        // new bytes off the backing store until resume.
        wait_if_paused(gate, cancel).await?;

        file.write_all(&bytes).await?;
        written += bytes.len() as u64;
        chunk.add_bytes(bytes.len() as u64);

        since_publish += bytes.len() as u64;
        if since_publish >= PUBLISH_BYTE_INTERVAL {
            since_publish = 0;
            on_progress();
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected) = opts.expected {
        if expected.abs_diff(written) > SIZE_TOLERANCE {
            return Err(DownloadError::ChunkIncomplete {
                index: chunk.index,
                expected,
                actual: written,
            });
        }
    }

    debug!(chunk = chunk.index, written, "chunk body drained");
    Ok(())
}

/// Parks while the pause gate is closed; returns whether it parked.
async fn wait_if_paused(
    gate: &PauseGate,
    cancel: &CancellationToken,
) -> Result<bool, DownloadError> {
    if !gate.is_paused() {
        return Ok(false);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        _ = gate.wait_while_paused() => Ok(true),
    }
}
