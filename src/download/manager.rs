//! Process-wide download registry and the operations the API exposes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::download::error::RegistryError;
use crate::download::events::{DownloadEvent, EventBus, EventKind};
use crate::download::model::{Download, DownloadState, DownloadStatus};
use crate::download::task::{DownloadTask, PauseGate};

/// Upper bound on chunks per download.
pub const MAX_CHUNKS: usize = 16;

/// Everything the registry needs to create one download.
pub struct DownloadRequest {
    pub url: String,
    pub filename: Option<String>,
    pub chunks: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

struct Entry {
    state: Arc<DownloadState>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    downloads: RwLock<HashMap<String, Arc<Entry>>>,
    download_dir: PathBuf,
    temp_dir: PathBuf,
}

/// Registry plus broadcast bus; cheap to clone and share.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
    bus: EventBus,
}

impl DownloadManager {
    pub fn new(download_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                downloads: RwLock::new(HashMap::new()),
                download_dir,
                temp_dir,
            }),
            bus: EventBus::new(),
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.bus.subscribe()
    }

    /// Validate, register and start a new download.
    pub fn add(&self, req: DownloadRequest) -> Result<Download, RegistryError> {
        if req.url.trim().is_empty() {
            return Err(RegistryError::InvalidRequest(
                "url must not be empty".to_string(),
            ));
        }
        match url::Url::parse(&req.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(RegistryError::InvalidRequest(format!(
                    "unsupported url scheme '{}'",
                    parsed.scheme()
                )))
            }
            Err(e) => {
                return Err(RegistryError::InvalidRequest(format!("invalid url: {e}")));
            }
        }
        if req.chunks < 1 || req.chunks > MAX_CHUNKS {
            return Err(RegistryError::InvalidRequest(format!(
                "chunks must be between 1 and {MAX_CHUNKS}"
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let filename = match req.filename {
            Some(name) if !name.trim().is_empty() => name,
            _ => extract_filename(&req.url).unwrap_or_else(|| format!("download_{id}")),
        };
        let output_path = self.inner.download_dir.join(&filename);

        let state = Arc::new(DownloadState::new(
            id.clone(),
            req.url,
            filename,
            output_path,
            req.chunks,
            req.connect_timeout,
            req.read_timeout,
        ));
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();

        let task = DownloadTask::new(
            Arc::clone(&state),
            Arc::clone(&gate),
            cancel.clone(),
            self.bus.clone(),
            self.inner.temp_dir.clone(),
        );
        let handle = tokio::spawn(task.run());

        let entry = Arc::new(Entry {
            state: Arc::clone(&state),
            gate,
            cancel,
            task: Mutex::new(Some(handle)),
        });
        self.inner.downloads.write().insert(id.clone(), entry);

        info!(id = %id, url = %state.url, chunks = req.chunks, "download registered");
        Ok(state.snapshot())
    }

    pub fn list(&self) -> Vec<Download> {
        self.inner
            .downloads
            .read()
            .values()
            .map(|entry| entry.state.snapshot())
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Download, RegistryError> {
        self.entry(id).map(|entry| entry.state.snapshot())
    }

    /// Park the controller's workers at their next suspension point. Valid
    /// only while downloading.
    pub fn pause(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self.entry(id)?;
        if entry.state.status() != DownloadStatus::Downloading {
            return Err(RegistryError::InvalidState(format!(
                "cannot pause a download that is {}",
                entry.state.status().as_str()
            )));
        }
        entry.gate.pause();
        entry.state.transition(DownloadStatus::Paused);
        self.bus.publish(EventKind::Paused, &entry.state);
        info!(id, "download paused");
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self.entry(id)?;
        if entry.state.status() != DownloadStatus::Paused {
            return Err(RegistryError::InvalidState(format!(
                "cannot resume a download that is {}",
                entry.state.status().as_str()
            )));
        }
        entry.state.transition(DownloadStatus::Downloading);
        entry.gate.resume();
        self.bus.publish(EventKind::Resumed, &entry.state);
        info!(id, "download resumed");
        Ok(())
    }

    /// Cancel any active work, wait for the controller to wind down, drop
    /// the registry entry. A completed download keeps its artifact on disk;
    /// deletion removes engine state only.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self
            .inner
            .downloads
            .write()
            .remove(id)
            .ok_or(RegistryError::NotFound)?;

        entry.state.transition(DownloadStatus::Cancelled);
        entry.cancel.cancel();

        let handle = entry.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(id, "controller task ended abnormally: {e}");
                }
            }
        }

        info!(id, "download removed");
        Ok(())
    }

    /// Open the completed artifact for streaming.
    pub async fn open_completed(
        &self,
        id: &str,
    ) -> Result<(String, tokio::fs::File), RegistryError> {
        let entry = self.entry(id)?;
        if entry.state.status() != DownloadStatus::Completed {
            return Err(RegistryError::InvalidState(
                "download is not completed".to_string(),
            ));
        }
        let file = tokio::fs::File::open(&entry.state.output_path).await?;
        Ok((entry.state.filename.clone(), file))
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>, RegistryError> {
        self.inner
            .downloads
            .read()
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }
}

/// Derive a display filename from the URL path leaf.
fn extract_filename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::events::EventKind;
    use crate::download::testsupport::{spawn_origin, test_body, Origin};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    struct Fixture {
        manager: DownloadManager,
        download_dir: PathBuf,
        temp_dir: PathBuf,
        _root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let download_dir = root.path().join("downloads");
        let temp_dir = root.path().join("tmp");
        Fixture {
            manager: DownloadManager::new(download_dir.clone(), temp_dir.clone()),
            download_dir,
            temp_dir,
            _root: root,
        }
    }

    fn request(url: &str, chunks: usize) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            filename: Some("out.bin".to_string()),
            chunks,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_status(
        manager: &DownloadManager,
        id: &str,
        wanted: DownloadStatus,
    ) -> Download {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snap = manager.get(id).expect("download should exist");
            if snap.status == wanted {
                return snap;
            }
            assert!(
                !(snap.status.is_terminal() && snap.status != wanted),
                "reached {:?} while waiting for {:?}: {:?}",
                snap.status,
                wanted,
                snap.error_message
            );
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {wanted:?}, last status {:?}",
                snap.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn leftover_temp_files(dir: &PathBuf) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn filename_extraction_prefers_the_url_leaf() {
        assert_eq!(
            extract_filename("http://host/files/video%20file.mp4"),
            Some("video file.mp4".to_string())
        );
        assert_eq!(
            extract_filename("http://host/files/archive.tar.gz/"),
            Some("archive.tar.gz".to_string())
        );
        assert_eq!(extract_filename("http://host/"), None);
    }

    #[tokio::test]
    async fn add_rejects_bad_requests() {
        let fx = fixture();

        let empty = fx.manager.add(request("", 4)).unwrap_err();
        assert!(matches!(empty, RegistryError::InvalidRequest(_)));

        let scheme = fx.manager.add(request("ftp://host/file", 4)).unwrap_err();
        assert!(matches!(scheme, RegistryError::InvalidRequest(_)));

        let zero = fx.manager.add(request("http://host/file", 0)).unwrap_err();
        assert!(matches!(zero, RegistryError::InvalidRequest(_)));

        let many = fx.manager.add(request("http://host/file", 17)).unwrap_err();
        assert!(matches!(many, RegistryError::InvalidRequest(_)));

        assert!(fx.manager.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.get("nope"),
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            fx.manager.pause("nope"),
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            fx.manager.resume("nope"),
            Err(RegistryError::NotFound)
        ));
        assert!(matches!(
            fx.manager.delete("nope").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn chunked_download_completes_byte_identical() {
        let body = test_body(1_000_003);
        let url = spawn_origin(Origin::new(body.clone())).await;
        let fx = fixture();
        let mut events = fx.manager.subscribe();

        let added = fx.manager.add(request(&url, 4)).unwrap();
        let snap = wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;

        assert_eq!(snap.total_size, 1_000_003);
        assert!(snap.supports_range);
        assert_eq!(snap.downloaded_bytes, 1_000_003);
        assert_eq!(snap.progress_pct, 100.0);
        assert_eq!(snap.chunks.len(), 4);
        assert_eq!(snap.chunks[0].size, 250_000);
        assert_eq!(snap.chunks[3].size, 250_003);

        let written = std::fs::read(fx.download_dir.join("out.bin")).unwrap();
        assert_eq!(written, body);

        assert!(
            leftover_temp_files(&fx.temp_dir).is_empty(),
            "backing files must not survive completion"
        );

        // Event stream: FIFO, a status event first, exactly one completed
        // event and nothing after it for this id.
        let mut kinds = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    assert_eq!(event.download_id, added.id);
                    kinds.push(event.kind);
                    if event.kind == EventKind::Completed {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("bus closed before completion"),
            }
        }
        assert_eq!(kinds.first(), Some(&EventKind::Status));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Completed).count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn missing_range_support_falls_back_to_a_single_connection() {
        let body = test_body(500_000);
        let mut origin = Origin::new(body.clone());
        origin.support_ranges = false;
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 8)).unwrap();
        let snap = wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;

        assert!(!snap.supports_range);
        assert_eq!(snap.requested_chunks, 8);
        assert_eq!(snap.chunks.len(), 1);
        assert_eq!(snap.progress_pct, 100.0);

        let written = std::fs::read(fx.download_dir.join("out.bin")).unwrap();
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn single_chunk_sends_no_range_header() {
        let body = test_body(100_000);
        let mut origin = Origin::new(body.clone());
        origin.reject_range_header = true;
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 1)).unwrap();
        wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;

        let written = std::fs::read(fx.download_dir.join("out.bin")).unwrap();
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn ranged_200_response_fails_the_chunked_path() {
        let mut origin = Origin::new(test_body(200_000));
        origin.ignore_ranges = true;
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 4)).unwrap();
        let snap = wait_for_status(&fx.manager, &added.id, DownloadStatus::Error).await;

        assert!(snap.error_message.unwrap().contains("200"));
        assert!(leftover_temp_files(&fx.temp_dir).is_empty());
    }

    #[tokio::test]
    async fn stalled_chunk_times_out_and_cleans_up() {
        let mut origin = Origin::new(test_body(400_000));
        origin.stall_after = Some(64);
        let url = spawn_origin(origin).await;
        let fx = fixture();
        let mut events = fx.manager.subscribe();

        let mut req = request(&url, 4);
        req.read_timeout = Duration::from_millis(300);
        let added = fx.manager.add(req).unwrap();

        let snap = wait_for_status(&fx.manager, &added.id, DownloadStatus::Error).await;
        assert!(snap.error_message.unwrap().contains("no data received"));
        assert!(leftover_temp_files(&fx.temp_dir).is_empty());
        assert!(!fx.download_dir.join("out.bin").exists());

        let saw_error_event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == EventKind::Error => break true,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_error_event);
    }

    #[tokio::test]
    async fn probe_of_an_empty_body_reports_unknown_size() {
        let url = spawn_origin(Origin::new(Vec::new())).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 2)).unwrap();
        let snap = wait_for_status(&fx.manager, &added.id, DownloadStatus::Error).await;
        assert!(snap
            .error_message
            .unwrap()
            .contains("could not determine file size"));
    }

    #[tokio::test]
    async fn pause_freezes_bytes_and_resume_completes() {
        let body = test_body(150);
        let mut origin = Origin::new(body.clone());
        origin.trickle = Some(Duration::from_millis(10));
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 1)).unwrap();

        // Let some bytes land, then pause mid-transfer.
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.manager.pause(&added.id).unwrap();
        assert!(matches!(
            fx.manager.pause(&added.id),
            Err(RegistryError::InvalidState(_))
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frozen = fx.manager.get(&added.id).unwrap();
        assert_eq!(frozen.status, DownloadStatus::Paused);
        assert!(frozen.downloaded_bytes > 0);
        assert!(frozen.downloaded_bytes < body.len() as u64);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let still = fx.manager.get(&added.id).unwrap();
        assert_eq!(still.downloaded_bytes, frozen.downloaded_bytes);
        // The sampler sees no delta within the next tick.
        assert_eq!(still.speed_bps, 0.0);

        fx.manager.resume(&added.id).unwrap();
        let done = wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;
        assert_eq!(done.downloaded_bytes, body.len() as u64);

        let written = std::fs::read(fx.download_dir.join("out.bin")).unwrap();
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn resume_requires_a_paused_download() {
        let body = test_body(400);
        let mut origin = Origin::new(body);
        origin.trickle = Some(Duration::from_millis(10));
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            fx.manager.resume(&added.id),
            Err(RegistryError::InvalidState(_))
        ));
        fx.manager.delete(&added.id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_during_transfer_cancels_and_cleans_up() {
        let mut origin = Origin::new(test_body(2000));
        origin.trickle = Some(Duration::from_millis(5));
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 4)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        fx.manager.delete(&added.id).await.unwrap();

        assert!(matches!(
            fx.manager.get(&added.id),
            Err(RegistryError::NotFound)
        ));
        assert!(leftover_temp_files(&fx.temp_dir).is_empty());
        assert!(!fx.download_dir.join("out.bin").exists());
    }

    #[tokio::test]
    async fn delete_after_completion_keeps_the_artifact() {
        let body = test_body(50_000);
        let url = spawn_origin(Origin::new(body.clone())).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 2)).unwrap();
        wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;

        fx.manager.delete(&added.id).await.unwrap();

        assert!(matches!(
            fx.manager.get(&added.id),
            Err(RegistryError::NotFound)
        ));
        let written = std::fs::read(fx.download_dir.join("out.bin")).unwrap();
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn open_completed_streams_only_finished_downloads() {
        let body = test_body(10_000);
        let mut origin = Origin::new(body.clone());
        origin.trickle = Some(Duration::from_millis(5));
        let url = spawn_origin(origin).await;
        let fx = fixture();

        let added = fx.manager.add(request(&url, 1)).unwrap();
        assert!(matches!(
            fx.manager.open_completed(&added.id).await,
            Err(RegistryError::InvalidState(_))
        ));
        fx.manager.delete(&added.id).await.unwrap();

        let quick_url = spawn_origin(Origin::new(body.clone())).await;
        let added = fx.manager.add(request(&quick_url, 2)).unwrap();
        wait_for_status(&fx.manager, &added.id, DownloadStatus::Completed).await;

        let (filename, mut file) = fx.manager.open_completed(&added.id).await.unwrap();
        assert_eq!(filename, "out.bin");

        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, body);
    }
}
