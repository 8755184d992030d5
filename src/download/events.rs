//! Engine event fabric: one bounded broadcast every observer subscribes to.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::download::model::{Download, DownloadState};

/// Capacity of the shared broadcast ring. Publishing never blocks; a
/// subscriber that falls more than this many events behind loses its oldest
/// ones, so lifecycle events survive any realistic lag.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Status,
    Paused,
    Resumed,
    Completed,
    Error,
}

/// One engine event: which download, what happened, and a full snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadEvent {
    #[serde(rename = "downloadId")]
    pub download_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Download,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    /// Non-blocking publish; a send error only means nobody is listening.
    pub fn publish(&self, kind: EventKind, state: &DownloadState) {
        let _ = self.tx.send(DownloadEvent {
            download_id: state.id.clone(),
            kind,
            data: state.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_to_the_push_envelope() {
        let state = DownloadState::new(
            "dl-42".to_string(),
            "http://origin.test/file.bin".to_string(),
            "file.bin".to_string(),
            std::path::PathBuf::from("downloads/file.bin"),
            4,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(600),
        );
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EventKind::Status, &state);
        let event = rx.try_recv().unwrap();

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["downloadId"], "dl-42");
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["filename"], "file.bin");
        assert_eq!(json["data"]["status"], "pending");
        assert_eq!(json["data"]["connectTimeout"], "30s");
    }

    #[test]
    fn publish_without_subscribers_does_not_block_or_panic() {
        let state = DownloadState::new(
            "dl-0".to_string(),
            "http://origin.test/x".to_string(),
            "x".to_string(),
            std::path::PathBuf::from("downloads/x"),
            1,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(600),
        );
        let bus = EventBus::new();
        bus.publish(EventKind::Progress, &state);
    }
}
