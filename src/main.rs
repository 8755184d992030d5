//! TurboDL - a chunked HTTP download engine with a web API
//!
//! Probes an origin for size and range support, fetches the body as parallel
//! byte ranges, reassembles it on disk, and exposes live per-chunk progress
//! over REST and WebSocket.

mod config;
mod download;
mod server;
mod util;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Settings;
use crate::download::DownloadManager;

/// Application state shared across all components
pub struct AppState {
    pub settings: RwLock<Settings>,
    pub manager: DownloadManager,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let manager = DownloadManager::new(
            settings.downloads.directory.clone(),
            settings.downloads.temp_directory.clone(),
        );
        Self {
            settings: RwLock::new(settings),
            manager,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting TurboDL v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = config::load_or_create_default()?;
    info!("Configuration loaded from {:?}", config::config_path());

    std::fs::create_dir_all(&settings.downloads.directory)?;
    std::fs::create_dir_all(&settings.downloads.temp_directory)?;

    // Create shared application state
    let state = Arc::new(AppState::new(settings));

    server::run(state).await
}
