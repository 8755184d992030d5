//! Settings data structures

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util;

/// Fallbacks when a configured duration fails to parse.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerSettings,

    /// Download defaults and storage locations
    pub downloads: DownloadSettings,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to (0.0.0.0 for LAN access)
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Download engine defaults and storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Destination folder for completed downloads
    pub directory: PathBuf,

    /// Scratch folder for chunk backing files
    pub temp_directory: PathBuf,

    /// Chunk count used when a request does not specify one
    pub default_chunks: usize,

    /// Connection / response-header timeout, e.g. "30s"
    pub connect_timeout: String,

    /// Per-chunk inactivity timeout, e.g. "10m"
    pub read_timeout: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let directory = dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads"));
        Self {
            directory,
            temp_directory: std::env::temp_dir().join("turbodl"),
            default_chunks: 4,
            connect_timeout: "30s".to_string(),
            read_timeout: "10m".to_string(),
        }
    }
}

impl DownloadSettings {
    /// Configured connect timeout, falling back when unparsable.
    pub fn parsed_connect_timeout(&self) -> Duration {
        util::parse_duration(&self.connect_timeout).unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Configured inactivity timeout, falling back when unparsable.
    pub fn parsed_read_timeout(&self) -> Duration {
        util::parse_duration(&self.read_timeout).unwrap_or(DEFAULT_READ_TIMEOUT)
    }
}
