//! Configuration: a TOML file holding server and download defaults,
//! created on first run and sanitized on every load so the engine never
//! starts with an unusable chunk count or timeout.

mod settings;

pub use settings::*;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use crate::download::MAX_CHUNKS;
use crate::util;

/// Directory holding the config file.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("turbodl")
}

/// Path of the config file itself.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the configuration, writing a default file on first run.
pub fn load_or_create_default() -> Result<Settings> {
    let path = config_path();

    if !path.exists() {
        let settings = Settings::default();
        save(&settings)?;
        return Ok(settings);
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut settings: Settings = toml::from_str(&content)
        .with_context(|| format!("malformed config at {}", path.display()))?;
    sanitize(&mut settings);
    Ok(settings)
}

/// Persist settings, creating the config directory on the way.
pub fn save(settings: &Settings) -> Result<()> {
    let path = config_path();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

/// Repair values a hand-edited config file may have broken, falling back
/// to the defaults the engine is known to accept.
fn sanitize(settings: &mut Settings) {
    let defaults = DownloadSettings::default();
    let downloads = &mut settings.downloads;

    if !(1..=MAX_CHUNKS).contains(&downloads.default_chunks) {
        warn!(
            configured = downloads.default_chunks,
            fallback = defaults.default_chunks,
            "configured default chunk count is out of range"
        );
        downloads.default_chunks = defaults.default_chunks;
    }
    if util::parse_duration(&downloads.connect_timeout).is_err() {
        warn!(
            configured = %downloads.connect_timeout,
            fallback = %defaults.connect_timeout,
            "configured connect timeout does not parse"
        );
        downloads.connect_timeout = defaults.connect_timeout.clone();
    }
    if util::parse_duration(&downloads.read_timeout).is_err() {
        warn!(
            configured = %downloads.read_timeout,
            fallback = %defaults.read_timeout,
            "configured read timeout does not parse"
        );
        downloads.read_timeout = defaults.read_timeout.clone();
    }
}
