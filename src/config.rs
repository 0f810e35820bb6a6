//! Configuration loading for copilot-hub.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::chunking::BatchMode;
use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the copilot-hub home directory (~/.copilot-hub).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".copilot-hub"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.copilot-hub/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::NotFound(format!(
            "settings file {}. Run 'copilot-hub config --init' first.",
            path.display()
        )));
    }

    load_settings_from(&path)
}

/// Load and validate settings from a specific file.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::SettingsRead {
        path: path.to_path_buf(),
        source,
    })?;
    let settings: Settings =
        serde_json::from_str(&content).map_err(|source| Error::SettingsParse {
            path: path.to_path_buf(),
            source,
        })?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings as pretty JSON, creating parent directories.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    tracing::info!("Wrote settings to {}", path.display());
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.traffic.line_batch_size == 0 {
        return Err(Error::Config(
            "traffic.line_batch_size must be at least 1".to_string(),
        ));
    }
    if settings.scheduler.fallback_message.trim().is_empty() {
        return Err(Error::Config(
            "scheduler.fallback_message must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Turn scheduler configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Routed in place of a reply that failed to generate
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Routed in place of an empty reply
    #[serde(default = "default_empty_reply_placeholder")]
    pub empty_reply_placeholder: String,
}

fn default_fallback_message() -> String {
    "Network error.".to_string()
}

fn default_empty_reply_placeholder() -> String {
    "(no reply)".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fallback_message: default_fallback_message(),
            empty_reply_placeholder: default_empty_reply_placeholder(),
        }
    }
}

/// Default policy values for new routes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrafficConfig {
    /// 0 disables the limit
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    #[serde(default = "default_line_batch_size")]
    pub line_batch_size: usize,

    #[serde(default = "default_backpressure")]
    pub backpressure: bool,

    #[serde(default)]
    pub strict_alternation: bool,

    #[serde(default)]
    pub batch_mode: BatchMode,
}

fn default_max_rounds() -> u32 {
    5
}

fn default_line_batch_size() -> usize {
    3
}

fn default_backpressure() -> bool {
    true
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            line_batch_size: default_line_batch_size(),
            backpressure: default_backpressure(),
            strict_alternation: false,
            batch_mode: BatchMode::default(),
        }
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub filter: Option<String>,
}

/// copilot-hub settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}
