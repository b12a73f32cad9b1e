//! Settings, stored in BITREMOTE_HOME/settings.json

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SettingsError;
use crate::queue::QueueSettings;

/// Every field has a default, so a settings file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Advertised name prefix used when no device is named explicitly
    pub name_prefix: String,
    pub scan_secs: u64,
    /// Minimum gap between two writes
    pub min_interval_ms: u64,
    /// Consecutive failed writes before a message is dropped
    pub max_retries: u32,
    pub write_timeout_ms: u64,
    /// Pause between connecting and sending GETCFG
    pub getcfg_delay_ms: u64,
    /// Bytes per GATT write
    pub chunk_size: usize,
    pub max_line_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name_prefix: "BBC micro:bit".to_string(),
            scan_secs: 5,
            min_interval_ms: 200,
            max_retries: 3,
            write_timeout_ms: 2000,
            getcfg_delay_ms: 500,
            chunk_size: bitremote_proto::TRANSPORT_CHUNK_SIZE,
            max_line_len: bitremote_proto::DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// BITREMOTE_HOME, or ~/.bitremote
pub fn bitremote_home() -> Result<PathBuf, SettingsError> {
    match std::env::var_os("BITREMOTE_HOME") {
        Some(home) => Ok(PathBuf::from(home)),
        None => Ok(dirs::home_dir().ok_or(SettingsError::NoHome)?.join(".bitremote")),
    }
}

impl Settings {
    /// Load from a file; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load(&bitremote_home()?.join("settings.json"))
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn getcfg_delay(&self) -> Duration {
        Duration::from_millis(self.getcfg_delay_ms)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_retries: self.max_retries.max(1),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"min_interval_ms": 50}"#).unwrap();
        assert_eq!(settings.min_interval_ms, 50);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.chunk_size, 20);
        assert_eq!(settings.queue_settings().min_interval, Duration::from_millis(50));
    }

    #[test]
    fn missing_file_is_default() {
        let path = std::env::temp_dir().join("bitremote-settings-does-not-exist.json");
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("bitremote-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = Settings { name_prefix: "NUS".to_string(), scan_secs: 9, ..Settings::default() };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("bitremote-garbage-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse(_))));
        let _ = fs::remove_dir_all(dir);
    }
}
