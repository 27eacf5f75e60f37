use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.json";
const DATA_DIR_ENV: &str = "DEEPNOTE_DATA_DIR";
const LOG_LEVEL_ENV: &str = "DEEPNOTE_LOG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub notes_file: String,
    pub timer_states_file: String,
    pub cache_ttl_ms: u64,
    pub backup_retention_ms: u64,
    pub tick_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            notes_file: "deepnote-notes.json".to_string(),
            timer_states_file: "timer-states.json".to_string(),
            cache_ttl_ms: 1_000,
            backup_retention_ms: 5_000,
            tick_interval_ms: 1_000,
            sweep_interval_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `settings.json` in the data directory, then environment overrides.
    pub fn load(data_dir_override: Option<PathBuf>) -> AppResult<Self> {
        let data_dir = data_dir_override
            .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let mut settings = Self::from_dir(&data_dir)?;
        settings.data_dir = data_dir;
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                settings.log_level = level;
            }
        }
        Ok(settings)
    }

    /// Reads `settings.json` from `data_dir` if present; missing keys keep their defaults.
    pub fn from_dir(data_dir: &Path) -> AppResult<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice::<Settings>(&bytes).map_err(|error| {
                AppError::InvalidInput(format!("{}: {}", path.display(), error))
            })?
        } else {
            Settings::default()
        };
        settings.data_dir = data_dir.to_path_buf();
        Ok(settings)
    }

    /// Settings rooted at `data_dir` with every other value at its default.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn ensure_data_dir(&self) -> AppResult<()> {
        fs::create_dir_all(&self.data_dir).map_err(|error| AppError::Io(error.to_string()))
    }

    pub fn notes_path(&self) -> PathBuf {
        self.data_dir.join(&self.notes_file)
    }

    pub fn timer_states_path(&self) -> PathBuf {
        self.data_dir.join(&self.timer_states_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn backup_retention(&self) -> Duration {
        Duration::from_millis(self.backup_retention_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_data_dir() -> PathBuf {
    let config_home = std::env::var_os("XDG_CONFIG_HOME").filter(|value| !value.is_empty());
    if let Some(config_home) = config_home {
        return PathBuf::from(config_home).join("deepnote");
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("deepnote")
}
