use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::monitor::{MonitorRules, DEFAULT_DEBOUNCE_MS};

pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "zengate.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub user_id: String,
    pub own_identifier: String,
    pub data_dir: PathBuf,
    pub debounce_window_ms: i64,
    pub tick_interval_ms: u64,
    pub refresh_interval_secs: u64,
    pub system_identifiers: Vec<String>,
    pub system_prefixes: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_id: "default_user".into(),
            own_identifier: "com.zengate.app".into(),
            data_dir: default_data_dir(),
            debounce_window_ms: DEFAULT_DEBOUNCE_MS,
            tick_interval_ms: 1_000,
            refresh_interval_secs: 300,
            system_identifiers: vec![
                "android".into(),
                "com.apple.dock".into(),
                "com.apple.loginwindow".into(),
            ],
            system_prefixes: vec![
                "com.android.systemui".into(),
                "com.android.launcher".into(),
                "com.apple.systemuiserver".into(),
            ],
        }
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "zengate", "ZenGate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".zengate"))
}

impl AppConfig {
    /// Resolve the data directory from the environment, then read
    /// `config.json` inside it. A missing file is written with defaults;
    /// an unreadable one is ignored.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var_os("ZENGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::load_from(data_dir)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed config {}: {}", path.display(), err);
                Self::default()
            })
        } else {
            let config = Self::default();
            config.persist(&path)?;
            config
        };

        // The file lives inside the data dir, so that location wins.
        config.data_dir = data_dir;
        Ok(config)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(user_id) = std::env::var("ZENGATE_USER_ID") {
            if !user_id.trim().is_empty() {
                self.user_id = user_id.trim().to_string();
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn monitor_rules(&self) -> MonitorRules {
        MonitorRules {
            own_identifier: self.own_identifier.clone(),
            system_identifiers: self.system_identifiers.clone(),
            system_prefixes: self.system_prefixes.clone(),
            debounce_window: chrono::Duration::milliseconds(self.debounce_window_ms.max(0)),
        }
    }
}

pub fn debug_enabled() -> bool {
    std::env::var("ZENGATE_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
