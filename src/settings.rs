use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Process-level configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub store: StoreBackend,
    pub debug: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_raw = read("WATTLOG_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .with_context(|| format!("WATTLOG_BIND is not a socket address: {bind_raw}"))?;

        let data_dir = PathBuf::from(read("WATTLOG_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()));

        let store = match read("WATTLOG_STORE").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("sqlite") => StoreBackend::Sqlite,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("WATTLOG_STORE must be 'sqlite' or 'memory', got '{other}'"),
        };

        let debug = match read("WATTLOG_DEBUG").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => bail!("WATTLOG_DEBUG must be 1/0/true/false, got '{other}'"),
        };

        Ok(Self {
            bind,
            data_dir,
            store,
            debug,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("wattlog.sqlite3")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSettings {
    pub interval_seconds: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    capture: CaptureSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn capture(&self) -> CaptureSettings {
        self.read().capture
    }

    pub fn update_capture(&self, settings: CaptureSettings) -> Result<()> {
        let mut guard = self.write();
        guard.capture = settings;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create settings directory {}", dir.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind, "0.0.0.0:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.store, StoreBackend::Sqlite);
        assert!(!config.debug);
        assert_eq!(config.settings_path(), PathBuf::from("./data/settings.json"));
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("WATTLOG_BIND", "127.0.0.1:8080"),
            ("WATTLOG_DATA_DIR", "/var/lib/wattlog"),
            ("WATTLOG_STORE", "Memory"),
            ("WATTLOG_DEBUG", "true"),
        ])
        .unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(config.debug);
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/wattlog/wattlog.sqlite3"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("WATTLOG_BIND", "nowhere")]).unwrap_err();
        assert!(err.to_string().contains("WATTLOG_BIND"));
        let err = config(&[("WATTLOG_STORE", "redis")]).unwrap_err();
        assert!(err.to_string().contains("WATTLOG_STORE"));
    }

    #[test]
    fn interval_persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(settings.capture().interval_seconds, DEFAULT_INTERVAL_SECS);
        settings
            .update_capture(CaptureSettings { interval_seconds: 12 })
            .unwrap();

        let reloaded = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reloaded.capture().interval_seconds, 12);
        let raw = fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"intervalSeconds\": 12"));
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let settings = SettingsStore::new(path).unwrap();
        assert_eq!(settings.capture(), CaptureSettings::default());
    }
}
