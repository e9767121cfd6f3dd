//! Application configuration management.
//!
//! Configuration is stored at `~/.config/stockpile/config.json`; missing
//! fields fall back to defaults. `STOCKPILE_API_URL` and `STOCKPILE_STORAGE`
//! override the file for the current run only and are never written back.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;
use crate::auth::{
    FileStorage, KeyringStorage, MemoryStorage, SessionConfig, SessionStorage, SessionStore,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "stockpile";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const API_URL_ENV: &str = "STOCKPILE_API_URL";
pub const STORAGE_ENV: &str = "STOCKPILE_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_skew_secs: u64,
    pub logout_guard_ms: u64,
    /// Idle logout for long-running front ends (`stockpile watch`); 0 disables
    pub inactivity_timeout_secs: u64,
    pub preemptive_refresh: bool,
    pub storage: StorageKind,
    pub log_dir: Option<PathBuf>,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            request_timeout_secs: 30,
            refresh_skew_secs: 60,
            logout_guard_ms: 2000,
            inactivity_timeout_secs: 3600,
            preemptive_refresh: true,
            storage: StorageKind::File,
            log_dir: None,
            last_username: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply env overrides.
    /// The result is a runtime view; persist changes with
    /// `remember_username` rather than saving it.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Store `username` as the login prompt default, leaving every other
    /// field of the file as it is on disk.
    pub fn remember_username(username: &str) -> Result<()> {
        Self::remember_username_at(&Self::config_path()?, username)
    }

    fn remember_username_at(path: &Path, username: &str) -> Result<()> {
        let mut stored = Self::load_from(path)?;
        stored.last_username = Some(username.to_string());
        stored.save_to(path)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(storage) = var(STORAGE_ENV) {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0)
            .then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_skew: Duration::from_secs(self.refresh_skew_secs),
            logout_guard: Duration::from_millis(self.logout_guard_ms),
            preemptive_refresh: self.preemptive_refresh,
        }
    }

    pub fn storage_backend(&self) -> Result<Arc<dyn SessionStorage>> {
        Ok(match self.storage {
            StorageKind::File => Arc::new(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringStorage::new()),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        })
    }

    /// Build a session store wired to the configured API and storage
    pub fn session_store(&self) -> Result<SessionStore> {
        let api = ApiClient::new(self.api_base_url.clone(), self.request_timeout())?;
        Ok(SessionStore::new(
            api,
            self.storage_backend()?,
            self.session_config(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let session = config.session_config();
        assert_eq!(session.refresh_skew, Duration::from_secs(60));
        assert_eq!(session.logout_guard, Duration::from_secs(2));
        assert!(session.preemptive_refresh);
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.storage, StorageKind::File);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url":"https://inv.example.com/api","storage":"keyring"}"#)
                .expect("Failed to parse config JSON");
        assert_eq!(config.api_base_url, "https://inv.example.com/api");
        assert_eq!(config.storage, StorageKind::Keyring);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (API_URL_ENV, "http://127.0.0.1:9000/api"),
            (STORAGE_ENV, "Memory"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides apply");
        assert_eq!(config.api_base_url, "http://127.0.0.1:9000/api");
        assert_eq!(config.storage, StorageKind::Memory);
    }

    #[test]
    fn test_bad_storage_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == STORAGE_ENV).then(|| "floppy".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_remember_username_keeps_overrides_out_of_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"api_base_url":"https://inv.example.com/api"}"#)
            .expect("write config");

        let mut runtime = Config::load_from(&path).expect("load");
        runtime
            .apply_env(|key| match key {
                API_URL_ENV => Some("http://127.0.0.1:9000/api".to_string()),
                STORAGE_ENV => Some("memory".to_string()),
                _ => None,
            })
            .expect("overrides apply");
        assert_eq!(runtime.storage, StorageKind::Memory);

        Config::remember_username_at(&path, "alice").expect("remember");

        let stored = Config::load_from(&path).expect("reload");
        assert_eq!(stored.last_username.as_deref(), Some("alice"));
        assert_eq!(stored.api_base_url, "https://inv.example.com/api");
        assert_eq!(stored.storage, StorageKind::File);
    }

    #[test]
    fn test_remember_username_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE);
        Config::remember_username_at(&path, "bob").expect("remember");
        let stored = Config::load_from(&path).expect("reload");
        assert_eq!(stored.last_username.as_deref(), Some("bob"));
        assert_eq!(stored.api_base_url, Config::default().api_base_url);
    }

    #[test]
    fn test_zero_disables_inactivity() {
        let config = Config {
            inactivity_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.inactivity_timeout().is_none());
    }
}
