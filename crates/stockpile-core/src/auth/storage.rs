//! Persisted session state.
//!
//! The session survives restarts as three keyed entries: `accessToken`,
//! `refreshToken` and `user`. They are written together and read together;
//! any partial or corrupt set is treated as no session at all.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::identity::Identity;
use super::token::Credential;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// String key/value storage for the persisted session.
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Write several entries as one unit where the backend can.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Remove several entries, continuing past individual failures and
    /// returning the first one.
    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove(key) {
                warn!(key, error = %e, "Failed to remove persisted session entry");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// In-process storage; nothing outlives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// JSON map stored in the cache directory.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    /// Write via temp file + rename so a crash never leaves a torn file
    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove session file")?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        let tmp_path = self.path.with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&tmp_path, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp_path, &self.path).context("Failed to replace session file")?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        // A corrupt file is overwritten rather than blocking every write
        let mut map = self.read_map().unwrap_or_else(|e| {
            warn!(error = %e, "Discarding unreadable session file");
            HashMap::new()
        });
        f(&mut map);
        self.write_map(&map)
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|map| {
            map.remove(key);
        })
    }

    /// One read-modify-write, so a crash never leaves a mixed session
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.update(|map| {
            for (key, value) in entries {
                map.insert(key.to_string(), value.to_string());
            }
        })
    }

    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        self.update(|map| {
            for key in keys {
                map.remove(*key);
            }
        })
    }
}

/// The credential/identity pair as it is stored between runs.
#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub credential: Credential,
    pub identity: Identity,
}

impl PersistedSession {
    /// Load the persisted session. Partial, corrupt or unreadable state is
    /// reported as `None`.
    pub fn load(storage: &dyn SessionStorage) -> Option<Self> {
        let read = |key: &str| match storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persisted session entry");
                None
            }
        };

        let access = read(ACCESS_TOKEN_KEY);
        let refresh = read(REFRESH_TOKEN_KEY);
        let user = read(USER_KEY);

        let (Some(access), Some(refresh), Some(user)) = (access, refresh, user) else {
            debug!("No complete persisted session");
            return None;
        };

        match serde_json::from_str::<Identity>(&user) {
            Ok(identity) => Some(Self {
                credential: Credential::new(access, refresh),
                identity,
            }),
            Err(e) => {
                warn!(error = %e, "Persisted user entry is corrupt");
                None
            }
        }
    }

    pub fn save(&self, storage: &dyn SessionStorage) -> Result<()> {
        let user = serde_json::to_string(&self.identity)?;
        storage.set_many(&[
            (ACCESS_TOKEN_KEY, self.credential.access_token()),
            (REFRESH_TOKEN_KEY, self.credential.refresh_token()),
            (USER_KEY, &user),
        ])
    }

    pub fn clear(storage: &dyn SessionStorage) -> Result<()> {
        storage.remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY])
    }
}
