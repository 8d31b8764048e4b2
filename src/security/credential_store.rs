use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::security::auth::UserSummary;

/// Fixed keys under which the session is persisted.
pub const ACCESS_KEY: &str = "access";
pub const REFRESH_KEY: &str = "refresh";
pub const LOGIN_TIME_KEY: &str = "login_time";
pub const USER_KEY: &str = "user";

const SESSION_KEYS: [&str; 4] = [ACCESS_KEY, REFRESH_KEY, LOGIN_TIME_KEY, USER_KEY];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage contents are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Access + refresh credentials and the moment they were issued.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: access.into(),
            refresh,
            issued_at: Utc::now(),
        }
    }

    pub fn has_refresh(&self) -> bool {
        self.refresh.is_some()
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Durable string key/value storage.
pub trait KeyValueStorage: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_many(&self, entries: &[(&str, Option<String>)]) -> Result<(), StorageError>;
}

/// Process-local storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set_many(&self, updates: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in updates {
            match value {
                Some(v) => {
                    entries.insert(key.to_string(), v.clone());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// A single JSON object on disk, one member per key.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(Map::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), StorageError> {
        if map.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents)?;

        // Credentials: owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let map = self.read_map()?;
        Ok(map.get(key).and_then(|v| v.as_str()).map(String::from))
    }

    fn set_many(&self, updates: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        for (key, value) in updates {
            match value {
                Some(v) => {
                    map.insert(key.to_string(), Value::String(v.clone()));
                }
                None => {
                    map.remove(*key);
                }
            }
        }
        self.write_map(&map)
    }
}

/// Current session credentials, mirrored into durable storage.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<CredentialPair>>>,
    user: Arc<RwLock<Option<UserSummary>>>,
    backend: Arc<dyn KeyValueStorage>,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            user: Arc::new(RwLock::new(None)),
            backend: Arc::new(MemoryStorage::new()),
        }
    }

    /// Load whatever session the backend holds. A missing access credential
    /// means no session; a missing login time is read as the epoch.
    pub fn restore(backend: Arc<dyn KeyValueStorage>) -> Result<Self, StorageError> {
        let pair = match backend.get(ACCESS_KEY)? {
            Some(access) => {
                let refresh = backend.get(REFRESH_KEY)?;
                let issued_at = backend
                    .get(LOGIN_TIME_KEY)?
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                Some(CredentialPair {
                    access,
                    refresh,
                    issued_at,
                })
            }
            None => None,
        };
        let user = match backend.get(USER_KEY)? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        debug!(restored = pair.is_some(), "credential store initialized");

        Ok(Self {
            current: Arc::new(RwLock::new(pair)),
            user: Arc::new(RwLock::new(user)),
            backend,
        })
    }

    pub async fn get(&self) -> Option<CredentialPair> {
        self.current.read().await.clone()
    }

    pub async fn access(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|p| p.access.clone())
    }

    /// Replace the pair. Memory is updated first; the write lock is held
    /// through persistence so concurrent writers reach disk in order.
    pub async fn set(&self, pair: CredentialPair) -> Result<(), StorageError> {
        let mut current = self.current.write().await;
        self.store_locked(&mut current, pair)
    }

    /// Replace the pair only while the store still holds `expected`.
    /// Returns false, writing nothing, when the session changed underneath.
    pub async fn replace_if(
        &self,
        expected: Option<&CredentialPair>,
        pair: CredentialPair,
    ) -> Result<bool, StorageError> {
        let mut current = self.current.write().await;
        if current.as_ref() != expected {
            debug!("session changed, renewed pair discarded");
            return Ok(false);
        }
        self.store_locked(&mut current, pair)?;
        Ok(true)
    }

    /// Drop the whole session. Returns whether a credential pair was held.
    pub async fn clear(&self) -> Result<bool, StorageError> {
        let mut current = self.current.write().await;
        self.clear_locked(&mut current).await
    }

    /// Drop the session only while the store still holds `expected`.
    /// Returns whether a credential pair was actually removed.
    pub async fn clear_if(&self, expected: Option<&CredentialPair>) -> Result<bool, StorageError> {
        let mut current = self.current.write().await;
        if current.as_ref() != expected {
            debug!("session changed, leaving it in place");
            return Ok(false);
        }
        self.clear_locked(&mut current).await
    }

    fn store_locked(
        &self,
        current: &mut Option<CredentialPair>,
        pair: CredentialPair,
    ) -> Result<(), StorageError> {
        let entries = [
            (ACCESS_KEY, Some(pair.access.clone())),
            (REFRESH_KEY, pair.refresh.clone()),
            (
                LOGIN_TIME_KEY,
                Some(pair.issued_at.timestamp_millis().to_string()),
            ),
        ];
        *current = Some(pair);
        self.backend.set_many(&entries)
    }

    async fn clear_locked(&self, current: &mut Option<CredentialPair>) -> Result<bool, StorageError> {
        let had_pair = current.take().is_some();
        *self.user.write().await = None;

        let entries: Vec<(&str, Option<String>)> =
            SESSION_KEYS.iter().map(|key| (*key, None)).collect();
        self.backend.set_many(&entries)?;
        Ok(had_pair)
    }

    pub async fn login_time(&self) -> Option<DateTime<Utc>> {
        self.current.read().await.as_ref().map(|p| p.issued_at)
    }

    /// Seconds since the current pair was issued.
    pub async fn age_seconds(&self) -> Option<u64> {
        self.login_time()
            .await
            .map(|issued| (Utc::now() - issued).num_seconds().max(0) as u64)
    }

    pub async fn user(&self) -> Option<UserSummary> {
        self.user.read().await.clone()
    }

    pub async fn set_user(&self, user: UserSummary) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&user)?;
        *self.user.write().await = Some(user);
        self.backend.set_many(&[(USER_KEY, Some(raw))])
    }
}
