use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::token::SessionRecord;
use crate::error::{storage_failed, SessionError, SessionResult};

const ACCESS_TOKEN_KEY: &str = "accessToken";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const TOKEN_TYPE_KEY: &str = "tokenType";
const EXPIRES_IN_KEY: &str = "expiresIn";
const ISSUED_AT_KEY: &str = "tokenIssuedAt";

/// Durable string key/value substrate the session is persisted into.
///
/// Implementations must apply `store_all` and `remove_all` as a group.
pub trait StorageBackend: Send + Sync {
    /// Read every persisted entry
    fn load(&self) -> Result<HashMap<String, String>>;

    /// Insert or overwrite all given entries at once
    fn store_all(&self, entries: &[(String, String)]) -> Result<()>;

    /// Remove all given keys at once
    fn remove_all(&self, keys: &[String]) -> Result<()>;
}

/// Process-local storage, lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view of the stored entries
    pub fn entries(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert an entry directly, bypassing the session layout
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }
}

impl StorageBackend for MemoryStorage {
    fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.entries())
    }

    fn store_all(&self, entries: &[(String, String)]) -> Result<()> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }
}

/// Storage in a JSON object file.
///
/// Every change rewrites the whole file through a temporary sibling and a
/// rename, so a group of keys is never half-written on disk.
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

    fn read_map(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!(
                "Storage file {} is not a JSON object",
                self.path.display()
            )),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(map)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn load(&self) -> Result<HashMap<String, String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .read_map()?
            .into_iter()
            .filter_map(|(key, value)| value.as_str().map(|v| (key, v.to_string())))
            .collect())
    }

    fn store_all(&self, entries: &[(String, String)]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        for (key, value) in entries {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        self.write_map(&map)
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        let before = map.len();
        for key in keys {
            map.remove(key);
        }
        if map.len() == before && !self.path.exists() {
            return Ok(());
        }
        self.write_map(&map)
    }
}

/// Holder of the single persisted session record.
///
/// The in-memory copy and the backend are only ever changed together while
/// the write lock is held, so readers see either the old record or the new
/// one, never a mix.
pub struct TokenStore {
    backend: Box<dyn StorageBackend>,
    prefix: String,
    current: RwLock<Option<SessionRecord>>,
}

impl TokenStore {
    /// Create a store on top of a backend, restoring any persisted record
    pub fn new(backend: Box<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let restored = match backend.load() {
            Ok(entries) => Self::parse_record(&prefix, &entries),
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting without one");
                None
            }
        };

        if restored.is_some() {
            info!("Restored persisted session record");
        } else {
            debug!("No persisted session record found");
        }

        Self {
            backend,
            prefix,
            current: RwLock::new(restored),
        }
    }

    /// Create a store that keeps the record in memory only
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()), "")
    }

    /// Current record, if any
    pub fn read(&self) -> Option<SessionRecord> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole record
    pub fn write(&self, record: &SessionRecord) -> SessionResult<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.backend
            .store_all(&self.entries_for(record))
            .map_err(storage_failed)?;
        *current = Some(record.clone());
        debug!(expires_at = %record.expires_at(), "Session record written");
        Ok(())
    }

    /// Replace the record only while it is still `expected`.
    ///
    /// Returns `false` without touching the backend when another writer got
    /// there first.
    pub fn replace_if(&self, expected: &SessionRecord, record: &SessionRecord) -> SessionResult<bool> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() != Some(expected) {
            debug!("Session record changed, replacement skipped");
            return Ok(false);
        }
        self.backend
            .store_all(&self.entries_for(record))
            .map_err(storage_failed)?;
        *current = Some(record.clone());
        debug!(expires_at = %record.expires_at(), "Session record replaced");
        Ok(true)
    }

    /// Remove the record only while it is still `expected`.
    ///
    /// Like [`TokenStore::clear`], a backend failure still drops the
    /// in-memory copy and is reported as an error.
    pub fn clear_if(&self, expected: &SessionRecord) -> SessionResult<bool> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() != Some(expected) {
            debug!("Session record changed, clear skipped");
            return Ok(false);
        }
        let result = self.backend.remove_all(&self.keys()).map_err(storage_failed);
        *current = None;
        debug!("Session record cleared");
        result.map(|()| true)
    }

    /// Remove the whole record
    pub fn clear(&self) -> SessionResult<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let result = self.backend.remove_all(&self.keys()).map_err(storage_failed);
        // Dropped even when the backend refuses
        *current = None;
        debug!("Session record cleared");
        result
    }

    /// Whether a record is currently held
    pub fn is_present(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn keys(&self) -> Vec<String> {
        [
            ACCESS_TOKEN_KEY,
            REFRESH_TOKEN_KEY,
            TOKEN_TYPE_KEY,
            EXPIRES_IN_KEY,
            ISSUED_AT_KEY,
        ]
        .iter()
        .map(|name| self.key(name))
        .collect()
    }

    fn entries_for(&self, record: &SessionRecord) -> Vec<(String, String)> {
        vec![
            (self.key(ACCESS_TOKEN_KEY), record.access_token.clone()),
            (self.key(REFRESH_TOKEN_KEY), record.refresh_token.clone()),
            (self.key(TOKEN_TYPE_KEY), record.token_type.clone()),
            (
                self.key(EXPIRES_IN_KEY),
                record.expires_in_seconds.to_string(),
            ),
            (self.key(ISSUED_AT_KEY), record.issued_at.to_rfc3339()),
        ]
    }

    fn parse_record(prefix: &str, entries: &HashMap<String, String>) -> Option<SessionRecord> {
        let get = |name: &str| entries.get(&format!("{}{}", prefix, name));

        let access_token = get(ACCESS_TOKEN_KEY)?;
        let refresh_token = get(REFRESH_TOKEN_KEY)?;
        let token_type = get(TOKEN_TYPE_KEY)?;
        let expires_in_seconds = get(EXPIRES_IN_KEY)?.trim().parse::<u64>().ok()?;
        let issued_at = DateTime::parse_from_rfc3339(get(ISSUED_AT_KEY)?.trim())
            .ok()?
            .with_timezone(&Utc);

        if access_token.is_empty() || refresh_token.is_empty() {
            return None;
        }

        Some(SessionRecord {
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
            token_type: token_type.clone(),
            expires_in_seconds,
            issued_at,
        })
    }
}

/// Run a blocking storage call on the blocking pool
pub(crate) async fn offload<T, F>(task: F) -> SessionResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SessionResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| SessionError::Internal(format!("storage task failed: {}", e)))?
}
