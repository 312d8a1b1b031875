use std::{collections::HashMap, io::ErrorKind, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use drive_log_lib::trip_session::TripSession;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::{RECOVERY_KEY, RecorderError};

/// Durable key-value storage. A key that was never written, or was removed,
/// reads as `None`.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RecorderError>;

    /// Either the whole value is stored or the previous one is left as it was.
    async fn set(&self, key: &str, value: &str) -> Result<(), RecorderError>;

    async fn remove(&self, key: &str) -> Result<(), RecorderError>;
}

/// One file per key, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let dir = dir.into();

        if !dir.exists() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|_| RecorderError::Persistence(format!("Failed to create store directory: {:?}", dir)))?;
        }

        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, RecorderError> {
        let legal = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !legal {
            return Err(RecorderError::Persistence(format!("Illegal store key: {key:?}")));
        }

        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RecorderError> {
        let path = self.path_for(key)?;

        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RecorderError::Persistence(format!("Failed to read {:?}: {err}", path))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RecorderError> {
        let path = self.path_for(key)?;
        let temp_path = self.dir.join(format!(".{key}.json.tmp"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|err| RecorderError::Persistence(format!("Failed to open {:?}: {err}", temp_path)))?;

        file.write_all(value.as_bytes())
            .await
            .map_err(|err| RecorderError::Persistence(format!("Failed to write {:?}: {err}", temp_path)))?;
        file.sync_all()
            .await
            .map_err(|err| RecorderError::Persistence(format!("Failed to sync {:?}: {err}", temp_path)))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|err| RecorderError::Persistence(format!("Failed to replace {:?}: {err}", path)))
    }

    async fn remove(&self, key: &str) -> Result<(), RecorderError> {
        let path = self.path_for(key)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RecorderError::Persistence(format!("Failed to remove {:?}: {err}", path))),
        }
    }
}

/// In-memory store. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RecorderError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RecorderError> {
        self.values.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RecorderError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Being sampled, or interrupted while it was.
    #[default]
    Recording,
    /// Stopped, but the backend has not accepted it yet.
    AwaitingSync,
    /// The backend's copy. Kept only for the summary.
    Synced,
}

/// The recovery record: a trip session plus how far it got.
///
/// Written as the session's own JSON with a `phase` field next to it, so a
/// bare session record reads as one still being recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub phase: SessionPhase,
    #[serde(flatten)]
    pub session: TripSession,
}

impl PersistedSession {
    pub fn is_recoverable(&self) -> bool {
        self.phase != SessionPhase::Synced
    }
}

/// Owns the recovery record and its two readers: recovery at start, and the
/// last trip shown by the summary.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn PersistentStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, phase: SessionPhase, session: &TripSession) -> Result<(), RecorderError> {
        let record = PersistedSession {
            phase,
            session: session.clone(),
        };
        let raw = serde_json::to_string(&record)
            .map_err(|err| RecorderError::Persistence(format!("Failed to encode session: {err}")))?;

        self.store.set(RECOVERY_KEY, &raw).await
    }

    /// The record as stored. A record that cannot be read back is a
    /// validation failure; the caller has to discard it.
    pub async fn load(&self) -> Result<Option<PersistedSession>, RecorderError> {
        let Some(raw) = self.store.get(RECOVERY_KEY).await? else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| RecorderError::Validation(format!("Unreadable recovery record: {err}")))
    }

    /// A trip that was interrupted or never reached the backend.
    pub async fn recoverable(&self) -> Result<Option<PersistedSession>, RecorderError> {
        Ok(self.load().await?.filter(PersistedSession::is_recoverable))
    }

    /// The most recent trip in whatever phase it is in.
    pub async fn last_trip(&self) -> Result<Option<TripSession>, RecorderError> {
        Ok(self.load().await?.map(|record| record.session))
    }

    pub async fn clear(&self) -> Result<(), RecorderError> {
        self.store.remove(RECOVERY_KEY).await
    }
}
