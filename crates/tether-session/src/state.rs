//! Durable connection state.
//!
//! [`PersistedConnectionState`] is the only record this crate persists. The
//! store itself is injected so hosts can back it with whatever durable
//! key-value storage they have.

use crate::classify::ErrorRecord;
use crate::config::ConnectionConfig;
use crate::connection::ConnectionStatus;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConnectionState {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub config: ConnectionConfig,
    pub last_activity_ms: u64,
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
}

impl PersistedConnectionState {
    pub fn new(connection_id: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            connection_id: connection_id.into(),
            status: ConnectionStatus::Disconnected,
            config,
            last_activity_ms: now_ms(),
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// A partial update merged into a stored record. Every update refreshes
/// `last_activity_ms`.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<ConnectionStatus>,
    pub config: Option<ConnectionConfig>,
    pub reconnect_attempts: Option<u32>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<ErrorRecord>>,
}

impl StateUpdate {
    pub fn status(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn attempts(attempts: u32) -> Self {
        Self {
            reconnect_attempts: Some(attempts),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, record: ErrorRecord) -> Self {
        self.last_error = Some(Some(record));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Merges into `existing`, creating a record when there is none and the
    /// update carries a config.
    pub fn apply(
        self,
        connection_id: &str,
        existing: Option<PersistedConnectionState>,
    ) -> Option<PersistedConnectionState> {
        let mut state = match (existing, self.config.clone()) {
            (Some(state), _) => state,
            (None, Some(config)) => PersistedConnectionState::new(connection_id, config),
            (None, None) => return None,
        };
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(config) = self.config {
            state.config = config;
        }
        if let Some(attempts) = self.reconnect_attempts {
            state.reconnect_attempts = attempts;
        }
        if let Some(last_error) = self.last_error {
            state.last_error = last_error;
        }
        state.last_activity_ms = now_ms();
        Some(state)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, connection_id: &str) -> Result<Option<PersistedConnectionState>>;

    async fn load_all(&self) -> Result<Vec<PersistedConnectionState>>;

    async fn save(&self, state: PersistedConnectionState) -> Result<()>;

    async fn delete(&self, connection_id: &str) -> Result<()>;

    /// Read-modify-write of one record. Missing records without a config in
    /// the update are left alone.
    async fn update(&self, connection_id: &str, update: StateUpdate) -> Result<()> {
        let existing = self.load(connection_id).await?;
        match update.apply(connection_id, existing) {
            Some(state) => self.save(state).await,
            None => {
                tracing::debug!("no persisted state for {}, skipping update", connection_id);
                Ok(())
            }
        }
    }
}

/// In-process store, for tests and hosts without durable storage.
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<String, PersistedConnectionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, connection_id: &str) -> Result<Option<PersistedConnectionState>> {
        Ok(self.records.read().get(connection_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<PersistedConnectionState>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn save(&self, state: PersistedConnectionState) -> Result<()> {
        self.records
            .write()
            .insert(state.connection_id.clone(), state);
        Ok(())
    }

    async fn delete(&self, connection_id: &str) -> Result<()> {
        self.records.write().remove(connection_id);
        Ok(())
    }

    async fn update(&self, connection_id: &str, update: StateUpdate) -> Result<()> {
        let mut records = self.records.write();
        let existing = records.remove(connection_id);
        if let Some(state) = update.apply(connection_id, existing) {
            records.insert(connection_id.to_string(), state);
        }
        Ok(())
    }
}

/// All records in one JSON document, replaced atomically on every write.
///
/// Records carry full connection configs, passwords and key passphrases
/// included, so the file is created readable by its owner only (on Unix).
pub struct JsonFileStateStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, PersistedConnectionState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<PersistedConnectionState> = serde_json::from_slice(&bytes)
            .map_err(|e| SessionError::Store(format!("{}: {}", self.path.display(), e)))?;
        Ok(records
            .into_iter()
            .map(|r| (r.connection_id.clone(), r))
            .collect())
    }

    async fn write_all(&self, records: &BTreeMap<String, PersistedConnectionState>) -> Result<()> {
        let list: Vec<&PersistedConnectionState> = records.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| SessionError::Store(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, connection_id: &str) -> Result<Option<PersistedConnectionState>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(connection_id))
    }

    async fn load_all(&self) -> Result<Vec<PersistedConnectionState>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_values().collect())
    }

    async fn save(&self, state: PersistedConnectionState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.insert(state.connection_id.clone(), state);
        self.write_all(&records).await
    }

    async fn delete(&self, connection_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        if records.remove(connection_id).is_some() {
            self.write_all(&records).await?;
        }
        Ok(())
    }

    async fn update(&self, connection_id: &str, update: StateUpdate) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let existing = records.remove(connection_id);
        match update.apply(connection_id, existing) {
            Some(state) => {
                records.insert(connection_id.to_string(), state);
                self.write_all(&records).await
            }
            None => Ok(()),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
