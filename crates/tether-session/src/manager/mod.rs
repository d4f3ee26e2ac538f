//! Connection registry and orchestration.
//!
//! The manager owns every [`Connection`], the in-memory [`CacheTier`], the
//! optional [`PersistentFileCache`] and the [`OperationQueue`], and wires
//! reconnection, replay and cache invalidation together.

mod fs;
mod health;
mod reconnect;

pub use health::HealthReport;

use crate::classify::{render_troubleshooting, ErrorRecord};
use crate::config::{ConnectionConfig, ManagerConfig};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{Result, SessionError};
use crate::policy::ReconnectPolicy;
use crate::prompt::{Notice, PromptAction, TracingPrompt, UserPrompt};
use crate::queue::{FsOperation, OperationQueue, QueuedOperation, ReplaySummary};
use crate::state::{JsonFileStateStore, MemoryStateStore, StateStore, StateUpdate};
use crate::transport::Connector;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tether_cache::{CacheStats, CacheTier, PersistentFileCache, RemotePath};
use tokio::task::JoinHandle;

pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Arc<Connection>>,
    cache: Mutex<CacheTier>,
    file_cache: Option<Arc<PersistentFileCache>>,
    queue: OperationQueue,
    store: Arc<dyn StateStore>,
    prompt: Arc<dyn UserPrompt>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Manager with an in-memory state store and log-only notices.
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            cache: Mutex::new(CacheTier::new(config.cache.clone())),
            queue: OperationQueue::new(config.queue.clone()),
            config,
            connector,
            connections: DashMap::new(),
            file_cache: None,
            store: Arc::new(MemoryStateStore::new()),
            prompt: Arc::new(TracingPrompt),
            health_task: Mutex::new(None),
        }
    }

    /// Builds a manager whose state store and persistent cache come from
    /// `config` (`state_file` and `persistent_cache`).
    pub async fn from_config(config: ManagerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let state_file = config.state_file.clone();
        let persistent = config.persistent_cache.clone();
        let mut manager = Self::new(config, connector);

        if let Some(path) = state_file {
            tracing::info!("persisting connection state to {}", path.display());
            manager = manager.with_store(Arc::new(JsonFileStateStore::new(path)));
        }
        if let Some(cache_config) = persistent {
            let file_cache = PersistentFileCache::open(cache_config).await?;
            file_cache.load_from_disk().await?;
            manager = manager.with_file_cache(Arc::new(file_cache));
        }
        Ok(manager)
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn UserPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_file_cache(mut self, file_cache: Arc<PersistentFileCache>) -> Self {
        self.file_cache = Some(file_cache);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn file_cache(&self) -> Option<&Arc<PersistentFileCache>> {
        self.file_cache.as_ref()
    }

    /// Manager default policy with the connection's overrides applied.
    pub fn policy_for(&self, config: &ConnectionConfig) -> ReconnectPolicy {
        self.config.reconnect.with_overrides(&config.reconnect)
    }

    /// Validates, connects and registers a new connection under a fresh id.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<Arc<Connection>> {
        self.connect_with_id(uuid::Uuid::new_v4().to_string(), config)
            .await
    }

    async fn connect_with_id(&self, id: String, config: ConnectionConfig) -> Result<Arc<Connection>> {
        config.validate()?;
        let conn = Connection::new(id.clone(), config, Arc::clone(&self.connector));
        if let Err(err) = conn.connect().await {
            tracing::warn!(connection = %id, kind = %err.kind(), "connect failed: {}", err);
            return Err(err);
        }
        self.connections.insert(id, Arc::clone(&conn));
        self.persist(&conn).await;
        Ok(conn)
    }

    /// Tears down the transport, forgets the connection and its queued
    /// operations and cached entries, and records it as disconnected.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let (_, conn) = self
            .connections
            .remove(id)
            .ok_or_else(|| SessionError::ConnectionNotFound { id: id.to_string() })?;

        let result = conn.disconnect().await;
        let discarded = self.queue.remove(id);
        if !discarded.is_empty() {
            tracing::warn!(
                "discarding {} queued operations for disconnected {}",
                discarded.len(),
                id
            );
        }
        self.cache.lock().invalidate_connection(id);
        self.persist(&conn).await;
        tracing::info!("connection {} disconnected", id);
        result
    }

    /// Disconnects every connection concurrently. One failing teardown does
    /// not stop the others; failures are returned by id.
    pub async fn disconnect_all(&self) -> Vec<(String, SessionError)> {
        let mut ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();

        let results = join_all(ids.iter().map(|id| self.disconnect(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(err) => {
                    tracing::warn!("disconnect of {} failed: {}", id, err);
                    Some((id, err))
                }
            })
            .collect()
    }

    /// Reconnects every persisted connection that was `Connected` when the
    /// process last ran, keeping its id. Failures are recorded as `Error`.
    pub async fn restore_connections(&self) -> Result<Vec<Arc<Connection>>> {
        let records = self.store.load_all().await?;
        let mut restored = Vec::new();

        for record in records {
            if record.status != ConnectionStatus::Connected
                || self.connections.contains_key(&record.connection_id)
            {
                continue;
            }
            let id = record.connection_id.clone();
            tracing::info!("restoring connection {} to {}", id, record.config.endpoint());
            match self.connect_with_id(id.clone(), record.config).await {
                Ok(conn) => restored.push(conn),
                Err(err) => {
                    let update = StateUpdate::status(ConnectionStatus::Error)
                        .with_error(err.to_record(Some(&id)));
                    if let Err(e) = self.store.update(&id, update).await {
                        tracing::warn!("could not record failed restore of {}: {}", id, e);
                    }
                }
            }
        }
        Ok(restored)
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every registered connection, ordered by id.
    pub fn active_connections(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub(crate) fn lookup(&self, id: &str) -> Result<Arc<Connection>> {
        self.get_connection(id)
            .ok_or_else(|| SessionError::ConnectionNotFound { id: id.to_string() })
    }

    /// Stops health checks and disconnects everything.
    pub async fn dispose(&self) {
        self.stop_health_checks();
        let failures = self.disconnect_all().await;
        tracing::info!("connection manager disposed ({} teardown failures)", failures.len());
    }

    /// Defers an operation until the connection is re-established.
    pub fn queue_operation(&self, connection_id: &str, operation: FsOperation) -> usize {
        self.queue.enqueue(connection_id, operation)
    }

    pub fn pending_operations(&self, connection_id: &str) -> Vec<QueuedOperation> {
        self.queue.pending(connection_id)
    }

    pub fn has_pending_operations(&self, connection_id: &str) -> bool {
        self.queue.has_pending(connection_id)
    }

    /// Replays the connection's queued operations in FIFO order.
    pub async fn execute_pending_operations(&self, connection_id: &str) -> Result<ReplaySummary> {
        let conn = self.lookup(connection_id)?;
        if !conn.is_connected() {
            return Err(SessionError::NotConnected {
                id: connection_id.to_string(),
                status: conn.status(),
            });
        }
        self.replay_queue(&conn).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    pub fn with_cache<R>(&self, f: impl FnOnce(&mut CacheTier) -> R) -> R {
        f(&mut self.cache.lock())
    }

    pub fn invalidate(&self, path: &RemotePath) {
        self.cache.lock().invalidate(path);
    }

    pub fn invalidate_connection_cache(&self, connection_id: &str) -> usize {
        self.cache.lock().invalidate_connection(connection_id)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Answers an action chosen on a notice. `ShowDetails` returns the
    /// troubleshooting report for the connection's last error.
    pub async fn handle_action(
        self: &Arc<Self>,
        connection_id: &str,
        action: PromptAction,
    ) -> Result<Option<String>> {
        let conn = self.lookup(connection_id)?;
        tracing::debug!("action {} on {}", action.label(), connection_id);
        match action {
            PromptAction::Retry | PromptAction::Reconnect => {
                self.spawn_reconnect(connection_id);
                Ok(None)
            }
            PromptAction::Cancel => {
                self.cancel_reconnect(connection_id).await?;
                Ok(None)
            }
            PromptAction::ShowDetails => Ok(conn.last_error().map(|r| render_troubleshooting(&r))),
        }
    }

    /// Entry point for transports reporting an unexpected close.
    pub fn handle_transport_closed(self: &Arc<Self>, connection_id: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            tracing::debug!("transport close for unknown connection {}", connection_id);
            return;
        };
        if conn.mark_transport_lost() {
            self.notify(Notice::warning(
                connection_id,
                format!("Connection to {} closed unexpectedly", conn.config().endpoint()),
            ));
            self.spawn_reconnect(connection_id);
        }
    }

    pub(crate) fn notify(&self, notice: Notice) {
        self.prompt.notify(notice);
    }

    pub(crate) fn notify_failure(&self, conn: &Connection, record: &ErrorRecord, actions: &[PromptAction]) {
        self.notify(
            Notice::error(conn.id(), record.message.clone())
                .with_actions(actions)
                .with_error(record.clone()),
        );
    }

    /// Saves the connection's current state. Store failures are logged only.
    pub(crate) async fn persist(&self, conn: &Connection) {
        if let Err(e) = self.store.save(conn.persisted_state()).await {
            tracing::warn!("could not persist state of {}: {}", conn.id(), e);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("pending_operations", &self.queue.total_pending())
            .finish()
    }
}
