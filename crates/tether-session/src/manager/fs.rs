//! Cached remote filesystem operations.
//!
//! Reads go through the in-memory tier, then the persistent cache, then the
//! connection's file channel. Mutations invalidate both caches once they
//! succeed. A network failure queues the operation and starts reconnection;
//! the caller still gets the classified error straight away.

use super::ConnectionManager;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{Result, SessionError};
use crate::queue::{FsOperation, OperationReplayer, ReplaySummary};
use async_trait::async_trait;
use std::sync::Arc;
use tether_cache::{DirEntry, FileStat, RemotePath};

/// Replays queued operations straight against the transport, without
/// queueing them again.
struct Replay<'a> {
    manager: &'a ConnectionManager,
    connection: &'a Connection,
}

#[async_trait]
impl OperationReplayer for Replay<'_> {
    async fn replay(&self, operation: &FsOperation) -> Result<()> {
        self.manager.apply_operation(self.connection, operation).await
    }
}

impl ConnectionManager {
    pub async fn stat(self: &Arc<Self>, connection_id: &str, path: &str) -> Result<FileStat> {
        let remote = RemotePath::new(connection_id, path);
        let cached = self.cache.lock().get_stat(&remote);
        if let Some(stat) = cached {
            return Ok(stat);
        }

        let conn = self.lookup(connection_id)?;
        let result = conn.stat(path).await;
        let stat = self.settle(&conn, || FsOperation::Stat { path: path.to_string() }, result)?;
        self.cache.lock().set_stat(&remote, stat.clone());
        Ok(stat)
    }

    pub async fn read_directory(
        self: &Arc<Self>,
        connection_id: &str,
        path: &str,
    ) -> Result<Vec<DirEntry>> {
        let remote = RemotePath::new(connection_id, path);
        let cached = self.cache.lock().get_directory(&remote);
        if let Some(entries) = cached {
            return Ok(entries);
        }

        let conn = self.lookup(connection_id)?;
        // Listings are not queued; they are fetched again on demand.
        let entries = conn.read_dir(path).await.map_err(|err| {
            self.note_failure(&conn, &err);
            err
        })?;
        self.cache.lock().set_directory(&remote, entries.clone());
        Ok(entries)
    }

    pub async fn read_file(self: &Arc<Self>, connection_id: &str, path: &str) -> Result<Vec<u8>> {
        let remote = RemotePath::new(connection_id, path);
        let cached = self.cache.lock().get_content(&remote);
        if let Some(content) = cached {
            return Ok(content);
        }

        if let Some(file_cache) = &self.file_cache {
            match file_cache.get_file(connection_id, path).await {
                Ok(Some(file)) => {
                    tracing::debug!("persistent cache hit for {}", remote);
                    let mut cache = self.cache.lock();
                    cache.set_stat(&remote, file.metadata.clone());
                    cache.set_content(&remote, file.content.clone());
                    return Ok(file.content);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("persistent cache lookup for {} failed: {}", remote, e),
            }
        }

        let conn = self.lookup(connection_id)?;
        let result = conn.read(path).await;
        let content = self.settle(&conn, || FsOperation::Read { path: path.to_string() }, result)?;
        self.store_content(&conn, path, &content).await;
        Ok(content)
    }

    pub async fn write_file(self: &Arc<Self>, connection_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let conn = self.lookup(connection_id)?;
        let result = conn.write(path, data).await;
        self.settle(
            &conn,
            || FsOperation::Write {
                path: path.to_string(),
                data: data.to_vec(),
            },
            result,
        )?;
        self.invalidate_paths(connection_id, &[path]).await;
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, connection_id: &str, path: &str) -> Result<()> {
        let conn = self.lookup(connection_id)?;
        let result = conn.remove(path).await;
        self.settle(&conn, || FsOperation::Delete { path: path.to_string() }, result)?;
        self.invalidate_paths(connection_id, &[path]).await;
        Ok(())
    }

    pub async fn create_directory(self: &Arc<Self>, connection_id: &str, path: &str) -> Result<()> {
        let conn = self.lookup(connection_id)?;
        let result = conn.mkdir(path).await;
        self.settle(&conn, || FsOperation::Mkdir { path: path.to_string() }, result)?;
        self.invalidate_paths(connection_id, &[path]).await;
        Ok(())
    }

    pub async fn remove_directory(self: &Arc<Self>, connection_id: &str, path: &str) -> Result<()> {
        let conn = self.lookup(connection_id)?;
        let result = conn.rmdir(path).await;
        self.settle(&conn, || FsOperation::Rmdir { path: path.to_string() }, result)?;
        self.invalidate_paths(connection_id, &[path]).await;
        Ok(())
    }

    pub async fn rename(self: &Arc<Self>, connection_id: &str, from: &str, to: &str) -> Result<()> {
        let conn = self.lookup(connection_id)?;
        let result = conn.rename(from, to).await;
        self.settle(
            &conn,
            || FsOperation::Rename {
                from: from.to_string(),
                to: to.to_string(),
            },
            result,
        )?;
        self.invalidate_paths(connection_id, &[from, to]).await;
        Ok(())
    }

    /// Passes `result` through, queueing the operation when
    /// [`note_failure`](Self::note_failure) says so.
    fn settle<T>(
        self: &Arc<Self>,
        conn: &Connection,
        operation: impl FnOnce() -> FsOperation,
        result: Result<T>,
    ) -> Result<T> {
        result.map_err(|err| {
            if self.note_failure(conn, &err) {
                let pending = self.queue.enqueue(conn.id(), operation());
                tracing::debug!("{} operations queued for {}", pending, conn.id());
            }
            err
        })
    }

    /// Network failures move the connection to `Reconnecting` and start a
    /// reconnect. Returns true when the failed call should be replayed later:
    /// on network failures and on calls made while already reconnecting.
    fn note_failure(self: &Arc<Self>, conn: &Connection, err: &SessionError) -> bool {
        if err.is_network() {
            tracing::warn!("network failure on {}: {}", conn.id(), err);
            if conn.mark_transport_lost() {
                self.spawn_reconnect(conn.id());
            }
            return true;
        }
        matches!(
            err,
            SessionError::NotConnected {
                status: ConnectionStatus::Reconnecting,
                ..
            }
        )
    }

    /// Runs one operation against the live transport and refreshes the caches.
    pub(crate) async fn apply_operation(&self, conn: &Connection, operation: &FsOperation) -> Result<()> {
        match operation {
            FsOperation::Read { path } => {
                let content = conn.read(path).await?;
                self.store_content(conn, path, &content).await;
            }
            FsOperation::Stat { path } => {
                let stat = conn.stat(path).await?;
                self.cache
                    .lock()
                    .set_stat(&RemotePath::new(conn.id(), path.as_str()), stat);
            }
            FsOperation::Write { path, data } => conn.write(path, data).await?,
            FsOperation::Delete { path } => conn.remove(path).await?,
            FsOperation::Mkdir { path } => conn.mkdir(path).await?,
            FsOperation::Rmdir { path } => conn.rmdir(path).await?,
            FsOperation::Rename { from, to } => conn.rename(from, to).await?,
        }

        if operation.is_mutation() {
            self.invalidate_paths(conn.id(), &operation.affected_paths())
                .await;
        }
        Ok(())
    }

    pub(crate) async fn replay_queue(&self, conn: &Connection) -> Result<ReplaySummary> {
        let replayer = Replay {
            manager: self,
            connection: conn,
        };
        let summary = self.queue.replay(conn.id(), &replayer).await?;
        if summary.replayed + summary.dropped > 0 {
            tracing::info!(
                "replayed {} operations on {} ({} dropped)",
                summary.replayed,
                conn.id(),
                summary.dropped
            );
        }
        Ok(summary)
    }

    async fn store_content(&self, conn: &Connection, path: &str, content: &[u8]) {
        let remote = RemotePath::new(conn.id(), path);
        let (cached_stat, stored) = {
            let mut cache = self.cache.lock();
            let stored = cache.set_content(&remote, content.to_vec());
            (cache.get_stat(&remote), stored)
        };
        if !stored {
            tracing::debug!("{} too large for the content cache", remote);
        }

        let Some(file_cache) = &self.file_cache else {
            return;
        };
        let metadata = match cached_stat {
            Some(stat) => stat,
            None => match conn.stat(path).await {
                Ok(stat) => {
                    self.cache.lock().set_stat(&remote, stat.clone());
                    stat
                }
                Err(e) => {
                    tracing::debug!("skipping persistent cache for {}: {}", remote, e);
                    return;
                }
            },
        };
        match file_cache.set_file(conn.id(), path, content, metadata).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("{} too large for the persistent cache", remote),
            Err(e) => tracing::warn!("could not persist {}: {}", remote, e),
        }
    }

    async fn invalidate_paths(&self, connection_id: &str, paths: &[&str]) {
        {
            let mut cache = self.cache.lock();
            for path in paths {
                cache.invalidate(&RemotePath::new(connection_id, *path));
            }
        }

        let Some(file_cache) = &self.file_cache else {
            return;
        };
        for path in paths {
            if let Err(e) = file_cache.invalidate_directory(connection_id, path).await {
                tracing::warn!("persistent cache invalidation of {}:{} failed: {}", connection_id, path, e);
            }
        }
    }
}
