//! The reconnection sequence.
//!
//! One loop runs per connection at a time. Before every attempt the loop checks
//! that the connection is still `Reconnecting`, so a disconnect or cancel ends
//! it at the next check. Backoff sleeps wake early on either.

use super::ConnectionManager;
use crate::classify::{ErrorKind, ErrorRecord};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{Result, SessionError};
use crate::policy::RetryDecision;
use crate::prompt::{Notice, PromptAction};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

impl ConnectionManager {
    /// Re-establishes a connection from any state except `Connecting`, then
    /// replays its queued operations.
    ///
    /// If a reconnection is already running for `connection_id`, waits for it
    /// and reports its outcome instead of starting another.
    pub async fn reconnect(&self, connection_id: &str) -> Result<()> {
        let conn = self.lookup(connection_id)?;

        let _running = match conn.reconnect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("reconnection of {} already running, joining it", connection_id);
                let _finished = conn.reconnect_lock.lock().await;
                return match conn.status() {
                    ConnectionStatus::Connected => Ok(()),
                    status => Err(conn.last_error().map(SessionError::Remote).unwrap_or_else(
                        || SessionError::NotConnected {
                            id: connection_id.to_string(),
                            status,
                        },
                    )),
                };
            }
        };

        if !conn.begin_reconnect() {
            return Err(SessionError::NotConnected {
                id: connection_id.to_string(),
                status: conn.status(),
            });
        }
        self.persist(&conn).await;

        loop {
            self.reconnection_sequence(&conn).await?;
            match self.replay_queue(&conn).await {
                Err(err) if err.is_network() && conn.mark_transport_lost() => {
                    tracing::warn!("connection {} dropped during replay: {}", connection_id, err);
                    self.persist(&conn).await;
                }
                Err(err) => {
                    tracing::warn!("replay on {} stopped: {}", connection_id, err);
                    return Ok(());
                }
                Ok(_) => return Ok(()),
            }
        }
    }

    async fn reconnection_sequence(&self, conn: &Arc<Connection>) -> Result<()> {
        let id = conn.id();
        let policy = self.policy_for(conn.config());

        if policy.max_attempts == 0 {
            let record = conn.last_error().unwrap_or_else(|| {
                ErrorRecord::new(ErrorKind::Unknown, "no reconnection attempts allowed", Some(id))
            });
            conn.fail(record.clone());
            self.persist(conn).await;
            self.notify_failure(conn, &record, &[PromptAction::Retry, PromptAction::ShowDetails]);
            return Err(SessionError::ReconnectExhausted {
                id: id.to_string(),
                attempts: 0,
                record,
            });
        }

        self.notify(
            Notice::warning(id, format!("Reconnecting to {}", conn.config().endpoint()))
                .with_actions(&[PromptAction::Cancel]),
        );

        let mut attempt = 0;
        loop {
            if conn.status() != ConnectionStatus::Reconnecting {
                tracing::info!("reconnection of {} cancelled (status {})", id, conn.status());
                return Err(SessionError::ReconnectCancelled { id: id.to_string() });
            }
            attempt += 1;
            tracing::info!(
                connection = %id,
                attempt,
                max_attempts = policy.max_attempts,
                "reconnect attempt"
            );

            if let Err(e) = conn.teardown_transport().await {
                tracing::debug!("closing stale transport of {}: {}", id, e);
            }
            let err = match conn.connect().await {
                Ok(()) => {
                    self.on_reconnected(conn).await;
                    return Ok(());
                }
                Err(err) => err,
            };

            if conn.status() != ConnectionStatus::Reconnecting {
                return Err(SessionError::ReconnectCancelled { id: id.to_string() });
            }
            conn.set_reconnect_attempts(attempt);
            let record = err.to_record(Some(id));

            match policy.decide(attempt, record.kind) {
                RetryDecision::Stop => {
                    tracing::warn!("reconnection of {} stopped: {} is not retryable", id, record.kind);
                    conn.fail(record.clone());
                    self.persist(conn).await;
                    self.notify_failure(conn, &record, &[PromptAction::ShowDetails]);
                    return Err(SessionError::Remote(record));
                }
                RetryDecision::Exhausted => {
                    tracing::warn!("reconnection of {} gave up after {} attempts", id, attempt);
                    conn.fail(record.clone());
                    self.persist(conn).await;
                    self.notify_failure(
                        conn,
                        &record,
                        &[PromptAction::Retry, PromptAction::ShowDetails],
                    );
                    return Err(SessionError::ReconnectExhausted {
                        id: id.to_string(),
                        attempts: attempt,
                        record,
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    self.persist(conn).await;
                    tracing::debug!(
                        "attempt {} on {} failed ({}), retrying in {:?}",
                        attempt,
                        id,
                        record.kind,
                        delay
                    );
                    conn.pause(delay).await;
                }
            }
        }
    }

    async fn on_reconnected(&self, conn: &Connection) {
        let dropped = self.cache.lock().invalidate_connection(conn.id());
        tracing::info!(
            "connection {} re-established, dropped {} cached entries",
            conn.id(),
            dropped
        );
        self.persist(conn).await;
        self.notify(Notice::info(
            conn.id(),
            format!("Reconnected to {}", conn.config().endpoint()),
        ));
    }

    /// Like [`reconnect`](Self::reconnect), bounded by a wall-clock deadline.
    ///
    /// On expiry the connection is left in `Error` with a timeout record and
    /// the user is offered a retry; a later `reconnect` starts over.
    pub async fn reconnect_with_deadline(&self, connection_id: &str, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, self.reconnect(connection_id)).await {
            Ok(result) => result,
            Err(_) => {
                let conn = self.lookup(connection_id)?;
                let deadline_ms = deadline.as_millis() as u64;
                let record = ErrorRecord::new(
                    ErrorKind::NetworkTimeout,
                    format!("reconnection did not finish within {}ms", deadline_ms),
                    Some(connection_id),
                );
                if conn.status() == ConnectionStatus::Reconnecting {
                    conn.fail(record.clone());
                    self.persist(&conn).await;
                }
                self.notify_failure(&conn, &record, &[PromptAction::Retry]);
                Err(SessionError::ReconnectDeadline {
                    id: connection_id.to_string(),
                    deadline_ms,
                    record,
                })
            }
        }
    }

    /// Stops a running reconnection. Returns false if none was running.
    pub async fn cancel_reconnect(&self, connection_id: &str) -> Result<bool> {
        let conn = self.lookup(connection_id)?;
        let cancelled = conn.cancel_reconnect();
        if cancelled {
            self.persist(&conn).await;
            self.notify(Notice::info(connection_id, "Reconnection cancelled"));
        }
        Ok(cancelled)
    }

    /// Runs [`reconnect`](Self::reconnect) in the background.
    pub fn spawn_reconnect(self: &Arc<Self>, connection_id: &str) -> JoinHandle<Result<()>> {
        let manager = Arc::clone(self);
        let id = connection_id.to_string();
        tokio::spawn(async move {
            let result = manager.reconnect(&id).await;
            if let Err(e) = &result {
                tracing::warn!("background reconnection of {} ended: {}", id, e);
            }
            result
        })
    }
}
