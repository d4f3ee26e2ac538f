//! Periodic liveness probes for connected sessions.

use super::ConnectionManager;
use crate::connection::Connection;
use crate::prompt::Notice;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Outcome of one [`ConnectionManager::check_health`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    /// Connections whose probe failed and that were sent to reconnection.
    pub unhealthy: Vec<String>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }
}

impl ConnectionManager {
    /// Starts the probe timer, replacing any previous one. The task holds only
    /// a weak reference and ends once the manager is dropped.
    pub fn start_health_checks(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let manager = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let report = manager.check_health().await;
                if !report.all_healthy() {
                    tracing::warn!(
                        "health check: {}/{} healthy, reconnecting {:?}",
                        report.healthy,
                        report.checked,
                        report.unhealthy
                    );
                }
            }
            tracing::debug!("health check task finished");
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!("health checks every {:?}", interval);
    }

    pub fn stop_health_checks(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
            tracing::debug!("health checks stopped");
        }
    }

    /// Probes every connected session in turn. A failing probe moves the
    /// connection to `Reconnecting` and starts a reconnect; it never sets
    /// `Error` directly.
    pub async fn check_health(self: &Arc<Self>) -> HealthReport {
        let mut connected: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        connected.sort_by(|a, b| a.id().cmp(b.id()));

        let mut report = HealthReport::default();
        for conn in connected {
            report.checked += 1;
            match conn.execute(&self.config.health_check_command).await {
                Ok(_) => report.healthy += 1,
                Err(err) => {
                    tracing::warn!(connection = %conn.id(), "health check failed: {}", err);
                    report.unhealthy.push(conn.id().to_string());
                    if conn.mark_transport_lost() {
                        self.persist(&conn).await;
                        self.notify(Notice::warning(
                            conn.id(),
                            format!("Lost connection to {}", conn.config().endpoint()),
                        ));
                        self.spawn_reconnect(conn.id());
                    }
                }
            }
        }
        report
    }
}
