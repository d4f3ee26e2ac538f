//! A single remote session and its state machine.
//!
//! ```text
//! Disconnected/Error --connect--> Connecting --ready--> Connected
//! Connecting --transport error--> Error
//! Connected --health check failure / transport close--> Reconnecting
//! Reconnecting --attempt succeeds--> Connected
//! Reconnecting --terminal error / attempts exhausted--> Error
//! any --disconnect--> Disconnected
//! ```
//!
//! The connection owns its transport exclusively; callers go through
//! [`Connection::execute`], [`Connection::open_data_channel`] and
//! [`Connection::open_shell`].

use crate::classify::{ErrorKind, ErrorRecord};
use crate::config::ConnectionConfig;
use crate::error::{Result, SessionError};
use crate::state::PersistedConnectionState;
use crate::transport::{
    CommandOutput, Connector, FileChannel, RawError, ShellChannel, ShellRequest, Transport,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tether_cache::{DirEntry, FileStat};
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected | Error, Connecting)
                | (Connecting, Connected | Error)
                | (Connected, Reconnecting)
                | (Disconnected | Error, Reconnecting)
                | (Reconnecting, Connected | Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Handshake = Shared<BoxFuture<'static, std::result::Result<(), ErrorRecord>>>;

#[derive(Default)]
struct HandshakeSlot {
    generation: u64,
    pending: Option<Handshake>,
}

struct ConnectionState {
    status: ConnectionStatus,
    last_connected: Option<SystemTime>,
    last_error: Option<ErrorRecord>,
    reconnect_attempts: u32,
}

fn transition(id: &str, state: &mut ConnectionState, next: ConnectionStatus) -> bool {
    if state.status == next {
        return true;
    }
    if !state.status.can_transition_to(next) {
        tracing::debug!(
            "connection {}: ignoring transition {} -> {}",
            id,
            state.status,
            next
        );
        return false;
    }
    tracing::debug!("connection {}: {} -> {}", id, state.status, next);
    state.status = next;
    true
}

pub struct Connection {
    id: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    transport: RwLock<Option<Box<dyn Transport>>>,
    file_channel: tokio::sync::Mutex<Option<Arc<dyn FileChannel>>>,
    handshake: Mutex<HandshakeSlot>,
    pub(crate) reconnect_lock: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            config,
            connector,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                last_connected: None,
                last_error: None,
                reconnect_attempts: 0,
            }),
            transport: RwLock::new(None),
            file_channel: tokio::sync::Mutex::new(None),
            handshake: Mutex::new(HandshakeSlot::default()),
            reconnect_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn last_connected(&self) -> Option<SystemTime> {
        self.state.lock().last_connected
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.state.lock().last_error.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    pub fn persisted_state(&self) -> PersistedConnectionState {
        let state = self.state.lock();
        let mut record = PersistedConnectionState::new(self.id.clone(), self.config.clone());
        record.status = state.status;
        record.reconnect_attempts = state.reconnect_attempts;
        record.last_error = state.last_error.clone();
        record
    }

    /// Validates the config and performs the handshake.
    ///
    /// Concurrent callers share one in-flight handshake. Returns at once when
    /// already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;
        if self.is_connected() {
            return Ok(());
        }

        let pending = {
            let mut slot = self.handshake.lock();
            if let Some(pending) = slot.pending.clone() {
                pending
            } else {
                slot.generation += 1;
                let pending = Arc::clone(self)
                    .run_handshake(slot.generation)
                    .boxed()
                    .shared();
                slot.pending = Some(pending.clone());
                pending
            }
        };

        pending.await.map_err(SessionError::Remote)
    }

    async fn run_handshake(self: Arc<Self>, generation: u64) -> std::result::Result<(), ErrorRecord> {
        let result = self.open_transport().await;
        let mut slot = self.handshake.lock();
        if slot.generation == generation {
            slot.pending = None;
        }
        result
    }

    async fn open_transport(&self) -> std::result::Result<(), ErrorRecord> {
        {
            let mut state = self.state.lock();
            match state.status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {}
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                    transition(&self.id, &mut state, ConnectionStatus::Connecting);
                }
            }
        }

        tracing::info!("connection {}: opening {}", self.id, self.config.endpoint());
        let ready_timeout = Duration::from_millis(self.config.ready_timeout_ms);
        let opened =
            match tokio::time::timeout(ready_timeout, self.connector.open(&self.config)).await {
                Ok(result) => result,
                Err(_) => Err(RawError::with_code(
                    format!(
                        "timed out after {}ms waiting for the handshake",
                        self.config.ready_timeout_ms
                    ),
                    "ETIMEDOUT",
                )),
            };

        match opened {
            Ok(transport) => self.install(transport).await,
            Err(raw) => {
                let record = ErrorRecord::classify(&raw, Some(&self.id));
                tracing::warn!(
                    "connection {}: handshake failed ({}): {}",
                    self.id,
                    record.kind,
                    raw
                );
                let mut state = self.state.lock();
                state.last_error = Some(record.clone());
                if state.status == ConnectionStatus::Connecting {
                    transition(&self.id, &mut state, ConnectionStatus::Error);
                }
                Err(record)
            }
        }
    }

    async fn install(&self, transport: Box<dyn Transport>) -> std::result::Result<(), ErrorRecord> {
        let mut slot = self.transport.write().await;
        let accepted = {
            let mut state = self.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            ) {
                transition(&self.id, &mut state, ConnectionStatus::Connected);
                state.last_connected = Some(SystemTime::now());
                state.last_error = None;
                state.reconnect_attempts = 0;
                true
            } else {
                false
            }
        };

        if accepted {
            *slot = Some(transport);
            tracing::info!("connection {}: established", self.id);
            return Ok(());
        }

        // Disconnected while the handshake was in flight.
        drop(slot);
        if let Err(e) = transport.close().await {
            tracing::debug!("connection {}: closing discarded transport: {}", self.id, e);
        }
        Err(ErrorRecord::new(
            ErrorKind::Unknown,
            "connection attempt was cancelled",
            Some(&self.id),
        ))
    }

    fn not_connected(&self) -> SessionError {
        SessionError::NotConnected {
            id: self.id.clone(),
            status: self.status(),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.not_connected())
        }
    }

    fn classified(&self, raw: &RawError) -> SessionError {
        let record = ErrorRecord::classify(raw, Some(&self.id));
        tracing::debug!("connection {}: {} ({})", self.id, raw, record.kind);
        SessionError::Remote(record)
    }

    /// Runs a command. Rejected unless the connection is `Connected`.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.ensure_connected()?;
        let guard = self.transport.read().await;
        let transport = guard.as_deref().ok_or_else(|| self.not_connected())?;
        transport
            .execute(command)
            .await
            .map_err(|raw| self.classified(&raw))
    }

    pub async fn open_shell(&self, request: &ShellRequest) -> Result<Box<dyn ShellChannel>> {
        self.ensure_connected()?;
        let guard = self.transport.read().await;
        let transport = guard.as_deref().ok_or_else(|| self.not_connected())?;
        transport
            .open_shell(request)
            .await
            .map_err(|raw| self.classified(&raw))
    }

    /// File channel for this session, opened on first use and reused until
    /// the transport is torn down.
    pub async fn open_data_channel(&self) -> Result<Arc<dyn FileChannel>> {
        self.ensure_connected()?;
        let mut cached = self.file_channel.lock().await;
        if let Some(channel) = cached.as_ref() {
            return Ok(Arc::clone(channel));
        }

        let guard = self.transport.read().await;
        let transport = guard.as_deref().ok_or_else(|| self.not_connected())?;
        let channel: Arc<dyn FileChannel> = Arc::from(
            transport
                .open_file_channel()
                .await
                .map_err(|raw| self.classified(&raw))?,
        );
        *cached = Some(Arc::clone(&channel));
        Ok(channel)
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let channel = self.open_data_channel().await?;
        channel.stat(path).await.map_err(|raw| self.classified(&raw))
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let channel = self.open_data_channel().await?;
        channel
            .read_dir(path)
            .await
            .map_err(|raw| self.classified(&raw))
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let channel = self.open_data_channel().await?;
        channel.read(path).await.map_err(|raw| self.classified(&raw))
    }

    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let channel = self.open_data_channel().await?;
        channel
            .write(path, data)
            .await
            .map_err(|raw| self.classified(&raw))
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let channel = self.open_data_channel().await?;
        channel.remove(path).await.map_err(|raw| self.classified(&raw))
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let channel = self.open_data_channel().await?;
        channel.mkdir(path).await.map_err(|raw| self.classified(&raw))
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let channel = self.open_data_channel().await?;
        channel.rmdir(path).await.map_err(|raw| self.classified(&raw))
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let channel = self.open_data_channel().await?;
        channel
            .rename(from, to)
            .await
            .map_err(|raw| self.classified(&raw))
    }

    /// Moves to `Disconnected`, wakes any backoff sleep and closes the transport.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            transition(&self.id, &mut state, ConnectionStatus::Disconnected);
        }
        self.handshake.lock().pending = None;
        self.wake.notify_waiters();
        self.teardown_transport().await
    }

    /// Drops the file channel and closes the transport without touching status.
    pub(crate) async fn teardown_transport(&self) -> Result<()> {
        self.file_channel.lock().await.take();
        let transport = self.transport.write().await.take();
        match transport {
            Some(transport) => {
                tracing::debug!("connection {}: closing transport", self.id);
                transport.close().await.map_err(|raw| self.classified(&raw))
            }
            None => Ok(()),
        }
    }

    /// Connected -> Reconnecting. False if the connection was not `Connected`.
    pub(crate) fn mark_transport_lost(&self) -> bool {
        let mut state = self.state.lock();
        state.status == ConnectionStatus::Connected
            && transition(&self.id, &mut state, ConnectionStatus::Reconnecting)
    }

    /// Enters `Reconnecting` for a manual reconnect. False while a first
    /// handshake is still in flight.
    pub(crate) fn begin_reconnect(&self) -> bool {
        let mut state = self.state.lock();
        transition(&self.id, &mut state, ConnectionStatus::Reconnecting)
    }

    /// Reconnecting -> Disconnected, waking the reconnection loop.
    pub(crate) fn cancel_reconnect(&self) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            state.status == ConnectionStatus::Reconnecting
                && transition(&self.id, &mut state, ConnectionStatus::Disconnected)
        };
        if cancelled {
            self.wake.notify_waiters();
        }
        cancelled
    }

    pub(crate) fn fail(&self, record: ErrorRecord) {
        let mut state = self.state.lock();
        transition(&self.id, &mut state, ConnectionStatus::Error);
        state.last_error = Some(record);
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.state.lock().reconnect_attempts = attempts;
    }

    /// Sleeps for `delay`, returning early on disconnect or cancellation.
    pub(crate) async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wake.notified() => {}
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.config.endpoint())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMethod;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTransport {
        exec_error: Option<RawError>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn execute(&self, command: &str) -> std::result::Result<CommandOutput, RawError> {
            match &self.exec_error {
                Some(e) => Err(e.clone()),
                None => Ok(CommandOutput {
                    stdout: command.to_string(),
                    ..Default::default()
                }),
            }
        }

        async fn open_file_channel(
            &self,
        ) -> std::result::Result<Box<dyn FileChannel>, RawError> {
            Err(RawError::new("sftp subsystem unavailable"))
        }

        async fn open_shell(
            &self,
            _request: &ShellRequest,
        ) -> std::result::Result<Box<dyn ShellChannel>, RawError> {
            let (local, _remote) = tokio::io::duplex(64);
            Ok(Box::new(local))
        }

        async fn close(&self) -> std::result::Result<(), RawError> {
            Ok(())
        }
    }

    struct TestConnector {
        calls: AtomicUsize,
        delay: Duration,
        error: Option<RawError>,
        exec_error: Option<RawError>,
    }

    impl TestConnector {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                error: None,
                exec_error: None,
            }
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn open(
            &self,
            _config: &ConnectionConfig,
        ) -> std::result::Result<Box<dyn Transport>, RawError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(EchoTransport {
                    exec_error: self.exec_error.clone(),
                })),
            }
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(
            "example.com",
            "alice",
            AuthMethod::Password {
                password: "pw".to_string(),
            },
        )
    }

    fn connection(connector: TestConnector) -> (Arc<Connection>, Arc<TestConnector>) {
        let connector = Arc::new(connector);
        let conn = Connection::new("c1", config(), connector.clone());
        (conn, connector)
    }

    #[test]
    fn test_transition_table() {
        use ConnectionStatus::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Error));
        for from in [Disconnected, Connecting, Connected, Reconnecting, Error] {
            assert!(from.can_transition_to(Disconnected));
        }
        assert!(!Connected.can_transition_to(Error));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (conn, connector) = connection(TestConnector::ok());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.last_connected().is_some());
        assert_eq!(conn.reconnect_attempts(), 0);

        conn.connect().await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_handshake() {
        let (conn, connector) = connection(TestConnector {
            delay: Duration::from_millis(50),
            ..TestConnector::ok()
        });
        let (a, b, c) = tokio::join!(conn.connect(), conn.connect(), conn.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_handshake() {
        let connector = Arc::new(TestConnector::ok());
        let config = ConnectionConfig::new(
            "example.com",
            "alice",
            AuthMethod::Key {
                private_key_path: PathBuf::from("/missing"),
                passphrase: None,
            },
        );
        let conn = Connection::new("c1", config, connector.clone());
        let err = conn.connect().await.unwrap_err();
        assert!(err.to_string().contains("private key file not found"));
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_failure_moves_to_error() {
        let (conn, _) = connection(TestConnector {
            error: Some(RawError::with_code("connect ECONNREFUSED", "ECONNREFUSED")),
            ..TestConnector::ok()
        });
        let err = conn.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert_eq!(conn.status(), ConnectionStatus::Error);
        assert_eq!(
            conn.last_error().map(|e| e.kind),
            Some(ErrorKind::ConnectionRefused)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_is_network_timeout() {
        let connector = Arc::new(TestConnector {
            delay: Duration::from_secs(60),
            ..TestConnector::ok()
        });
        let conn = Connection::new("c1", config().with_ready_timeout_ms(100), connector);
        let err = conn.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkTimeout);
        assert_eq!(conn.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_execute_rejected_unless_connected() {
        let (conn, _) = connection(TestConnector::ok());
        let err = conn.execute("ls").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotConnected {
                status: ConnectionStatus::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_execute_returns_output() {
        let (conn, _) = connection(TestConnector::ok());
        conn.connect().await.unwrap();
        let out = conn.execute("echo hi").await.unwrap();
        assert_eq!(out.stdout, "echo hi");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_execute_errors_are_classified() {
        let (conn, _) = connection(TestConnector {
            exec_error: Some(RawError::with_code("read ECONNRESET", "ECONNRESET")),
            ..TestConnector::ok()
        });
        conn.connect().await.unwrap();
        let err = conn.execute("ls").await.unwrap_err();
        assert!(err.is_network());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_data_channel_errors_are_classified() {
        let (conn, _) = connection(TestConnector::ok());
        conn.connect().await.unwrap();
        let err = conn.stat("/etc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SftpError);
    }

    #[tokio::test]
    async fn test_open_shell() {
        let (conn, _) = connection(TestConnector::ok());
        assert!(conn.open_shell(&ShellRequest::default()).await.is_err());
        conn.connect().await.unwrap();
        assert!(conn.open_shell(&ShellRequest::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_tears_down() {
        let (conn, _) = connection(TestConnector::ok());
        conn.connect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(conn.execute("ls").await.is_err());
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_lost_only_from_connected() {
        let (conn, _) = connection(TestConnector::ok());
        assert!(!conn.mark_transport_lost());
        conn.connect().await.unwrap();
        assert!(conn.mark_transport_lost());
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);
        assert!(!conn.mark_transport_lost());
        assert!(conn.cancel_reconnect());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_fail_from_reconnecting_records_error() {
        let (conn, _) = connection(TestConnector::ok());
        conn.connect().await.unwrap();
        conn.mark_transport_lost();
        conn.fail(ErrorRecord::new(ErrorKind::KeyRejected, "key rejected", Some("c1")));
        assert_eq!(conn.status(), ConnectionStatus::Error);
        assert_eq!(conn.persisted_state().status, ConnectionStatus::Error);
        assert_eq!(
            conn.persisted_state().last_error.map(|e| e.kind),
            Some(ErrorKind::KeyRejected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_handshake_discards_transport() {
        let (conn, _) = connection(TestConnector {
            delay: Duration::from_millis(100),
            ..TestConnector::ok()
        });
        let pending = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(conn.status(), ConnectionStatus::Connecting);

        conn.disconnect().await.unwrap();
        let result = pending.await.unwrap();
        assert!(result.is_err());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_wakes_on_cancel() {
        let (conn, _) = connection(TestConnector::ok());
        conn.connect().await.unwrap();
        conn.mark_transport_lost();
        let sleeper = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let start = tokio::time::Instant::now();
                conn.pause(Duration::from_secs(3600)).await;
                start.elapsed()
            })
        };
        tokio::task::yield_now().await;
        conn.cancel_reconnect();
        let slept = sleeper.await.unwrap();
        assert!(slept < Duration::from_secs(3600));
    }
}
