use crate::error::{Result, SessionError};
use crate::policy::{ReconnectOverrides, ReconnectPolicy};
use crate::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tether_cache::{CacheTierConfig, PersistentCacheConfig};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const HEALTH_CHECK_COMMAND: &str = "echo \"health_check\"";

/// How a connection authenticates, with the secret material it needs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    Key {
        private_key_path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
    Agent {
        /// Agent socket; `$SSH_AUTH_SOCK` when unset.
        #[serde(default)]
        socket: Option<PathBuf>,
    },
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::Agent { .. } => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::Key {
                private_key_path,
                passphrase,
            } => f
                .debug_struct("Key")
                .field("private_key_path", private_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::Agent { socket } => {
                f.debug_struct("Agent").field("socket", socket).finish()
            }
        }
    }
}

fn default_ready_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub auth: AuthMethod,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "ReconnectOverrides::is_empty")]
    pub reconnect: ReconnectOverrides,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: username.into(),
            auth,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            reconnect: ReconnectOverrides::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ready_timeout_ms(mut self, ms: u64) -> Self {
        self.ready_timeout_ms = ms;
        self
    }

    pub fn with_reconnect(mut self, overrides: ReconnectOverrides) -> Self {
        self.reconnect = overrides;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// `user@host:port`, for logs and notices.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port())
    }

    /// Private key path with a leading `~/` expanded against `$HOME`.
    pub fn resolved_key_path(&self) -> Option<PathBuf> {
        match &self.auth {
            AuthMethod::Key {
                private_key_path, ..
            } => Some(expand_home(private_key_path)),
            _ => None,
        }
    }

    /// Agent socket, falling back to `$SSH_AUTH_SOCK`.
    pub fn resolved_agent_socket(&self) -> Option<PathBuf> {
        match &self.auth {
            AuthMethod::Agent { socket } => socket
                .clone()
                .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from)),
            _ => None,
        }
    }

    /// Checks the config without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host is required"));
        }
        if self.username.trim().is_empty() {
            return Err(invalid("username is required"));
        }
        if self.port == Some(0) {
            return Err(invalid("port must be between 1 and 65535"));
        }

        match &self.auth {
            AuthMethod::Password { password } => {
                if password.is_empty() {
                    return Err(invalid("password is required for password authentication"));
                }
            }
            AuthMethod::Key {
                private_key_path, ..
            } => {
                if private_key_path.as_os_str().is_empty() {
                    return Err(invalid("private key path is required for key authentication"));
                }
                let path = expand_home(private_key_path);
                if !path.exists() {
                    return Err(invalid(format!(
                        "private key file not found: {}",
                        path.display()
                    )));
                }
                if let Err(e) = std::fs::File::open(&path) {
                    return Err(invalid(format!(
                        "private key file is not readable: {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
            AuthMethod::Agent { .. } => match self.resolved_agent_socket() {
                None => {
                    return Err(invalid(
                        "ssh agent is not available (SSH_AUTH_SOCK is not set)",
                    ))
                }
                Some(socket) if !socket.exists() => {
                    return Err(invalid(format!(
                        "ssh agent socket not found: {}",
                        socket.display()
                    )))
                }
                Some(_) => {}
            },
        }

        if let Some(factor) = self.reconnect.backoff_factor {
            if !factor.is_finite() || factor < 1.0 {
                return Err(invalid("reconnect backoff factor must be at least 1.0"));
            }
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(invalid("reconnect max attempts must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SessionError {
    SessionError::InvalidConfig {
        reason: reason.into(),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Manager-wide settings, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub health_check_interval_ms: u64,
    pub health_check_command: String,
    pub reconnect: ReconnectPolicy,
    pub cache: CacheTierConfig,
    pub queue: QueueConfig,
    pub persistent_cache: Option<PersistentCacheConfig>,
    pub state_file: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            health_check_command: HEALTH_CHECK_COMMAND.to_string(),
            reconnect: ReconnectPolicy::default(),
            cache: CacheTierConfig::default(),
            queue: QueueConfig::default(),
            persistent_cache: None,
            state_file: None,
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            other => anyhow::bail!("unsupported config format: {:?}", other),
        }
    }
}
