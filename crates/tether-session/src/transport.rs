//! Transport capability boundary.
//!
//! The wire protocol lives outside this crate. A [`Connector`] performs the
//! handshake and hands back a [`Transport`], which a [`Connection`] then owns
//! exclusively. File and shell traffic goes through channels opened on that
//! transport.
//!
//! [`Connection`]: crate::connection::Connection

use crate::config::ConnectionConfig;
use async_trait::async_trait;
use tether_cache::{DirEntry, FileStat};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// An unclassified error reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RawError {
    pub message: String,
    /// Errno-style code such as `ECONNRESET`, when the transport knows one.
    pub code: Option<String>,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

impl From<std::io::Error> for RawError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        let code = match err.kind() {
            K::TimedOut => Some("ETIMEDOUT"),
            K::ConnectionRefused => Some("ECONNREFUSED"),
            K::ConnectionReset => Some("ECONNRESET"),
            K::ConnectionAborted => Some("ECONNABORTED"),
            K::BrokenPipe => Some("EPIPE"),
            K::UnexpectedEof => Some("ECONNRESET"),
            K::NotFound => Some("ENOENT"),
            K::PermissionDenied => Some("EACCES"),
            K::AlreadyExists => Some("EEXIST"),
            K::InvalidInput => Some("EINVAL"),
            _ => None,
        };
        Self {
            message: err.to_string(),
            code: code.map(str::to_string),
        }
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Establishes transports. Shared by every connection a manager creates.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Performs the handshake for `config`.
    ///
    /// The caller bounds this with the config's ready timeout.
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, RawError>;
}

/// A live, authenticated session to a remote host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs a command and collects its output.
    async fn execute(&self, command: &str) -> Result<CommandOutput, RawError>;

    /// Opens a channel for file operations.
    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>, RawError>;

    /// Opens an interactive shell channel.
    async fn open_shell(&self, request: &ShellRequest) -> Result<Box<dyn ShellChannel>, RawError>;

    /// Closes the session. Further calls on this transport fail.
    async fn close(&self) -> Result<(), RawError>;
}

/// File operations over a data channel.
#[async_trait]
pub trait FileChannel: Send + Sync {
    async fn stat(&self, path: &str) -> Result<FileStat, RawError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RawError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, RawError>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), RawError>;
    async fn remove(&self, path: &str) -> Result<(), RawError>;
    async fn mkdir(&self, path: &str) -> Result<(), RawError>;
    async fn rmdir(&self, path: &str) -> Result<(), RawError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), RawError>;
}

/// A byte stream to an interactive shell.
pub trait ShellChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ShellChannel for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify_raw, ErrorKind};

    #[test]
    fn test_io_errors_map_to_codes() {
        let cases = [
            (std::io::ErrorKind::TimedOut, ErrorKind::NetworkTimeout),
            (std::io::ErrorKind::ConnectionRefused, ErrorKind::ConnectionRefused),
            (std::io::ErrorKind::BrokenPipe, ErrorKind::NetworkTimeout),
            (std::io::ErrorKind::NotFound, ErrorKind::FileNotFound),
            (std::io::ErrorKind::PermissionDenied, ErrorKind::PermissionDenied),
        ];
        for (io_kind, expected) in cases {
            let raw = RawError::from(std::io::Error::new(io_kind, "x"));
            assert_eq!(classify_raw(&raw), expected, "{:?}", io_kind);
        }
    }

    #[test]
    fn test_unmapped_io_error_has_no_code() {
        let raw = RawError::from(std::io::Error::new(std::io::ErrorKind::Other, "odd"));
        assert!(raw.code.is_none());
        assert_eq!(raw.to_string(), "odd");
    }

    #[test]
    fn test_shell_request_defaults() {
        let req = ShellRequest::default();
        assert_eq!((req.cols, req.rows), (80, 24));
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            stdout: "health_check\n".to_string(),
            ..Default::default()
        };
        assert!(ok.success());
        let failed = CommandOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
