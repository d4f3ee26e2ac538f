use crate::classify::{ErrorKind, ErrorRecord};
use crate::connection::ConnectionStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid connection config: {reason}")]
    InvalidConfig { reason: String },

    #[error("connection {id} not found")]
    ConnectionNotFound { id: String },

    #[error("connection {id} is not established (status: {status})")]
    NotConnected { id: String, status: ConnectionStatus },

    #[error("{0}")]
    Remote(ErrorRecord),

    #[error("reconnection of {id} was cancelled")]
    ReconnectCancelled { id: String },

    #[error("reconnection of {id} failed after {attempts} attempts: {record}")]
    ReconnectExhausted {
        id: String,
        attempts: u32,
        record: ErrorRecord,
    },

    #[error("reconnection of {id} did not finish within {deadline_ms}ms")]
    ReconnectDeadline {
        id: String,
        deadline_ms: u64,
        record: ErrorRecord,
    },

    #[error("state store error: {0}")]
    Store(String),

    #[error("cache error: {0}")]
    Cache(#[from] tether_cache::CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidConfig { .. } => ErrorKind::ConfigurationError,
            SessionError::Remote(record)
            | SessionError::ReconnectExhausted { record, .. }
            | SessionError::ReconnectDeadline { record, .. } => record.kind,
            SessionError::ConnectionNotFound { .. }
            | SessionError::NotConnected { .. }
            | SessionError::ReconnectCancelled { .. }
            | SessionError::Store(_)
            | SessionError::Cache(_)
            | SessionError::Io(_) => ErrorKind::Unknown,
        }
    }

    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            SessionError::Remote(record)
            | SessionError::ReconnectExhausted { record, .. }
            | SessionError::ReconnectDeadline { record, .. } => Some(record),
            _ => None,
        }
    }

    /// Classified view of this error, suitable for surfacing to a user.
    pub fn to_record(&self, connection_id: Option<&str>) -> ErrorRecord {
        match self.record() {
            Some(record) => record.clone(),
            None => ErrorRecord::new(self.kind(), self.to_string(), connection_id),
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind().is_network()
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawError;

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let err = SessionError::InvalidConfig {
            reason: "host is required".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(err.to_string(), "invalid connection config: host is required");
        let record = err.to_record(Some("c1"));
        assert_eq!(record.kind, ErrorKind::ConfigurationError);
        assert_eq!(record.source.as_deref(), Some("invalid connection config: host is required"));
    }

    #[test]
    fn test_remote_error_carries_record() {
        let record = ErrorRecord::classify(&RawError::with_code("reset", "ECONNRESET"), Some("c1"));
        let err = SessionError::Remote(record.clone());
        assert!(err.is_network());
        assert_eq!(err.record(), Some(&record));
        assert_eq!(err.to_string(), record.message);
    }

    #[test]
    fn test_not_connected_message() {
        let err = SessionError::NotConnected {
            id: "c1".to_string(),
            status: ConnectionStatus::Reconnecting,
        };
        assert_eq!(err.to_string(), "connection c1 is not established (status: reconnecting)");
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }
}
