#![warn(missing_docs)]

//! tether session subsystem
//!
//! Keeps remote sessions alive: connections with an explicit state machine,
//! error classification with troubleshooting guidance, backoff-driven
//! reconnection, and replay of filesystem operations that failed while the
//! network was down.

pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod policy;
pub mod prompt;
pub mod queue;
pub mod state;
pub mod transport;

pub use classify::{classify, render_troubleshooting, ErrorKind, ErrorRecord};
pub use config::{AuthMethod, ConnectionConfig, ManagerConfig};
pub use connection::{Connection, ConnectionStatus};
pub use error::{Result, SessionError};
pub use manager::{ConnectionManager, HealthReport};
pub use policy::{backoff_delay, ReconnectOverrides, ReconnectPolicy, RetryDecision};
pub use prompt::{ChannelPrompt, Notice, PromptAction, Severity, TracingPrompt, UserPrompt};
pub use queue::{FsOperation, OperationKind, OperationQueue, OperationReplayer, QueueConfig, QueuedOperation, ReplaySummary};
pub use state::{JsonFileStateStore, MemoryStateStore, PersistedConnectionState, StateStore, StateUpdate};
pub use transport::{CommandOutput, Connector, FileChannel, RawError, ShellChannel, ShellRequest, Transport};
