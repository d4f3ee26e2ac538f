//! User-prompt capability.
//!
//! Notices are fire-and-forget: the manager never waits for an answer. A prompt
//! surface that offers actions reports the user's choice back through
//! [`ConnectionManager::handle_action`](crate::manager::ConnectionManager::handle_action).

use crate::classify::ErrorRecord;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    Retry,
    Reconnect,
    Cancel,
    ShowDetails,
}

impl PromptAction {
    pub fn label(self) -> &'static str {
        match self {
            PromptAction::Retry => "Retry",
            PromptAction::Reconnect => "Reconnect",
            PromptAction::Cancel => "Cancel",
            PromptAction::ShowDetails => "Show Details",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub severity: Severity,
    pub connection_id: Option<String>,
    pub message: String,
    pub actions: Vec<PromptAction>,
    pub error: Option<ErrorRecord>,
}

impl Notice {
    fn new(severity: Severity, connection_id: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            connection_id: Some(connection_id.to_string()),
            message: message.into(),
            actions: Vec::new(),
            error: None,
        }
    }

    pub fn info(connection_id: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, connection_id, message)
    }

    pub fn warning(connection_id: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, connection_id, message)
    }

    pub fn error(connection_id: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, connection_id, message)
    }

    pub fn with_actions(mut self, actions: &[PromptAction]) -> Self {
        self.actions = actions.to_vec();
        self
    }

    pub fn with_error(mut self, record: ErrorRecord) -> Self {
        self.error = Some(record);
        self
    }
}

pub trait UserPrompt: Send + Sync {
    /// Must return promptly; implementations queue or forward the notice.
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. Used when no interactive surface is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPrompt;

impl UserPrompt for TracingPrompt {
    fn notify(&self, notice: Notice) {
        let id = notice.connection_id.as_deref().unwrap_or("-");
        match notice.severity {
            Severity::Info => tracing::info!(connection = %id, "{}", notice.message),
            Severity::Warning => tracing::warn!(connection = %id, "{}", notice.message),
            Severity::Error => {
                let kind = notice.error.as_ref().map(|e| e.kind.as_str()).unwrap_or("-");
                tracing::error!(connection = %id, kind = %kind, "{}", notice.message)
            }
        }
    }
}

/// Forwards notices to a channel consumed by a UI task.
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelPrompt {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UserPrompt for ChannelPrompt {
    fn notify(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            tracing::debug!("prompt receiver dropped, notice discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;

    #[test]
    fn test_notice_builders() {
        let record = ErrorRecord::new(ErrorKind::NetworkTimeout, "t", Some("c1"));
        let notice = Notice::error("c1", "lost")
            .with_actions(&[PromptAction::Retry, PromptAction::ShowDetails])
            .with_error(record.clone());
        assert_eq!(notice.severity, Severity::Error);
        assert_eq!(notice.actions.len(), 2);
        assert_eq!(notice.error, Some(record));
        assert_eq!(PromptAction::ShowDetails.label(), "Show Details");
    }

    #[tokio::test]
    async fn test_channel_prompt_forwards() {
        let (prompt, mut rx) = ChannelPrompt::channel();
        prompt.notify(Notice::info("c1", "hello"));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.message, "hello");
        assert_eq!(notice.connection_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_channel_prompt_tolerates_closed_receiver() {
        let (prompt, rx) = ChannelPrompt::channel();
        drop(rx);
        prompt.notify(Notice::warning("c1", "nobody listening"));
    }

    #[test]
    fn test_tracing_prompt_does_not_panic() {
        TracingPrompt.notify(Notice::error("c1", "boom"));
        TracingPrompt.notify(Notice::info("c1", "ok"));
    }
}
