//! Types for operator notifications.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to start mailer: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Mailer failed: {0}")]
    Failed(String),

    #[error("Mailer timed out")]
    Timeout,

    #[error("No recipient configured")]
    NoRecipient,
}

/// One message to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifier name for logging.
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}
