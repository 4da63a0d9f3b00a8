//! Operator notifications.
//!
//! Components report events through `Notifications`, which applies the
//! configured toggles and never lets a delivery failure escape into the
//! caller's state handling.

mod sendmail;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

pub use sendmail::{LogNotifier, SendmailNotifier};
pub use types::*;

use crate::config::NotifyConfig;

/// Build the notifier for the configuration: sendmail when a recipient is
/// configured, the log otherwise.
pub fn create_notifier(config: &NotifyConfig) -> Arc<dyn Notifier> {
    if config.any_enabled() && config.recipient.is_some() {
        match SendmailNotifier::new(config) {
            Ok(notifier) => return Arc::new(notifier),
            Err(e) => warn!("Falling back to log notifications: {}", e),
        }
    }
    Arc::new(LogNotifier)
}

/// Details of a failed processing attempt.
#[derive(Debug, Clone)]
pub struct JobFailure<'a> {
    pub job_id: i64,
    pub queue_id: Option<&'a str>,
    pub errors: &'a str,
    pub files: &'a [PathBuf],
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Notification toggles applied to one notifier.
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    config: NotifyConfig,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, config: NotifyConfig) -> Self {
        Self { notifier, config }
    }

    /// Notifications that are all switched off.
    pub fn disabled() -> Self {
        Self::new(Arc::new(LogNotifier), NotifyConfig::default())
    }

    /// A processing attempt failed and will be retried.
    pub async fn job_failed(&self, failure: &JobFailure<'_>) {
        if !self.config.send_on_failure {
            return;
        }
        let subject = format!(
            "Job {} failed (attempt {} of {})",
            failure.job_id, failure.attempt, failure.max_attempts
        );
        self.deliver(subject, failure_body(failure, None)).await;
    }

    /// A job exhausted its attempts.
    pub async fn terminal_failure(&self, failure: &JobFailure<'_>, rawdata_deleted: bool) {
        if !self.config.send_on_terminal_failure {
            return;
        }
        let subject = format!("Job {} terminally failed", failure.job_id);
        let note = if rawdata_deleted {
            "Raw data files have been deleted."
        } else {
            "Raw data files were kept."
        };
        self.deliver(subject, failure_body(failure, Some(note))).await;
    }

    /// A job can never run.
    pub async fn precheck_failed(&self, job_id: i64, reason: &str, files: &[PathBuf]) {
        if !self.config.send_on_terminal_failure {
            return;
        }
        let subject = format!("Job {} failed presubmission check", job_id);
        let body = format!(
            "Job {} was marked terminal_failure without being submitted.\n\nReason: {}\n\nData files:\n{}",
            job_id,
            reason,
            file_list(files)
        );
        self.deliver(subject, body).await;
    }

    /// The archive never staged a restore.
    pub async fn restore_failed(&self, guid: &str, reason: &str) {
        if !self.config.send_on_failure {
            return;
        }
        let subject = format!("Restore {} failed", guid);
        let body = format!(
            "The archive could not provide restore {}.\n\nReason: {}\n",
            guid, reason
        );
        self.deliver(subject, body).await;
    }

    /// A daemon cycle raised an error.
    pub async fn crash(&self, daemon: &str, error: &str) {
        if !self.config.send_on_crash {
            return;
        }
        let subject = format!("{} cycle failed", daemon);
        let body = format!(
            "The {} daemon hit an error and will retry after its normal interval.\n\n{}\n",
            daemon, error
        );
        self.deliver(subject, body).await;
    }

    async fn deliver(&self, subject: String, body: String) {
        let notification = Notification { subject, body };
        match self.notifier.send(&notification).await {
            Ok(()) => info!(
                "Sent notification '{}' via {}",
                notification.subject,
                self.notifier.name()
            ),
            Err(e) => warn!(
                "Failed to send notification '{}' via {}: {}",
                notification.subject,
                self.notifier.name(),
                e
            ),
        }
    }
}

fn file_list(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("  {}\n", f.display()))
        .collect()
}

fn failure_body(failure: &JobFailure<'_>, note: Option<&str>) -> String {
    let mut body = format!(
        "Job {} failed on attempt {} of {}.\n\nQueue id: {}\n\nData files:\n{}\nError log:\n{}\n",
        failure.job_id,
        failure.attempt,
        failure.max_attempts,
        failure.queue_id.unwrap_or("(not submitted)"),
        file_list(failure.files),
        failure.errors.trim_end()
    );
    if let Some(note) = note {
        body.push('\n');
        body.push_str(note);
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNotifier;

    fn enabled() -> NotifyConfig {
        NotifyConfig {
            send_on_failure: true,
            send_on_terminal_failure: true,
            send_on_crash: false,
            recipient: Some("ops@example.org".to_string()),
            sender: None,
            sendmail_path: None,
        }
    }

    #[tokio::test]
    async fn test_failure_body_has_queue_id_log_and_files() {
        let notifier = Arc::new(MockNotifier::new());
        let notifications = Notifications::new(notifier.clone(), enabled());
        let files = vec![PathBuf::from("/raw/a.fits")];

        notifications
            .job_failed(&JobFailure {
                job_id: 4,
                queue_id: Some("101.head"),
                errors: "Segmentation fault\n",
                files: &files,
                attempt: 1,
                max_attempts: 2,
            })
            .await;

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Job 4 failed (attempt 1 of 2)");
        assert!(sent[0].body.contains("101.head"));
        assert!(sent[0].body.contains("Segmentation fault"));
        assert!(sent[0].body.contains("/raw/a.fits"));
    }

    #[tokio::test]
    async fn test_toggles_suppress_messages() {
        let notifier = Arc::new(MockNotifier::new());
        let notifications = Notifications::new(notifier.clone(), enabled());

        notifications.crash("scheduler", "database is gone").await;
        assert!(notifier.sent().await.is_empty());

        notifications.restore_failed("abc", "directory not found").await;
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let notifier = Arc::new(MockNotifier::new());
        notifier.fail_next().await;
        let notifications = Notifications::new(notifier.clone(), enabled());

        notifications.precheck_failed(9, "data file missing", &[]).await;
        assert!(notifier.sent().await.is_empty());
    }

    #[test]
    fn test_create_notifier_defaults_to_log() {
        assert_eq!(create_notifier(&NotifyConfig::default()).name(), "log");
        assert_eq!(create_notifier(&enabled()).name(), "sendmail");
    }
}
