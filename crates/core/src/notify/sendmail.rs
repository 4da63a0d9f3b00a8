//! Notifiers backed by tracing and by the local mail transfer agent.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{Notification, Notifier, NotifyError};
use crate::config::NotifyConfig;

const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";
const MAILER_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            subject = %notification.subject,
            "Notification: {}",
            notification.body
        );
        Ok(())
    }
}

/// Pipes an RFC 822 message into `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: PathBuf,
    args: Vec<String>,
    recipient: String,
    sender: Option<String>,
}

impl SendmailNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let recipient = config.recipient.clone().ok_or(NotifyError::NoRecipient)?;
        let program = config
            .sendmail_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SENDMAIL));
        Ok(Self::with_command(program, vec!["-t".to_string()], recipient, config.sender.clone()))
    }

    /// Use an arbitrary mailer command that reads the message on stdin.
    pub fn with_command(
        program: PathBuf,
        args: Vec<String>,
        recipient: String,
        sender: Option<String>,
    ) -> Self {
        Self {
            program,
            args,
            recipient,
            sender,
        }
    }

    fn message(&self, notification: &Notification) -> String {
        let mut message = String::new();
        if let Some(sender) = &self.sender {
            message.push_str(&format!("From: {}\n", sender));
        }
        message.push_str(&format!("To: {}\n", self.recipient));
        message.push_str(&format!("Subject: [pulsarflow] {}\n", notification.subject));
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(&notification.body);
        if !notification.body.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    fn name(&self) -> &str {
        "sendmail"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.message(notification).as_bytes()).await?;
        }

        let output = timeout(MAILER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| NotifyError::Timeout)??;
        if !output.status.success() {
            return Err(NotifyError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        debug!("Mailed '{}' to {}", notification.subject, self.recipient);
        Ok(())
    }
}
