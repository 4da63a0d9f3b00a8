//! Mock notifier for testing.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::notify::{Notification, Notifier, NotifyError};

/// Records notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct MockNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
    fail_next: Arc<RwLock<bool>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far.
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    /// Subjects of the notifications delivered so far.
    pub async fn subjects(&self) -> Vec<String> {
        self.sent
            .read()
            .await
            .iter()
            .map(|n| n.subject.clone())
            .collect()
    }

    /// Make the next delivery fail.
    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut fail = self.fail_next.write().await;
        if *fail {
            *fail = false;
            return Err(NotifyError::Failed("mock delivery failure".to_string()));
        }
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}
