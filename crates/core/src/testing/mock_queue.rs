//! Mock queue manager for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::queue::{QueueError, QueueLimits, QueueManager, QueueStatus, SubmitRequest};

/// State of one job known to the mock backend.
#[derive(Debug, Clone)]
pub struct MockJob {
    pub request: SubmitRequest,
    pub running: bool,
    /// Error log contents; empty means the job succeeded.
    pub errors: String,
    pub deleted: bool,
}

/// Mock implementation of the QueueManager trait.
///
/// Jobs stay running until the test finishes them:
/// - `finish` / `finish_all` end jobs with or without an error log
/// - `reject_next_submit` makes the next submission fatal
/// - `set_unreachable` makes liveness checks fail like a dead backend
///
/// # Example
///
/// ```rust,ignore
/// use pulsarflow_core::testing::MockQueueManager;
///
/// let queue = MockQueueManager::new();
/// let id = queue.submit(&request).await?;
/// queue.finish(&id, Some("Segmentation fault")).await;
/// assert!(queue.had_errors(&id).await?);
/// ```
#[derive(Debug)]
pub struct MockQueueManager {
    jobs: Arc<RwLock<HashMap<String, MockJob>>>,
    /// Submission order, by queue id.
    order: Arc<RwLock<Vec<String>>>,
    limits: QueueLimits,
    reject_next: Arc<RwLock<Option<String>>>,
    unreachable: Arc<RwLock<bool>>,
    extra_queued: Arc<RwLock<u32>>,
}

impl Default for MockQueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQueueManager {
    /// Create a mock queue with generous limits.
    pub fn new() -> Self {
        Self::with_limits(QueueLimits {
            max_jobs_running: 100,
            max_jobs_queued: 100,
        })
    }

    /// Create a mock queue with specific admission limits.
    pub fn with_limits(limits: QueueLimits) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
            limits,
            reject_next: Arc::new(RwLock::new(None)),
            unreachable: Arc::new(RwLock::new(false)),
            extra_queued: Arc::new(RwLock::new(0)),
        }
    }

    /// All submissions, oldest first.
    pub async fn submissions(&self) -> Vec<MockJob> {
        let jobs = self.jobs.read().await;
        self.order
            .read()
            .await
            .iter()
            .filter_map(|id| jobs.get(id).cloned())
            .collect()
    }

    /// Number of accepted submissions.
    pub async fn submit_count(&self) -> usize {
        self.order.read().await.len()
    }

    /// Queue ids of jobs still running.
    pub async fn running_ids(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        let mut ids: Vec<String> = self
            .order
            .read()
            .await
            .iter()
            .filter(|id| jobs.get(*id).is_some_and(|j| j.running))
            .cloned()
            .collect();
        ids.dedup();
        ids
    }

    /// End one job. `errors` of Some(..) leaves a non-empty error log.
    pub async fn finish(&self, queue_id: &str, errors: Option<&str>) {
        if let Some(job) = self.jobs.write().await.get_mut(queue_id) {
            job.running = false;
            job.errors = errors.unwrap_or_default().to_string();
        }
    }

    /// End every running job the same way.
    pub async fn finish_all(&self, errors: Option<&str>) {
        for id in self.running_ids().await {
            self.finish(&id, errors).await;
        }
    }

    /// Make the next submission fail with a fatal error.
    pub async fn reject_next_submit(&self, reason: &str) {
        *self.reject_next.write().await = Some(reason.to_string());
    }

    /// Make liveness and status queries fail.
    pub async fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.write().await = unreachable;
    }

    /// Pretend other jobs of this pipeline are waiting in the queue.
    pub async fn set_extra_queued(&self, queued: u32) {
        *self.extra_queued.write().await = queued;
    }

    async fn check_reachable(&self) -> Result<(), QueueError> {
        if *self.unreachable.read().await {
            return Err(QueueError::Backend("mock backend unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueManager for MockQueueManager {
    fn name(&self) -> &str {
        "mock"
    }

    fn limits(&self) -> QueueLimits {
        self.limits
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, QueueError> {
        if let Some(reason) = self.reject_next.write().await.take() {
            return Err(QueueError::SubmissionFailed(reason));
        }

        let mut jobs = self.jobs.write().await;
        let mut order = self.order.write().await;
        let queue_id = format!("{}.mock", order.len() + 1);
        order.push(queue_id.clone());
        jobs.insert(
            queue_id.clone(),
            MockJob {
                request: request.clone(),
                running: true,
                errors: String::new(),
                deleted: false,
            },
        );
        Ok(queue_id)
    }

    async fn is_running(&self, queue_id: &str) -> Result<bool, QueueError> {
        self.check_reachable().await?;
        Ok(self
            .jobs
            .read()
            .await
            .get(queue_id)
            .is_some_and(|j| j.running))
    }

    async fn had_errors(&self, queue_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .jobs
            .read()
            .await
            .get(queue_id)
            .is_some_and(|j| !j.errors.trim().is_empty()))
    }

    async fn get_errors(&self, queue_id: &str) -> Result<String, QueueError> {
        Ok(self
            .jobs
            .read()
            .await
            .get(queue_id)
            .map(|j| j.errors.clone())
            .unwrap_or_else(|| format!("No error log found for {}", queue_id)))
    }

    async fn delete(&self, queue_id: &str) -> Result<(), QueueError> {
        self.check_reachable().await?;
        if let Some(job) = self.jobs.write().await.get_mut(queue_id) {
            job.running = false;
            job.deleted = true;
        }
        Ok(())
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.check_reachable().await?;
        let running = self.jobs.read().await.values().filter(|j| j.running).count() as u32;
        Ok(QueueStatus {
            running,
            queued: *self.extra_queued.read().await,
        })
    }
}
