//! HTTP client for the archive's restore service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{ArchiveApi, ArchiveError, RestoreLocation};
use crate::config::ArchiveConfig;

/// Body the service returns when it refuses a restore.
const FAIL_SENTINEL: &str = "fail";
/// Body the service returns once a restore is staged.
const DONE_SENTINEL: &str = "done";

/// Restore service reached over HTTP.
pub struct HttpArchiveApi {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpArchiveApi {
    pub fn new(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ArchiveError::Request(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn credentials(&self) -> String {
        format!(
            "username={}&password={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password)
        )
    }

    async fn get_text(&self, url: &str) -> Result<String, ArchiveError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ArchiveError::Timeout(e.to_string())
            } else {
                ArchiveError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Request(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ArchiveError::Request(e.to_string()))?;
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl ArchiveApi for HttpArchiveApi {
    async fn request_restore(&self, count: u32) -> Result<String, ArchiveError> {
        let url = format!("{}/restore?{}&count={}", self.base_url, self.credentials(), count);
        let body = self.get_text(&url).await?;

        if body.is_empty() || body.eq_ignore_ascii_case(FAIL_SENTINEL) {
            return Err(ArchiveError::Rejected(format!(
                "restore of {} files returned {:?}",
                count, body
            )));
        }
        debug!("Archive accepted restore of {} files as {}", count, body);
        Ok(body)
    }

    async fn location(&self, token: &str) -> Result<RestoreLocation, ArchiveError> {
        let url = format!(
            "{}/location?{}&guid={}",
            self.base_url,
            self.credentials(),
            urlencoding::encode(token)
        );
        let body = self.get_text(&url).await?;

        if body.eq_ignore_ascii_case(DONE_SENTINEL) {
            Ok(RestoreLocation::Ready)
        } else {
            debug!("Restore {} not staged yet: {}", token, body);
            Ok(RestoreLocation::Pending)
        }
    }
}
