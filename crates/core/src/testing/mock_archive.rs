//! Mock archive for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::archive::{ArchiveApi, ArchiveError, FileSource, RemoteFile, RestoreLocation};

#[derive(Debug, Clone, Default)]
struct MockRestore {
    ready: bool,
    missing_directory: bool,
    files: Vec<(String, Vec<u8>)>,
}

/// Mock implementation of both archive traits.
///
/// Tests stage restores up front with `stage_restore`, mark them ready, and
/// can make individual transfers come up short or fail outright.
#[derive(Debug, Default)]
pub struct MockArchive {
    /// Tokens handed out by `request_restore`, in order.
    pending_tokens: Arc<RwLock<VecDeque<String>>>,
    restores: Arc<RwLock<HashMap<String, MockRestore>>>,
    /// File name -> number of upcoming transfers that stop halfway.
    short_transfers: Arc<RwLock<HashMap<String, u32>>>,
    /// File name -> number of upcoming transfers that error out.
    failed_transfers: Arc<RwLock<HashMap<String, u32>>>,
    requests: Arc<RwLock<Vec<u32>>>,
    retrievals: Arc<RwLock<Vec<String>>>,
}

impl MockArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the restore the next `request_restore` call returns.
    pub async fn stage_restore(&self, token: &str, files: Vec<(&str, Vec<u8>)>) {
        self.pending_tokens.write().await.push_back(token.to_string());
        self.restores.write().await.insert(
            token.to_string(),
            MockRestore {
                ready: false,
                missing_directory: false,
                files: files
                    .into_iter()
                    .map(|(name, bytes)| (name.to_string(), bytes))
                    .collect(),
            },
        );
    }

    /// Report the restore as staged.
    pub async fn set_ready(&self, token: &str) {
        if let Some(restore) = self.restores.write().await.get_mut(token) {
            restore.ready = true;
        }
    }

    /// Report the restore as ready but without a staging directory.
    pub async fn set_missing_directory(&self, token: &str) {
        if let Some(restore) = self.restores.write().await.get_mut(token) {
            restore.ready = true;
            restore.missing_directory = true;
        }
    }

    /// Cut the next `times` transfers of `name` short.
    pub async fn truncate_transfers(&self, name: &str, times: u32) {
        self.short_transfers
            .write()
            .await
            .insert(name.to_string(), times);
    }

    /// Make the next `times` transfers of `name` fail.
    pub async fn fail_transfers(&self, name: &str, times: u32) {
        self.failed_transfers
            .write()
            .await
            .insert(name.to_string(), times);
    }

    /// File counts passed to `request_restore`.
    pub async fn restore_requests(&self) -> Vec<u32> {
        self.requests.read().await.clone()
    }

    /// File names retrieved so far, in call order.
    pub async fn retrievals(&self) -> Vec<String> {
        self.retrievals.read().await.clone()
    }

    async fn take_one(map: &RwLock<HashMap<String, u32>>, name: &str) -> bool {
        let mut map = map.write().await;
        match map.get_mut(name) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ArchiveApi for MockArchive {
    async fn request_restore(&self, count: u32) -> Result<String, ArchiveError> {
        self.requests.write().await.push(count);
        self.pending_tokens
            .write()
            .await
            .pop_front()
            .ok_or_else(|| ArchiveError::Rejected("fail".to_string()))
    }

    async fn location(&self, token: &str) -> Result<RestoreLocation, ArchiveError> {
        match self.restores.read().await.get(token) {
            Some(restore) if restore.ready => Ok(RestoreLocation::Ready),
            Some(_) => Ok(RestoreLocation::Pending),
            None => Err(ArchiveError::Request(format!("unknown restore {}", token))),
        }
    }
}

#[async_trait]
impl FileSource for MockArchive {
    async fn list_files(&self, token: &str) -> Result<Vec<RemoteFile>, ArchiveError> {
        let restores = self.restores.read().await;
        let restore = restores
            .get(token)
            .filter(|r| !r.missing_directory)
            .ok_or_else(|| ArchiveError::DirectoryNotFound(token.to_string()))?;
        Ok(restore
            .files
            .iter()
            .map(|(name, bytes)| RemoteFile {
                name: name.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    async fn retrieve(
        &self,
        token: &str,
        name: &str,
        dest: &Path,
        progress: mpsc::Sender<u64>,
    ) -> Result<u64, ArchiveError> {
        self.retrievals.write().await.push(name.to_string());

        if Self::take_one(&self.failed_transfers, name).await {
            return Err(ArchiveError::Protocol(format!("426 transfer of {} aborted", name)));
        }

        let bytes = {
            let restores = self.restores.read().await;
            restores
                .get(token)
                .and_then(|r| r.files.iter().find(|(n, _)| n == name))
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| ArchiveError::Protocol(format!("550 {} not found", name)))?
        };

        let bytes = if Self::take_one(&self.short_transfers, name).await {
            bytes[..bytes.len() / 2].to_vec()
        } else {
            bytes
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        let _ = progress.try_send(bytes.len() as u64);
        Ok(bytes.len() as u64)
    }
}
