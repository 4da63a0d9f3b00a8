//! Types for archive operations.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur while talking to the archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive request failed: {0}")]
    Request(String),

    /// The archive answered with its failure sentinel.
    #[error("Archive rejected the restore request: {0}")]
    Rejected(String),

    /// The staging directory of a restore does not exist. Not transient.
    #[error("Restore directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Unexpected FTP reply: {0}")]
    Protocol(String),

    #[error("Transferred {actual} bytes of {name}, archive listed {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Archive timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file staged under a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    /// Size reported by the archive, in bytes.
    pub size: u64,
}

/// Staging state of a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreLocation {
    /// Files are staged and can be listed.
    Ready,
    /// Still staging.
    Pending,
}

/// Restore request protocol of the archive.
#[async_trait]
pub trait ArchiveApi: Send + Sync {
    /// Ask the archive to stage `count` files; returns the restore token.
    async fn request_restore(&self, count: u32) -> Result<String, ArchiveError>;

    /// Whether the restore named by `token` has finished staging.
    async fn location(&self, token: &str) -> Result<RestoreLocation, ArchiveError>;
}

/// Transfer protocol for staged files.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Files (with sizes) staged under a restore.
    async fn list_files(&self, token: &str) -> Result<Vec<RemoteFile>, ArchiveError>;

    /// Stream one file to `dest`, sending the running byte count on
    /// `progress`. Returns the number of bytes written.
    async fn retrieve(
        &self,
        token: &str,
        name: &str,
        dest: &Path,
        progress: mpsc::Sender<u64>,
    ) -> Result<u64, ArchiveError>;
}
