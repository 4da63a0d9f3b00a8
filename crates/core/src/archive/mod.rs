//! Remote data archive.
//!
//! Retrieval is two-phase: `ArchiveApi` asks the archive to stage a restore
//! and reports when it is ready, then `FileSource` lists and transfers the
//! staged files.

mod ftp;
mod http;
mod types;

pub use ftp::FtpFileSource;
pub use http::HttpArchiveApi;
pub use types::*;
