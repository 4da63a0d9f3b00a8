//! Minimal FTP client for retrieving staged files.
//!
//! One control session per call: login, binary mode, change into the
//! restore's directory, then passive-mode listing or retrieval.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ArchiveError, FileSource, RemoteFile};
use crate::config::ArchiveConfig;

const CHUNK_SIZE: usize = 64 * 1024;

/// Staged files served over FTP.
#[derive(Debug, Clone)]
pub struct FtpFileSource {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl FtpFileSource {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            host: config.ftp_host.clone(),
            port: config.ftp_port,
            username: config.ftp_username.clone(),
            password: config.ftp_password.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Logged-in session positioned in the restore directory.
    async fn open(&self, token: &str) -> Result<FtpSession, ArchiveError> {
        let mut session = FtpSession::connect(&self.host, self.port, self.timeout).await?;
        session.login(&self.username, &self.password).await?;
        session.expect("TYPE I", &[200]).await?;

        let (code, text) = session.command(&format!("CWD {}", token)).await?;
        match code {
            250 => Ok(session),
            550 => Err(ArchiveError::DirectoryNotFound(format!("{}: {}", token, text))),
            _ => Err(ArchiveError::Protocol(format!("CWD {}: {} {}", token, code, text))),
        }
    }
}

struct FtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    host: String,
    timeout: Duration,
}

impl FtpSession {
    async fn connect(host: &str, port: u16, limit: Duration) -> Result<Self, ArchiveError> {
        let stream = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ArchiveError::Timeout(format!("connect to {}:{}", host, port)))??;
        let (read, write) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read),
            writer: write,
            host: host.to_string(),
            timeout: limit,
        };

        let (code, text) = session.reply().await?;
        if code != 220 {
            return Err(ArchiveError::Protocol(format!("greeting: {} {}", code, text)));
        }
        Ok(session)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), ArchiveError> {
        let (code, text) = self.command(&format!("USER {}", username)).await?;
        match code {
            230 => Ok(()),
            331 => {
                self.expect(&format!("PASS {}", password), &[230, 202])
                    .await
                    .map_err(|_| ArchiveError::Request("FTP login rejected".to_string()))?;
                Ok(())
            }
            _ => Err(ArchiveError::Protocol(format!("USER: {} {}", code, text))),
        }
    }

    /// Read one (possibly multi-line) reply.
    async fn reply(&mut self) -> Result<(u16, String), ArchiveError> {
        let mut line = String::new();
        self.read_line(&mut line).await?;
        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| ArchiveError::Protocol(format!("malformed reply {:?}", line)))?;

        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let mut next = String::new();
                self.read_line(&mut next).await?;
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }
        Ok((code, line.get(4..).unwrap_or_default().trim().to_string()))
    }

    async fn read_line(&mut self, line: &mut String) -> Result<(), ArchiveError> {
        let n = timeout(self.timeout, self.reader.read_line(line))
            .await
            .map_err(|_| ArchiveError::Timeout("FTP reply".to_string()))??;
        if n == 0 {
            return Err(ArchiveError::Protocol("connection closed".to_string()));
        }
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<(u16, String), ArchiveError> {
        let shown = if command.starts_with("PASS ") {
            "PASS ****"
        } else {
            command
        };
        debug!("FTP > {}", shown);
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await?;
        self.reply().await
    }

    async fn expect(&mut self, command: &str, codes: &[u16]) -> Result<String, ArchiveError> {
        let (code, text) = self.command(command).await?;
        if codes.contains(&code) {
            Ok(text)
        } else {
            Err(ArchiveError::Protocol(format!(
                "{}: {} {}",
                command.split_whitespace().next().unwrap_or(command),
                code,
                text
            )))
        }
    }

    /// Enter passive mode and open the data connection.
    async fn passive(&mut self) -> Result<TcpStream, ArchiveError> {
        let text = self.expect("PASV", &[227]).await?;
        let (ip, port) = parse_pasv(&text)
            .ok_or_else(|| ArchiveError::Protocol(format!("PASV reply {:?}", text)))?;
        let host = if ip.is_unspecified() {
            self.host.clone()
        } else {
            ip.to_string()
        };
        let stream = timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ArchiveError::Timeout("FTP data connection".to_string()))??;
        Ok(stream)
    }

    async fn size(&mut self, name: &str) -> Result<u64, ArchiveError> {
        let text = self.expect(&format!("SIZE {}", name), &[213]).await?;
        text.trim()
            .parse()
            .map_err(|_| ArchiveError::Protocol(format!("SIZE {}: {:?}", name, text)))
    }

    async fn quit(mut self) {
        if let Err(e) = self.command("QUIT").await {
            debug!("FTP QUIT failed: {}", e);
        }
    }
}

/// Parse `Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv(text: &str) -> Option<(Ipv4Addr, u16)> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let nums: Vec<u8> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<_>>()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Some((ip, port))
}

#[async_trait]
impl FileSource for FtpFileSource {
    async fn list_files(&self, token: &str) -> Result<Vec<RemoteFile>, ArchiveError> {
        let mut session = self.open(token).await?;

        let mut data = session.passive().await?;
        session.expect("NLST", &[125, 150]).await?;
        let mut listing = String::new();
        timeout(self.timeout, data.read_to_string(&mut listing))
            .await
            .map_err(|_| ArchiveError::Timeout("NLST".to_string()))??;
        drop(data);
        session.expect_transfer_complete().await?;

        let mut files = Vec::new();
        for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let name = name.rsplit('/').next().unwrap_or(name).to_string();
            let size = session.size(&name).await?;
            files.push(RemoteFile { name, size });
        }
        session.quit().await;
        Ok(files)
    }

    async fn retrieve(
        &self,
        token: &str,
        name: &str,
        dest: &Path,
        progress: mpsc::Sender<u64>,
    ) -> Result<u64, ArchiveError> {
        let mut session = self.open(token).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut data = session.passive().await?;
        session.expect(&format!("RETR {}", name), &[125, 150]).await?;

        let mut out = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = timeout(self.timeout, data.read(&mut buf))
                .await
                .map_err(|_| ArchiveError::Timeout(format!("RETR {}", name)))??;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            written += n as u64;
            // Progress is advisory; drop updates when the reader lags.
            let _ = progress.try_send(written);
        }
        out.flush().await?;
        drop(data);

        if let Err(e) = session.expect_transfer_complete().await {
            warn!("RETR {} did not complete cleanly: {}", name, e);
            return Err(e);
        }
        session.quit().await;
        Ok(written)
    }
}

impl FtpSession {
    async fn expect_transfer_complete(&mut self) -> Result<(), ArchiveError> {
        let (code, text) = self.reply().await?;
        if code == 226 || code == 250 {
            Ok(())
        } else {
            Err(ArchiveError::Protocol(format!("transfer: {} {}", code, text)))
        }
    }
}
