//! Remote side over SSH/SFTP.
//!
//! One [`SftpFs`] is one authenticated SSH connection with one SFTP channel.
//! Remote paths are resolved against the configured root and always use `/`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Connector, EntryKind, FileSystem, FsError, ReadStream, WriteStream};
use crate::core::{CandidateFile, TransferError};

#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// Where and how to log in.
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Remote directory relative request paths are resolved against.
    pub root: PathBuf,
    /// Expected `SHA256:...` host key fingerprint. Any key is accepted when unset.
    pub host_key_fingerprint: Option<String>,
    pub timeout: Duration,
}

impl SftpSettings {
    pub fn server(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Host key check for russh.
struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.expected {
            Some(expected) if *expected != actual => {
                warn!(host = %self.host, %expected, %actual, "Host key mismatch, refusing connection");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                debug!(host = %self.host, fingerprint = %actual, "Accepting unpinned host key");
                Ok(true)
            }
        }
    }
}

pub struct SftpConnector {
    settings: SftpSettings,
    server: String,
}

impl SftpConnector {
    pub fn new(settings: SftpSettings) -> Self {
        let server = settings.server();
        Self { settings, server }
    }

    async fn open(&self) -> Result<SftpFs, String> {
        let settings = &self.settings;
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: settings.host.clone(),
            expected: settings.host_key_fingerprint.clone(),
        };

        let mut handle = tokio::time::timeout(
            settings.timeout,
            client::connect(config, (settings.host.as_str(), settings.port), handler),
        )
        .await
        .map_err(|_| format!("connection timed out after {:?}", settings.timeout))?
        .map_err(|e| format!("connection failed: {e}"))?;

        let auth = match &settings.credential {
            Credential::Password(password) => handle
                .authenticate_password(&settings.username, password)
                .await
                .map_err(|e| format!("authentication failed: {e}"))?,
            Credential::PrivateKey { path, passphrase } => {
                let key = russh::keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| format!("cannot load key {}: {e}", path.display()))?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&settings.username, key)
                    .await
                    .map_err(|e| format!("authentication failed: {e}"))?
            }
        };
        if !auth.success() {
            return Err("authentication rejected by server".to_string());
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| format!("cannot open channel: {e}"))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| format!("SFTP subsystem unavailable: {e}"))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| format!("SFTP handshake failed: {e}"))?;

        let fs = SftpFs {
            label: self.server.clone(),
            root: settings.root.clone(),
            sftp,
            handle: Mutex::new(handle),
        };

        let root = fs.resolve(Path::new(""));
        match fs.sftp.metadata(root.clone()).await {
            Ok(meta) if meta.is_dir() => Ok(fs),
            Ok(_) => {
                fs.close().await;
                Err(format!("root {root} is not a directory"))
            }
            Err(e) => {
                fs.close().await;
                Err(format!("root {root} is not accessible: {e}"))
            }
        }
    }
}

#[async_trait]
impl Connector for SftpConnector {
    fn server(&self) -> &str {
        &self.server
    }

    async fn connect(&self) -> Result<Arc<dyn FileSystem>, TransferError> {
        debug!(server = %self.server, "Opening SFTP session");
        let fs = self
            .open()
            .await
            .map_err(|reason| TransferError::session(&self.server, reason))?;
        info!(server = %self.server, "SFTP session ready");
        Ok(Arc::new(fs))
    }
}

pub struct SftpFs {
    label: String,
    root: PathBuf,
    sftp: SftpSession,
    /// Only touched on close.
    handle: Mutex<client::Handle<HostKeyCheck>>,
}

impl SftpFs {
    /// Absolute `/`-separated remote path for `path`.
    fn resolve(&self, path: &Path) -> String {
        let mut parts: Vec<String> = Vec::new();
        for component in self.root.join(path).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::ParentDir => {
                    parts.pop();
                }
                _ => {}
            }
        }
        format!("/{}", parts.join("/"))
    }
}

fn map_error(path: &str, error: SftpError) -> FsError {
    match error {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => FsError::NotFound(path.to_string()),
            // Servers report a file held open by another process this way.
            // Failure also covers unrelated errors (a rename onto an existing
            // target, a full disk), which then burn through the retry budget
            // before surfacing as locked.
            StatusCode::Failure | StatusCode::PermissionDenied => FsError::Locked {
                path: path.to_string(),
                reason: status.error_message,
            },
            _ => FsError::Protocol {
                path: path.to_string(),
                reason: status.error_message,
            },
        },
        other => FsError::Protocol {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl FileSystem for SftpFs {
    fn label(&self) -> &str {
        &self.label
    }

    async fn kind(&self, path: &Path) -> Result<Option<EntryKind>, FsError> {
        let remote = self.resolve(path);
        match self.sftp.metadata(remote.clone()).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
            Ok(meta) => Ok(Some(EntryKind::File { length: meta.len() })),
            Err(e) => match map_error(&remote, e) {
                FsError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<CandidateFile>, FsError> {
        let remote = self.resolve(dir);
        let entries = self
            .sftp
            .read_dir(remote.clone())
            .await
            .map_err(|e| map_error(&remote, e))?;

        Ok(entries
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let name = entry.file_name();
                CandidateFile {
                    path: dir.join(&name),
                    length: entry.metadata().len(),
                    name,
                }
            })
            .collect())
    }

    async fn open_read(&self, path: &Path) -> Result<ReadStream, FsError> {
        let remote = self.resolve(path);
        let file = self
            .sftp
            .open(remote.clone())
            .await
            .map_err(|e| map_error(&remote, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> Result<WriteStream, FsError> {
        let remote = self.resolve(path);
        let file = self
            .sftp
            .create(remote.clone())
            .await
            .map_err(|e| map_error(&remote, e))?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        self.sftp
            .rename(from.clone(), to)
            .await
            .map_err(|e| map_error(&from, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), FsError> {
        let remote = self.resolve(path);
        self.sftp
            .remove_file(remote.clone())
            .await
            .map_err(|e| map_error(&remote, e))
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!(server = %self.label, error = %e, "SFTP close failed");
        }
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(server = %self.label, error = %e, "SSH disconnect failed");
        }
    }
}
