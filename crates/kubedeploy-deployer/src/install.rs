//! kubectl installation.

use futures::StreamExt;
use kubedeploy_config::InstallOptions;
use sha2::{Digest, Sha256};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("download from {url} failed: {source}")]
    Download { url: String, source: reqwest::Error },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("{0} is empty after download")]
    Empty(PathBuf),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
}

impl From<InstallError> for kubedeploy_core::Error {
    fn from(err: InstallError) -> Self {
        kubedeploy_core::Error::Install(err.to_string())
    }
}

/// Downloads one exact kubectl release and makes it executable.
#[derive(Debug, Clone)]
pub struct KubectlInstaller {
    version: String,
    options: InstallOptions,
    accept_invalid_certs: bool,
}

impl KubectlInstaller {
    /// `version` carries the leading `v`, as in `v1.29.0`.
    ///
    /// Invalid TLS certificates are accepted unless [`Self::accept_invalid_certs`] turns that off.
    pub fn new(version: impl Into<String>, options: InstallOptions) -> Self {
        Self {
            version: version.into(),
            options,
            accept_invalid_certs: true,
        }
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.options.destination
    }

    /// Download, verify and install. Returns the path of the installed binary.
    ///
    /// Nothing is left at the destination or beside it when any step fails.
    pub async fn install(&self) -> Result<PathBuf, InstallError> {
        let partial = partial_path(&self.options.destination);
        let result = self.install_via(&partial).await;
        if result.is_err() {
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => debug!(path = %partial.display(), "Removed partial download"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %partial.display(),
                    error = %e,
                    "Failed to remove partial download"
                ),
            }
        }
        result
    }

    async fn install_via(&self, partial: &Path) -> Result<PathBuf, InstallError> {
        let url = self.options.download_url(&self.version);
        let dest = &self.options.destination;
        info!(version = %self.version, url = %url, "Installing kubectl");

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(InstallError::Client)?;
        let download_failed = |source| InstallError::Download {
            url: url.clone(),
            source,
        };

        let response = client.get(&url).send().await.map_err(download_failed)?;
        if !response.status().is_success() {
            return Err(InstallError::Status {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(io_error(partial))?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(download_failed)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(io_error(partial))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_error(partial))?;
        drop(file);
        debug!(bytes = written, path = %partial.display(), "Download complete");

        if written == 0 {
            return Err(InstallError::Empty(dest.clone()));
        }

        if let Some(expected) = &self.options.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(InstallError::Checksum {
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("Checksum verified");
        }

        tokio::fs::set_permissions(partial, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_error(partial))?;
        tokio::fs::rename(partial, dest)
            .await
            .map_err(io_error(dest))?;

        info!(path = %dest.display(), "kubectl installed");
        Ok(dest.clone())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> InstallError {
    let path = path.to_path_buf();
    move |source| InstallError::Io { path, source }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "kubectl".into());
    name.push(".download");
    dest.with_file_name(name)
}
