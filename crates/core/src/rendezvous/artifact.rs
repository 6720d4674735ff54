//! Staging artifacts shared between the interceptor and the workers.
//!
//! Per identifier and attempt: absent -> `{id}_PENDING.{ext}` ->
//! `{id}_COMPLETE.{ext}`, or absent -> COMPLETE (empty) when there is nothing
//! new. Every write goes through a temporary file and a rename so a reader
//! never observes a partial artifact.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::payload::{normalize_rows, PagePayload, PriceRow};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    Pending,
    Complete,
}

/// Directory of rendezvous artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    ext: String,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pending_path(&self, identifier: &str) -> PathBuf {
        self.dir
            .join(format!("{}_PENDING.{}", identifier, self.ext))
    }

    pub fn complete_path(&self, identifier: &str) -> PathBuf {
        self.dir
            .join(format!("{}_COMPLETE.{}", identifier, self.ext))
    }

    pub async fn state(&self, identifier: &str) -> Result<ArtifactState, ArtifactError> {
        if tokio::fs::try_exists(self.complete_path(identifier)).await? {
            Ok(ArtifactState::Complete)
        } else if tokio::fs::try_exists(self.pending_path(identifier)).await? {
            Ok(ArtifactState::Pending)
        } else {
            Ok(ArtifactState::Absent)
        }
    }

    /// Start a fresh PENDING artifact with one page of rows.
    pub async fn write_pending(
        &self,
        identifier: &str,
        status_code: u16,
        rows: Vec<PriceRow>,
    ) -> Result<usize, ArtifactError> {
        let payload = PagePayload::new(status_code, normalize_rows(rows));
        let count = payload.rows().len();
        write_atomic(&self.pending_path(identifier), &serde_json::to_vec(&payload)?).await?;
        debug!(identifier, rows = count, "Wrote pending artifact");
        Ok(count)
    }

    /// Merge a page into the PENDING artifact, starting one if absent.
    ///
    /// Returns the merged row count.
    pub async fn merge_pending(
        &self,
        identifier: &str,
        status_code: u16,
        rows: Vec<PriceRow>,
    ) -> Result<usize, ArtifactError> {
        let path = self.pending_path(identifier);
        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<PagePayload>(&bytes)?
                .data
                .unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let merged = normalize_rows(existing.into_iter().chain(rows));
        let payload = PagePayload::new(status_code, merged);
        let count = payload.rows().len();
        write_atomic(&path, &serde_json::to_vec(&payload)?).await?;
        debug!(identifier, rows = count, "Merged page into pending artifact");
        Ok(count)
    }

    /// Publish an empty COMPLETE artifact and drop any PENDING one.
    pub async fn complete_empty(&self, identifier: &str) -> Result<(), ArtifactError> {
        write_atomic(&self.complete_path(identifier), b"").await?;
        remove_if_exists(&self.pending_path(identifier)).await?;
        debug!(identifier, "Wrote empty complete artifact");
        Ok(())
    }

    /// Rename PENDING to COMPLETE.
    pub async fn promote(&self, identifier: &str) -> Result<(), ArtifactError> {
        tokio::fs::rename(self.pending_path(identifier), self.complete_path(identifier)).await?;
        debug!(identifier, "Promoted pending artifact to complete");
        Ok(())
    }

    /// Contents of the COMPLETE artifact, if it exists.
    pub async fn read_complete(&self, identifier: &str) -> Result<Option<String>, ArtifactError> {
        match tokio::fs::read_to_string(self.complete_path(identifier)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_complete(&self, identifier: &str) -> Result<(), ArtifactError> {
        remove_if_exists(&self.complete_path(identifier)).await
    }

    pub async fn remove_pending(&self, identifier: &str) -> Result<(), ArtifactError> {
        remove_if_exists(&self.pending_path(identifier)).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), ArtifactError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
