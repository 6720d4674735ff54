//! Per-identifier diagnostic logs.
//!
//! Each identifier gets an append-only `{dir}/{identifier}.log`, rotated by
//! size. Lines read `{timestamp} - {LEVEL} - {message}`. Writing never fails
//! the caller; I/O problems are reported through `tracing`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Log that collects entities whose identifier could not be resolved.
pub const FAILED_IDS_LOG: &str = "failed_ids";

const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;
const DEFAULT_BACKUPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Rotating per-identifier log files.
pub struct DiagnosticLog {
    dir: PathBuf,
    max_bytes: u64,
    backups: u32,
    // Serializes append + rotate within this process.
    write_lock: Mutex<()>,
}

impl DiagnosticLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_rotation(dir, DEFAULT_MAX_BYTES, DEFAULT_BACKUPS)
    }

    pub fn with_rotation(dir: impl Into<PathBuf>, max_bytes: u64, backups: u32) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            backups,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active log file for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.log", safe))
    }

    pub async fn info(&self, name: &str, message: &str) {
        info!(identifier = name, "{}", message);
        self.append(name, Level::Info, message).await;
    }

    pub async fn warning(&self, name: &str, message: &str) {
        warn!(identifier = name, "{}", message);
        self.append(name, Level::Warning, message).await;
    }

    pub async fn error(&self, name: &str, message: &str) {
        error!(identifier = name, "{}", message);
        self.append(name, Level::Error, message).await;
    }

    /// Append one line without emitting a tracing event.
    pub async fn append(&self, name: &str, level: Level, message: &str) {
        let line = format!(
            "{} - {} - {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            level.as_str(),
            message
        );

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.write_line(name, &line).await {
            warn!(identifier = name, error = %e, "Failed to write diagnostic log");
        }
    }

    async fn write_line(&self, name: &str, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(name);

        let current = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if current > 0 && current + line.len() as u64 > self.max_bytes {
            self.rotate(&path).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Shift `name.log.N` to `name.log.N+1`, dropping the oldest.
    async fn rotate(&self, path: &Path) -> std::io::Result<()> {
        let backup = |n: u32| PathBuf::from(format!("{}.{}", path.display(), n));

        if self.backups == 0 {
            return tokio::fs::remove_file(path).await;
        }

        let oldest = backup(self.backups);
        if tokio::fs::try_exists(&oldest).await? {
            tokio::fs::remove_file(&oldest).await?;
        }
        for n in (1..self.backups).rev() {
            let from = backup(n);
            if tokio::fs::try_exists(&from).await? {
                tokio::fs::rename(&from, backup(n + 1)).await?;
            }
        }
        tokio::fs::rename(path, backup(1)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_formats_line() {
        let temp = TempDir::new().unwrap();
        let log = DiagnosticLog::new(temp.path());

        log.info("23703", "Navigating").await;
        log.error("23703", "HTTP 500").await;

        let content = std::fs::read_to_string(log.path_for("23703")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO - Navigating"));
        assert!(lines[1].ends_with(" - ERROR - HTTP 500"));
    }

    #[tokio::test]
    async fn test_rotation_keeps_backups() {
        let temp = TempDir::new().unwrap();
        let log = DiagnosticLog::with_rotation(temp.path(), 64, 2);

        for i in 0..20 {
            log.append("id", Level::Info, &format!("message number {}", i))
                .await;
        }

        let active = log.path_for("id");
        assert!(active.exists());
        assert!(temp.path().join("id.log.1").exists());
        assert!(temp.path().join("id.log.2").exists());
        assert!(!temp.path().join("id.log.3").exists());
        assert!(std::fs::metadata(&active).unwrap().len() <= 64);

        let newest = std::fs::read_to_string(&active).unwrap();
        assert!(newest.contains("message number 19"));
    }

    #[test]
    fn test_path_for_sanitizes_separators() {
        let log = DiagnosticLog::new("/tmp/diag");
        assert_eq!(log.path_for("a/b"), PathBuf::from("/tmp/diag/a_b.log"));
        assert_eq!(
            log.path_for(FAILED_IDS_LOG),
            PathBuf::from("/tmp/diag/failed_ids.log")
        );
    }
}
