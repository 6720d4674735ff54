//! Side file remembering which candidate URL resolved each entity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::EntityKey;

use super::payload::loose_id;

#[derive(Debug, Error)]
pub enum UrlCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The URL and identifier last resolved for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUrl {
    pub url: String,
    #[serde(deserialize_with = "loose_id")]
    pub id: String,
}

/// JSON file of `"{name}_{period}" -> {url, id}`, kept sorted by key.
///
/// One instance is shared (via `Arc`) by every worker of a run; its lock
/// serializes updates to the file.
pub struct UrlCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CachedUrl>>,
}

impl UrlCache {
    /// Load the cache. A missing file is an empty cache; an unreadable one
    /// is logged and treated as empty (it is rewritten on the next record).
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable URL cache");
                BTreeMap::new()
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "Loaded URL cache");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    async fn read(path: &Path) -> Result<BTreeMap<String, CachedUrl>, UrlCacheError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &EntityKey) -> Option<CachedUrl> {
        self.entries.lock().await.get(&key.cache_key()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Store the mapping and rewrite the file.
    ///
    /// Returns `Ok(false)` without touching the file when the entry already
    /// holds the same URL and identifier.
    pub async fn record(&self, key: &EntityKey, url: &str, id: &str) -> Result<bool, UrlCacheError> {
        let entry = CachedUrl {
            url: url.to_string(),
            id: id.to_string(),
        };

        let mut entries = self.entries.lock().await;
        if entries.get(&key.cache_key()) == Some(&entry) {
            return Ok(false);
        }

        // The map only takes the entry once the file holds it.
        let mut updated = entries.clone();
        updated.insert(key.cache_key(), entry);
        self.write(&updated).await?;
        *entries = updated;

        debug!(entity = %key, url, id, "Recorded URL cache entry");
        Ok(true)
    }

    async fn write(&self, entries: &BTreeMap<String, CachedUrl>) -> Result<(), UrlCacheError> {
        let json = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
