//! Module file cache: where versions live, fetching them, deleting them.
//!
//! Layout is `<cache_dir>/<version.id>.wasm`. Bundled versions resolve to the
//! embedded path and are never downloaded or deleted. A cached file counts as
//! present by id alone; content is not re-verified.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::downloader::{DownloadEvent, DownloadTask, Downloader};
use crate::error::{EngineError, Result};
use crate::store::{download_completed_key, download_date_key, KeyValueStore, StoredValue};
use crate::version::EngineVersion;

pub struct Updater {
    cache_dir: PathBuf,
    embedded_path: PathBuf,
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("cache_dir", &self.cache_dir)
            .field("embedded_path", &self.embedded_path)
            .finish_non_exhaustive()
    }
}

/// Ids become file names, so they must stay a single plain path component.
fn validate_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.contains("..");
    if invalid {
        return Err(EngineError::OutsideCache(format!("invalid version id '{id}'")));
    }
    Ok(())
}

impl Updater {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        embedded_path: impl Into<PathBuf>,
        downloader: Arc<dyn Downloader>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            embedded_path: embedded_path.into(),
            downloader,
            store,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Create the cache directory.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    /// Local file a version is (or will be) loaded from.
    pub fn path_for(&self, version: &EngineVersion) -> Result<PathBuf> {
        if version.is_embedded() {
            return Ok(self.embedded_path.clone());
        }
        validate_id(&version.id)?;
        Ok(self.cache_dir.join(format!("{}.wasm", version.id)))
    }

    pub async fn exists(&self, version: &EngineVersion) -> bool {
        match self.path_for(version) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_download_completed(&self, version: &EngineVersion) -> bool {
        version.is_embedded()
            || self
                .store
                .get_bool(&download_completed_key(&version.id))
                .unwrap_or(false)
    }

    fn record_completed(store: &dyn KeyValueStore, id: &str) -> Result<()> {
        store.set(&download_completed_key(id), StoredValue::Bool(true))?;
        store.set(&download_date_key(id), StoredValue::Date(Utc::now()))
    }

    /// Fetch a version into the cache.
    ///
    /// Embedded versions and versions whose file is already cached succeed
    /// immediately without touching the downloader.
    pub async fn download(&self, version: &EngineVersion) -> DownloadTask {
        if version.is_embedded() {
            tracing::debug!(version = %version.id, "embedded version, nothing to download");
            return DownloadTask::completed();
        }

        let dest = match self.path_for(version) {
            Ok(dest) => dest,
            Err(e) => return DownloadTask::failed(e),
        };

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tracing::debug!(version = %version.id, path = %dest.display(), "version already cached");
            return DownloadTask::completed();
        }

        tracing::info!(version = %version.id, url = %version.url, path = %dest.display(), "downloading version");
        let mut inner = self.downloader.download(&version.url, &dest);
        let (tx, rx) = mpsc::channel(64);
        let task = DownloadTask {
            events: rx,
            cancel: inner.cancel.clone(),
        };

        let store = Arc::clone(&self.store);
        let id = version.id.clone();
        tokio::spawn(async move {
            while let Some(event) = inner.events.recv().await {
                let event = match event {
                    Ok(DownloadEvent::Success) => {
                        Self::record_completed(store.as_ref(), &id).map(|_| DownloadEvent::Success)
                    }
                    other => other,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        task
    }

    /// Delete a cached version.
    ///
    /// Refuses with [`EngineError::OutsideCache`] for anything that does not
    /// resolve to a file directly inside the cache directory.
    pub async fn remove(&self, version: &EngineVersion) -> Result<()> {
        if version.is_embedded() {
            return Err(EngineError::OutsideCache(format!(
                "embedded version '{}' cannot be removed",
                version.id
            )));
        }
        let path = self.path_for(version)?;

        match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => {
                let cache = tokio::fs::canonicalize(&self.cache_dir).await?;
                if resolved.parent() != Some(cache.as_path()) {
                    return Err(EngineError::OutsideCache(resolved.display().to_string()));
                }
                tokio::fs::remove_file(&path).await?;
                tracing::info!(version = %version.id, path = %path.display(), "version removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(version = %version.id, "version not cached, nothing to remove");
            }
            Err(e) => return Err(e.into()),
        }

        self.store.remove(&download_completed_key(&version.id))?;
        self.store.remove(&download_date_key(&version.id))?;
        Ok(())
    }
}
