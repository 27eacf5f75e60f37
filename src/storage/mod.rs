mod cache;
mod writer;

pub use cache::DocumentCache;
pub(crate) use writer::write_json_atomic;
pub use writer::WriteOutcome;

use crate::config::Settings;
use crate::errors::{AppError, AppResult};
use crate::models::Document;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Duration;
use writer::{FileSet, WriteRequest, Writer};

/// Durable home of the notes document: cached reads, queued atomic writes.
///
/// Cloning is cheap; every clone feeds the same single writer task, so writes from
/// any clone execute one at a time in submission order. Must be opened from inside
/// a tokio runtime.
#[derive(Clone)]
pub struct StorageEngine {
    files: Arc<FileSet>,
    cache: Arc<Mutex<DocumentCache>>,
    sender: mpsc::UnboundedSender<WriteRequest>,
    mutation: Arc<AsyncMutex<()>>,
}

impl StorageEngine {
    pub fn open(target: impl AsRef<Path>, cache_ttl: Duration, backup_retention: Duration) -> Self {
        let files = Arc::new(FileSet::for_target(target.as_ref().to_path_buf()));
        let cache = Arc::new(Mutex::new(DocumentCache::new(cache_ttl)));
        let writer = Writer::new(
            Arc::clone(&files),
            Arc::clone(&cache),
            Arc::new(AtomicBool::new(false)),
            backup_retention,
        );
        let sender = writer.spawn();
        Self {
            files,
            cache,
            sender,
            mutation: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        settings.ensure_data_dir()?;
        Ok(Self::open(
            settings.notes_path(),
            settings.cache_ttl(),
            settings.backup_retention(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.files.target
    }

    /// Current document. Never fails: read or parse problems fall back to the last good
    /// cached document, or an empty one.
    pub async fn read(&self) -> Document {
        let seen_version = {
            let cache = self.lock_cache();
            if let Some(document) = cache.fresh() {
                return document.clone();
            }
            cache.version()
        };

        match self.load().await {
            Ok(document) => self.lock_cache().store_loaded(document, seen_version),
            Err(error) => {
                tracing::warn!(
                    path = %self.files.target.display(),
                    error = %error,
                    "failed to read notes document"
                );
                self.lock_cache().last_good().cloned().unwrap_or_default()
            }
        }
    }

    /// Queues `document` behind any in-flight write and waits for it to land.
    pub async fn write(&self, document: Document) -> AppResult<WriteOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WriteRequest { document, reply })
            .map_err(|_| AppError::Internal("storage writer is not running".to_string()))?;
        response
            .await
            .map_err(|_| AppError::Internal("storage writer dropped the request".to_string()))?
    }

    /// Read-modify-write. `mutate` returns `None` when it changed nothing, in which case
    /// no write is issued. Modifications run one at a time, so none is lost to another
    /// that read the same document.
    pub async fn modify<T, F>(&self, mutate: F) -> AppResult<Option<T>>
    where
        F: FnOnce(&mut Document) -> Option<T>,
    {
        let _mutation = self.mutation.lock().await;
        let mut document = self.read().await;
        match mutate(&mut document) {
            Some(value) => {
                self.write(document).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Forces the next `read` to go to disk.
    pub fn invalidate_cache(&self) {
        self.lock_cache().invalidate();
    }

    async fn load(&self) -> AppResult<Document> {
        match tokio::fs::read(&self.files.target).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Document::default()),
            Err(error) => Err(error.into()),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, DocumentCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
