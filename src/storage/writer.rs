use super::cache::DocumentCache;
use crate::errors::{AppError, AppResult};
use crate::models::Document;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Dropped because another persist was already running outside the queue.
    Skipped,
}

pub(crate) struct WriteRequest {
    pub document: Document,
    pub reply: oneshot::Sender<AppResult<WriteOutcome>>,
}

/// The target file and its transient siblings.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub target: PathBuf,
    pub backup: PathBuf,
    pub temp: PathBuf,
}

impl FileSet {
    pub fn for_target(target: PathBuf) -> Self {
        Self {
            backup: with_suffix(&target, ".backup"),
            temp: with_suffix(&target, ".tmp"),
            target,
        }
    }
}

struct PersistFailure {
    error: io::Error,
    restored: bool,
}

struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Single consumer of the write queue. Requests are persisted strictly in arrival order.
pub(crate) struct Writer {
    files: Arc<FileSet>,
    cache: Arc<Mutex<DocumentCache>>,
    /// Set while a persist is in flight. The queue already serializes writes, so this
    /// only trips if `persist` is ever reached from outside the queue.
    busy: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    backup_retention: Duration,
}

impl Writer {
    pub fn new(
        files: Arc<FileSet>,
        cache: Arc<Mutex<DocumentCache>>,
        busy: Arc<AtomicBool>,
        backup_retention: Duration,
    ) -> Self {
        Self {
            files,
            cache,
            busy,
            generation: Arc::new(AtomicU64::new(0)),
            backup_retention,
        }
    }

    pub fn spawn(self) -> mpsc::UnboundedSender<WriteRequest> {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(self.run(receiver));
        sender
    }

    async fn run(self, mut receiver: mpsc::UnboundedReceiver<WriteRequest>) {
        while let Some(request) = receiver.recv().await {
            let result = self.persist(request.document).await;
            if request.reply.send(result).is_err() {
                tracing::debug!("write requester went away before the result was delivered");
            }
        }
        tracing::debug!(path = %self.files.target.display(), "storage writer stopped");
    }

    pub async fn persist(&self, document: Document) -> AppResult<WriteOutcome> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            tracing::warn!(
                path = %self.files.target.display(),
                "write already in progress, skipping"
            );
            return Ok(WriteOutcome::Skipped);
        };

        let payload = serde_json::to_vec_pretty(&document)?;
        let files = Arc::clone(&self.files);
        let result = tokio::task::spawn_blocking(move || persist_blocking(&files, &payload)).await?;

        match result {
            Ok(backed_up) => {
                {
                    let mut cache =
                        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    cache.store(document);
                }
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                if backed_up {
                    self.schedule_backup_cleanup(generation);
                }
                Ok(WriteOutcome::Written)
            }
            Err(failure) => {
                tracing::error!(
                    path = %self.files.target.display(),
                    error = %failure.error,
                    restored = failure.restored,
                    "failed to persist notes document"
                );
                Err(AppError::Persistence {
                    message: failure.error.to_string(),
                    restored: failure.restored,
                })
            }
        }
    }

    /// Removes the backup once it has outlived the retention window, unless a newer
    /// write has produced a fresh one in the meantime.
    fn schedule_backup_cleanup(&self, generation: u64) {
        let backup = self.files.backup.clone();
        let current = Arc::clone(&self.generation);
        let retention = self.backup_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if current.load(Ordering::Acquire) != generation {
                return;
            }
            match tokio::fs::remove_file(&backup).await {
                Ok(()) => tracing::debug!(path = %backup.display(), "removed write backup"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(
                        path = %backup.display(),
                        error = %error,
                        "could not remove write backup"
                    )
                }
            }
        });
    }
}

fn persist_blocking(files: &FileSet, payload: &[u8]) -> Result<bool, PersistFailure> {
    let mut backed_up = false;
    let result = (|| -> io::Result<()> {
        if let Some(parent) = files.target.parent() {
            fs::create_dir_all(parent)?;
        }
        if files.target.exists() {
            fs::copy(&files.target, &files.backup)?;
            backed_up = true;
        }
        atomic_write(&files.temp, &files.target, payload)
    })();

    match result {
        Ok(()) => Ok(backed_up),
        Err(error) => {
            let restored = backed_up && restore_from_backup(files);
            Err(PersistFailure { error, restored })
        }
    }
}

fn restore_from_backup(files: &FileSet) -> bool {
    match fs::copy(&files.backup, &files.target) {
        Ok(_) => {
            tracing::info!(
                path = %files.target.display(),
                "restored notes document from backup after write failure"
            );
            true
        }
        Err(error) => {
            tracing::error!(
                path = %files.target.display(),
                error = %error,
                "failed to restore from backup"
            );
            false
        }
    }
}

/// Writes `payload` to `temp`, syncs it, then renames it over `target`.
pub(crate) fn atomic_write(temp: &Path, target: &Path, payload: &[u8]) -> io::Result<()> {
    let written = (|| -> io::Result<()> {
        let mut file = File::create(temp)?;
        file.write_all(payload)?;
        file.sync_all()
    })();
    if let Err(error) = written {
        if temp.is_file() {
            let _ = fs::remove_file(temp);
        }
        return Err(error);
    }
    fs::rename(temp, target)
}

pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    atomic_write(&with_suffix(path, ".tmp"), path, &payload)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
