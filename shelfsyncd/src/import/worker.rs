use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shelfsync_core::{TokenResolver, managed_path_for};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CopyTaskQueue, ImportError};
use crate::catalog::CopyTaskRecord;
use crate::events::LibraryEvent;

const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Copied(PathBuf),
    Failed(String),
    /// Another consumer claimed or removed the task first.
    Skipped,
}

/// Serial consumer of the copy queue. At most one copy writes into the
/// library at any time.
#[derive(Clone)]
pub struct CopyWorker {
    queue: CopyTaskQueue,
    resolver: Arc<dyn TokenResolver>,
    library_root: PathBuf,
}

impl CopyWorker {
    pub fn new(
        queue: CopyTaskQueue,
        resolver: Arc<dyn TokenResolver>,
        library_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            resolver,
            library_root: library_root.into(),
        }
    }

    /// Processes tasks until `cancel` fires. A copy in flight at cancellation
    /// is abandoned and its row stays `running` for the next start.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.queue.next_task() => task,
            };
            match task {
                Ok(task) => {
                    let id = task.id;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(id, "shutdown during copy, task left for restart");
                            break;
                        }
                        outcome = self.process_task(task) => {
                            if let Err(err) = outcome {
                                warn!(id, error = %err, "copy task bookkeeping failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to read copy queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("copy worker stopped");
    }

    /// Runs every pending task once, then returns.
    pub async fn drain(&self) -> Result<Vec<TaskOutcome>, ImportError> {
        let mut outcomes = Vec::new();
        while let Some(task) = self.queue.catalog().next_pending_task().await? {
            outcomes.push(self.process_task(task).await?);
        }
        Ok(outcomes)
    }

    /// Copy failures end up on the task row; only bookkeeping errors surface here.
    pub async fn process_task(&self, task: CopyTaskRecord) -> Result<TaskOutcome, ImportError> {
        let catalog = self.queue.catalog();
        let events = self.queue.events();
        if !catalog.mark_task_running(task.id).await? {
            return Ok(TaskOutcome::Skipped);
        }
        let remaining = catalog.count_open_tasks().await?;
        events.emit(LibraryEvent::TaskStarted { remaining });

        match self.copy(&task).await {
            Ok(target) => {
                let previous = catalog.count_open_tasks().await?;
                catalog.delete_task(task.id).await?;
                let remaining = catalog.count_open_tasks().await?;
                events.emit(LibraryEvent::TaskFinished {
                    remaining,
                    previous,
                });
                self.queue.publish_count().await?;
                info!(id = task.id, target = %target.display(), "import copied");
                Ok(TaskOutcome::Copied(target))
            }
            Err(err) => {
                let message = err.to_string();
                catalog.set_task_error(task.id, &message).await?;
                events.emit(LibraryEvent::TaskFailed {
                    id: task.id,
                    message: message.clone(),
                });
                warn!(id = task.id, filename = %task.filename, error = %message, "import failed");
                Ok(TaskOutcome::Failed(message))
            }
        }
    }

    async fn copy(&self, task: &CopyTaskRecord) -> Result<PathBuf, ImportError> {
        let mut source = self.resolver.resolve(&task.source_token).await?;
        let dir = managed_path_for(&self.library_root, &task.destination_dir)?;
        tokio::fs::create_dir_all(&dir).await?;
        // A name recorded by an interrupted run already belongs to this task.
        let (target, resumed) = match task.target_name.as_deref() {
            Some(name) => (dir.join(name), true),
            None => (self.claim_destination(task, &dir).await?, false),
        };

        let partial = partial_path(&target);
        // `create` truncates whatever an interrupted run left behind.
        let mut file = tokio::fs::File::create(&partial).await?;
        let written = match tokio::io::copy(&mut source.file, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = self.finalize(task, &dir, &partial, target, resumed).await?;
        debug!(
            source = %source.path.display(),
            bytes = written,
            expected = source.len,
            "copy complete"
        );
        Ok(target)
    }

    /// Picks the first free name in `dir` and records it on the task row.
    async fn claim_destination(
        &self,
        task: &CopyTaskRecord,
        dir: &Path,
    ) -> Result<PathBuf, ImportError> {
        let target = unique_destination(dir, &task.filename).await?;
        if let Some(name) = target.file_name() {
            self.queue
                .catalog()
                .set_task_target(task.id, &name.to_string_lossy())
                .await?;
        }
        Ok(target)
    }

    /// Moves the finished copy into place. A fresh name taken by someone else
    /// while the copy ran is probed again rather than overwritten.
    async fn finalize(
        &self,
        task: &CopyTaskRecord,
        dir: &Path,
        partial: &Path,
        target: PathBuf,
        resumed: bool,
    ) -> Result<PathBuf, ImportError> {
        let target = if !resumed && tokio::fs::try_exists(&target).await? {
            let moved = self.claim_destination(task, dir).await?;
            debug!(taken = %target.display(), target = %moved.display(), "destination taken during copy");
            moved
        } else {
            target
        };
        tokio::fs::rename(partial, &target).await?;
        Ok(target)
    }
}

/// First free `name.ext`, `name-1.ext`, `name-2.ext`, ... in `dir`.
async fn unique_destination(dir: &Path, filename: &str) -> io::Result<PathBuf> {
    let mut attempt = 0u32;
    loop {
        let candidate = dir.join(candidate_name(filename, attempt));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        attempt += 1;
    }
}

pub fn candidate_name(filename: &str, attempt: u32) -> String {
    if attempt == 0 {
        return filename.to_string();
    }
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{attempt}.{ext}"),
        _ => format!("{filename}-{attempt}"),
    }
}

/// Sibling used while a copy is in flight: `x.mp3` -> `x.mp3.partial`.
pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
