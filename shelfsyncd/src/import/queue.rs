use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use super::ImportError;
use crate::catalog::{CatalogStore, CopyTaskRecord};
use crate::events::{EventBus, LibraryEvent};

/// How often an idle worker re-reads the table for rows queued by another
/// process, which cannot reach this process's wakeup handle.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Persistent FIFO of copy requests. Clones share the same wakeup handle.
#[derive(Clone)]
pub struct CopyTaskQueue {
    catalog: CatalogStore,
    events: EventBus,
    notify: Arc<Notify>,
    rescan: Duration,
}

impl CopyTaskQueue {
    pub fn new(catalog: CatalogStore, events: EventBus) -> Self {
        Self {
            catalog,
            events,
            notify: Arc::new(Notify::new()),
            rescan: DEFAULT_RESCAN_INTERVAL,
        }
    }

    pub fn with_rescan_interval(mut self, rescan: Duration) -> Self {
        self.rescan = rescan;
        self
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn enqueue(
        &self,
        source_token: &[u8],
        filename: &str,
        destination_dir: &str,
    ) -> Result<i64, ImportError> {
        validate_filename(filename)?;
        let destination_dir = if destination_dir.is_empty() {
            "/"
        } else {
            destination_dir
        };
        let id = self
            .catalog
            .insert_task(source_token, filename, destination_dir)
            .await?;
        debug!(id, filename, destination_dir, "copy task queued");
        self.publish_count().await?;
        self.notify.notify_one();
        Ok(id)
    }

    /// Waits until a pending task exists. Woken by `enqueue`, `retry` and
    /// `recover_interrupted` in this process; rows written by another process
    /// are found by the slow rescan.
    pub async fn next_task(&self) -> Result<CopyTaskRecord, ImportError> {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.catalog.next_pending_task().await? {
                return Ok(task);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.rescan) => {}
            }
        }
    }

    /// Moves a failed task back to pending. False when `id` is not in error.
    pub async fn retry(&self, id: i64) -> Result<bool, ImportError> {
        let retried = self.catalog.retry_task(id).await?;
        if retried {
            self.notify.notify_one();
        }
        Ok(retried)
    }

    pub async fn remove(&self, id: i64) -> Result<bool, ImportError> {
        let removed = self.catalog.delete_task(id).await?;
        if removed {
            self.publish_count().await?;
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<CopyTaskRecord>, ImportError> {
        Ok(self.catalog.list_tasks().await?)
    }

    pub async fn open_count(&self) -> Result<i64, ImportError> {
        Ok(self.catalog.count_open_tasks().await?)
    }

    /// Startup step: tasks left running by a previous process start over.
    pub async fn recover_interrupted(&self) -> Result<u64, ImportError> {
        let recovered = self.catalog.reset_running_tasks().await?;
        if recovered > 0 {
            info!(recovered, "interrupted copy tasks requeued");
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    pub(crate) async fn publish_count(&self) -> Result<(), ImportError> {
        let count = self.catalog.count_tasks().await?;
        self.events.emit(LibraryEvent::TaskCountChanged { count });
        Ok(())
    }
}

fn validate_filename(filename: &str) -> Result<(), ImportError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ImportError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TaskState;
    use crate::catalog::tests::make_store;
    use crate::events::drain;
    use std::time::Duration;

    async fn make_queue() -> CopyTaskQueue {
        CopyTaskQueue::new(make_store().await, EventBus::default())
    }

    #[tokio::test]
    async fn enqueue_persists_pending_task_and_publishes_count() {
        let queue = make_queue().await;
        let mut rx = queue.events().subscribe();

        let id = queue.enqueue(b"token", "x.mp3", "/Imports").await.unwrap();

        let tasks = queue.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].state, TaskState::Pending);
        assert_eq!(tasks[0].destination_dir, "/Imports");
        assert_eq!(drain(&mut rx), vec![LibraryEvent::TaskCountChanged { count: 1 }]);
    }

    #[tokio::test]
    async fn rejects_path_like_filenames() {
        let queue = make_queue().await;
        for name in ["", ".", "..", "a/b.mp3", "..\\x"] {
            assert!(matches!(
                queue.enqueue(b"t", name, "/").await,
                Err(ImportError::InvalidFilename(_))
            ));
        }
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_destination_means_library_root() {
        let queue = make_queue().await;
        queue.enqueue(b"t", "a.mp3", "").await.unwrap();
        assert_eq!(queue.list().await.unwrap()[0].destination_dir, "/");
    }

    #[tokio::test]
    async fn next_task_waits_for_enqueue() {
        let queue = make_queue().await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_task().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(b"t", "a.mp3", "/").await.unwrap();
        let task = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(task.filename, "a.mp3");
    }

    #[tokio::test]
    async fn rows_from_another_process_are_found_by_rescan() {
        let store = make_store().await;
        let worker_side = CopyTaskQueue::new(store.clone(), EventBus::default())
            .with_rescan_interval(Duration::from_millis(20));
        let cli_side = CopyTaskQueue::new(store, EventBus::default());
        let waiter = {
            let queue = worker_side.clone();
            tokio::spawn(async move { queue.next_task().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        cli_side.enqueue(b"t", "late.mp3", "/").await.unwrap();
        let task = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(task.filename, "late.mp3");
    }

    #[tokio::test]
    async fn retry_and_remove_follow_task_state() {
        let queue = make_queue().await;
        let id = queue.enqueue(b"t", "a.mp3", "/").await.unwrap();
        assert!(!queue.retry(id).await.unwrap());

        queue.catalog().mark_task_running(id).await.unwrap();
        queue.catalog().set_task_error(id, "denied").await.unwrap();
        assert!(queue.retry(id).await.unwrap());
        assert_eq!(queue.next_task().await.unwrap().id, id);

        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.remove(id).await.unwrap());
        assert_eq!(queue.open_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_interrupted_requeues_running_rows() {
        let queue = make_queue().await;
        let id = queue.enqueue(b"t", "a.mp3", "/").await.unwrap();
        queue.catalog().mark_task_running(id).await.unwrap();

        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
        assert_eq!(queue.recover_interrupted().await.unwrap(), 0);
        let task = queue.next_task().await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }
}
