use std::sync::Arc;
use std::time::Duration;

use shelfsync_core::{CurrentItemStore, StorageLayer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sequencer::{Sequencer, SequencerError};

pub const PREFETCH_REASON: &str = "prefetch";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub visited: usize,
    pub requested: Vec<String>,
    pub failed: Vec<String>,
}

/// Keeps a lookahead window of entries materialized ahead of the cursor.
#[derive(Clone)]
pub struct Prefetcher {
    sequencer: Sequencer,
    storage: Arc<dyn StorageLayer>,
}

impl Prefetcher {
    pub fn new(sequencer: Sequencer, storage: Arc<dyn StorageLayer>) -> Self {
        Self { sequencer, storage }
    }

    /// Requests the cursor and up to `count - 1` successors along `next`.
    /// Stops early when the chain wraps back to the cursor or runs into an
    /// entry removed while the pass was underway.
    pub async fn prefetch_from(
        &self,
        cursor: &str,
        count: usize,
    ) -> Result<PrefetchReport, SequencerError> {
        let mut report = PrefetchReport::default();
        let mut current = Some(cursor.to_string());
        while let Some(url) = current.take() {
            if report.visited >= count {
                break;
            }
            report.visited += 1;
            self.request(&url, &mut report).await;

            current = match self.sequencer.next(&url).await {
                Ok(next) => next.filter(|next| next != cursor),
                // The entry vanished mid-walk; keep what this pass already did.
                Err(SequencerError::MissingEntry(_)) if url != cursor => {
                    debug!(url = %url, "prefetch window cut short by a removed entry");
                    None
                }
                Err(err) => return Err(err),
            };
        }
        Ok(report)
    }

    async fn request(&self, url: &str, report: &mut PrefetchReport) {
        if self.storage.is_downloaded(url).await || self.storage.is_materializing(url).await {
            return;
        }
        match self.storage.download(url, PREFETCH_REASON).await {
            Ok(()) => {
                debug!(url, "prefetch requested");
                report.requested.push(url.to_string());
            }
            Err(err) => {
                warn!(url, error = %err, "prefetch download failed");
                report.failed.push(url.to_string());
            }
        }
    }

    /// Re-runs the window from the bookmarked entry every `interval` until cancelled.
    pub async fn run_periodic(
        &self,
        bookmarks: Arc<dyn CurrentItemStore>,
        count: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            match bookmarks.get_current().await {
                Ok(Some(cursor)) => {
                    if let Err(err) = self.prefetch_from(&cursor, count).await {
                        debug!(cursor = %cursor, error = %err, "prefetch pass skipped");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to read current entry"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_store;
    use crate::catalog::{CatalogStore, EntryInput};
    use crate::events::EventBus;
    use async_trait::async_trait;
    use shelfsync_core::{DownloadStatus, MemoryBookmarks, ObservedItem, StorageError};
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStorage {
        statuses: Mutex<HashMap<String, DownloadStatus>>,
        broken: HashSet<String>,
        requests: Mutex<Vec<String>>,
    }

    impl RecordingStorage {
        fn with_status(self, url: &str, status: DownloadStatus) -> Self {
            self.statuses.lock().unwrap().insert(url.to_string(), status);
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StorageLayer for RecordingStorage {
        async fn download(&self, url: &str, reason: &str) -> Result<(), StorageError> {
            assert_eq!(reason, PREFETCH_REASON);
            self.requests.lock().unwrap().push(url.to_string());
            if self.broken.contains(url) {
                return Err(StorageError::Download {
                    url: url.to_string(),
                    message: "offline".to_string(),
                });
            }
            self.statuses
                .lock()
                .unwrap()
                .insert(url.to_string(), DownloadStatus::Materialized);
            Ok(())
        }

        async fn status(&self, url: &str) -> DownloadStatus {
            self.statuses
                .lock()
                .unwrap()
                .get(url)
                .copied()
                .unwrap_or(DownloadStatus::NotMaterialized)
        }

        fn local_path(&self, url: &str) -> Result<PathBuf, StorageError> {
            Ok(PathBuf::from(url))
        }
    }

    /// Drops `vanish` from the catalog as soon as it has been requested.
    struct VanishingStorage {
        store: CatalogStore,
        vanish: String,
        inner: RecordingStorage,
    }

    #[async_trait]
    impl StorageLayer for VanishingStorage {
        async fn download(&self, url: &str, reason: &str) -> Result<(), StorageError> {
            self.inner.download(url, reason).await?;
            if url == self.vanish {
                self.store.delete_entry(url).await.unwrap();
            }
            Ok(())
        }

        async fn status(&self, url: &str) -> DownloadStatus {
            self.inner.status(url).await
        }

        fn local_path(&self, url: &str) -> Result<PathBuf, StorageError> {
            self.inner.local_path(url)
        }
    }

    async fn ordered_catalog(urls: &[&str]) -> (CatalogStore, Sequencer) {
        let store = make_store().await;
        for url in urls {
            store
                .insert_entry(&EntryInput::from_observed(
                    &ObservedItem::present(*url).with_status(DownloadStatus::NotMaterialized),
                ))
                .await
                .unwrap();
        }
        let sequencer = Sequencer::new(store.clone(), EventBus::default());
        sequencer.apply_sequential(None).await.unwrap();
        (store, sequencer)
    }

    #[tokio::test]
    async fn requests_cursor_and_successors() {
        let (_store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3", "/c.mp3", "/d.mp3"]).await;
        let storage = Arc::new(RecordingStorage::default());
        let prefetcher = Prefetcher::new(sequencer, storage.clone());

        let report = prefetcher.prefetch_from("/b.mp3", 3).await.unwrap();

        assert_eq!(report.requested, vec!["/b.mp3", "/c.mp3", "/d.mp3"]);
        assert_eq!(storage.requests(), report.requested);
    }

    #[tokio::test]
    async fn skips_downloaded_and_materializing_entries() {
        let (_store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3", "/c.mp3"]).await;
        let storage = Arc::new(
            RecordingStorage::default()
                .with_status("/a.mp3", DownloadStatus::Materialized)
                .with_status("/b.mp3", DownloadStatus::Materializing(0.4)),
        );
        let prefetcher = Prefetcher::new(sequencer, storage.clone());

        let report = prefetcher.prefetch_from("/a.mp3", 3).await.unwrap();

        assert_eq!(report.visited, 3);
        assert_eq!(storage.requests(), vec!["/c.mp3"]);
    }

    #[tokio::test]
    async fn stops_when_chain_wraps_to_cursor() {
        let (_store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3"]).await;
        let storage = Arc::new(RecordingStorage::default());
        let prefetcher = Prefetcher::new(sequencer, storage.clone());

        let report = prefetcher.prefetch_from("/b.mp3", 10).await.unwrap();

        assert_eq!(report.visited, 2);
        assert_eq!(storage.requests(), vec!["/b.mp3", "/a.mp3"]);
    }

    #[tokio::test]
    async fn failed_download_does_not_stop_the_window() {
        let (_store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3", "/c.mp3"]).await;
        let storage = Arc::new(RecordingStorage {
            broken: HashSet::from(["/b.mp3".to_string()]),
            ..RecordingStorage::default()
        });
        let prefetcher = Prefetcher::new(sequencer, storage.clone());

        let report = prefetcher.prefetch_from("/a.mp3", 3).await.unwrap();

        assert_eq!(report.failed, vec!["/b.mp3"]);
        assert_eq!(report.requested, vec!["/a.mp3", "/c.mp3"]);

        let report = prefetcher.prefetch_from("/a.mp3", 3).await.unwrap();
        assert_eq!(report.failed, vec!["/b.mp3"]);
        assert!(report.requested.is_empty());
    }

    #[tokio::test]
    async fn unknown_cursor_is_an_error() {
        let (_store, sequencer) = ordered_catalog(&["/a.mp3"]).await;
        let prefetcher = Prefetcher::new(sequencer, Arc::new(RecordingStorage::default()));

        let result = prefetcher.prefetch_from("/missing.mp3", 3).await;

        assert!(matches!(result, Err(SequencerError::MissingEntry(_))));
    }

    #[tokio::test]
    async fn entry_removed_mid_walk_keeps_the_partial_window() {
        let (store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3", "/c.mp3", "/d.mp3"]).await;
        let storage = Arc::new(VanishingStorage {
            store: store.clone(),
            vanish: "/b.mp3".to_string(),
            inner: RecordingStorage::default(),
        });
        let prefetcher = Prefetcher::new(sequencer, storage.clone());

        let report = prefetcher.prefetch_from("/a.mp3", 4).await.unwrap();

        assert_eq!(report.visited, 2);
        assert_eq!(report.requested, vec!["/a.mp3", "/b.mp3"]);
        assert_eq!(storage.inner.requests(), report.requested);
    }

    #[tokio::test]
    async fn periodic_run_uses_bookmark_and_stops_on_cancel() {
        let (store, sequencer) = ordered_catalog(&["/a.mp3", "/b.mp3", "/c.mp3"]).await;
        let storage = Arc::new(RecordingStorage::default());
        let prefetcher = Prefetcher::new(sequencer, storage.clone());
        let bookmarks = Arc::new(MemoryBookmarks::default());
        bookmarks.set_current(Some("/b.mp3")).await.unwrap();
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            let bookmarks: Arc<dyn CurrentItemStore> = bookmarks.clone();
            tokio::spawn(async move {
                prefetcher
                    .run_periodic(bookmarks, 2, Duration::from_millis(10), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(storage.requests(), vec!["/b.mp3", "/c.mp3"]);
        assert_eq!(store.count_entries().await.unwrap(), 3);
    }
}
