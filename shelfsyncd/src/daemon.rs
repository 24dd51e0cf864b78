use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use notify::RecommendedWatcher;
use shelfsync_core::{
    CurrentItemStore, LocalStorage, PathToken, PathTokenResolver, SourceToken, StorageLayer,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, default_db_path};
use crate::events::{EventBus, LibraryEvent, Receiver, RecvError};
use crate::import::{CopyTaskQueue, CopyWorker, TaskOutcome, WorkerLock};
use crate::logging::DEFAULT_LOG_FILTER;
use crate::sync::duplicates::DuplicateDetector;
use crate::sync::engine::SyncEngine;
use crate::sync::observer::{
    DebounceGate, ObserverMessage, initial_snapshot, run_debounced, start_notify_watcher,
};
use crate::sync::prefetch::Prefetcher;
use crate::sync::sequencer::Sequencer;

const DEFAULT_LIBRARY_DIR: &str = "Music/Shelf";
const DEFAULT_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_PREFETCH_SECS: u64 = 10;
const DEFAULT_PREFETCH_COUNT: u64 = 3;
const DEFAULT_DUPLICATE_SCAN_SECS: u64 = 60;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub library_root: PathBuf,
    pub db_path: PathBuf,
    pub debounce: Duration,
    pub prefetch_interval: Duration,
    pub prefetch_count: usize,
    pub duplicate_scan_interval: Duration,
    pub enable_watcher: bool,
    pub log_filter: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let library_root = std::env::var("SHELFSYNC_LIBRARY_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_LIBRARY_DIR));
        let db_path = match std::env::var("SHELFSYNC_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_db_path().context("failed to resolve catalog location")?,
        };
        let debounce = Duration::from_millis(read_u64_env(
            "SHELFSYNC_DEBOUNCE_MS",
            DEFAULT_DEBOUNCE_MS,
        ));
        let prefetch_interval = Duration::from_secs(read_u64_env(
            "SHELFSYNC_PREFETCH_SECS",
            DEFAULT_PREFETCH_SECS,
        ));
        let prefetch_count =
            read_u64_env("SHELFSYNC_PREFETCH_COUNT", DEFAULT_PREFETCH_COUNT) as usize;
        let duplicate_scan_interval = Duration::from_secs(read_u64_env(
            "SHELFSYNC_DUPLICATE_SCAN_SECS",
            DEFAULT_DUPLICATE_SCAN_SECS,
        ));
        let enable_watcher = read_bool_env("SHELFSYNC_ENABLE_WATCHER", true);
        let log_filter =
            std::env::var("SHELFSYNC_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            library_root,
            db_path,
            debounce,
            prefetch_interval,
            prefetch_count,
            duplicate_scan_interval,
            enable_watcher,
            log_filter,
        })
    }

    /// Lock file guarding the copy worker, kept next to the catalog database.
    pub fn worker_lock_path(&self) -> PathBuf {
        let mut name = self
            .db_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "catalog".into());
        name.push(".worker.lock");
        self.db_path.with_file_name(name)
    }
}

/// What `--import` did with the requested files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportRun {
    /// No daemon was running, so the files were copied in this process.
    Copied(Vec<TaskOutcome>),
    /// A running daemon owns the worker and will pick these tasks up.
    Queued(usize),
}

/// Background tasks of a started daemon.
pub struct Background {
    cancel: CancellationToken,
    tracker: TaskTracker,
    watcher: Option<RecommendedWatcher>,
    _lock: WorkerLock,
}

impl Background {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        drop(self.watcher);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("background tasks did not stop in time");
        }
    }
}

/// All long-lived components, wired to one catalog and one event bus.
pub struct DaemonRuntime {
    config: DaemonConfig,
    catalog: CatalogStore,
    events: EventBus,
    engine: SyncEngine,
    sequencer: Sequencer,
    detector: DuplicateDetector,
    prefetcher: Prefetcher,
    queue: CopyTaskQueue,
    worker: CopyWorker,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.library_root)
            .await
            .with_context(|| {
                format!("failed to create library root at {:?}", config.library_root)
            })?;
        let catalog = CatalogStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open catalog at {:?}", config.db_path))?;
        Ok(Self::with_catalog(config, catalog))
    }

    pub fn with_catalog(config: DaemonConfig, catalog: CatalogStore) -> Self {
        let events = EventBus::default();
        let storage: Arc<dyn StorageLayer> = Arc::new(LocalStorage::new(&config.library_root));
        let engine = SyncEngine::new(catalog.clone(), events.clone());
        let sequencer = Sequencer::new(catalog.clone(), events.clone());
        let detector = DuplicateDetector::new(catalog.clone(), Arc::clone(&storage));
        let prefetcher = Prefetcher::new(sequencer.clone(), storage);
        let queue = CopyTaskQueue::new(catalog.clone(), events.clone());
        let worker = CopyWorker::new(
            queue.clone(),
            Arc::new(PathTokenResolver),
            &config.library_root,
        );
        Self {
            config,
            catalog,
            events,
            engine,
            sequencer,
            detector,
            prefetcher,
            queue,
            worker,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn queue(&self) -> &CopyTaskQueue {
        &self.queue
    }

    pub fn worker(&self) -> &CopyWorker {
        &self.worker
    }

    /// Full listing of the library root, applied as an authoritative pass.
    pub async fn initial_sync(&self) -> anyhow::Result<()> {
        let snapshot = initial_snapshot(&self.config.library_root)
            .await
            .with_context(|| format!("failed to list {:?}", self.config.library_root))?;
        let report = self.engine.reconcile(&snapshot).await;
        info!(
            observed = snapshot.items.len(),
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            "initial sync finished"
        );
        Ok(())
    }

    /// Copies `files` into the library root. When a daemon already owns the
    /// worker the tasks are only queued for it.
    pub async fn import_files(&self, files: &[PathBuf]) -> anyhow::Result<ImportRun> {
        let lock_path = self.config.worker_lock_path();
        let lock = WorkerLock::try_acquire(&lock_path)
            .with_context(|| format!("failed to open worker lock at {lock_path:?}"))?;
        let ids = enqueue_imports(&self.queue, files, "/").await?;
        let Some(_lock) = lock else {
            info!(queued = ids.len(), "daemon is running, import left to its worker");
            return Ok(ImportRun::Queued(ids.len()));
        };
        Ok(ImportRun::Copied(self.worker.drain().await?))
    }

    /// Watches the library root. Events buffer in the returned channel until
    /// a consumer is attached.
    fn open_observer(
        &self,
    ) -> Option<(RecommendedWatcher, mpsc::UnboundedReceiver<ObserverMessage>)> {
        if !self.config.enable_watcher {
            return None;
        }
        match start_notify_watcher(&self.config.library_root) {
            Ok(observer) => Some(observer),
            Err(err) => {
                warn!(error = %err, "directory watcher unavailable, changes need a restart");
                None
            }
        }
    }

    /// Claims the worker, syncs the library and spawns every background task.
    pub async fn start(&self) -> anyhow::Result<Background> {
        let lock_path = self.config.worker_lock_path();
        let lock = WorkerLock::try_acquire(&lock_path)
            .with_context(|| format!("failed to open worker lock at {lock_path:?}"))?
            .with_context(|| format!("another shelfsyncd holds {lock_path:?}"))?;

        self.queue
            .recover_interrupted()
            .await
            .context("failed to recover interrupted copy tasks")?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(log_events(self.events.subscribe(), cancel.clone()));

        // Watch first: changes made while the listing runs are replayed after it.
        let observer = self.open_observer();
        self.initial_sync().await?;
        let watcher = observer.map(|(watcher, rx)| {
            tracker.spawn(run_debounced(
                rx,
                self.engine.clone(),
                DebounceGate::new(self.config.debounce),
                cancel.clone(),
            ));
            watcher
        });

        {
            let worker = self.worker.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { worker.run_forever(cancel).await });
        }

        {
            let prefetcher = self.prefetcher.clone();
            let bookmarks: Arc<dyn CurrentItemStore> = Arc::new(self.catalog.clone());
            let count = self.config.prefetch_count;
            let interval = self.config.prefetch_interval;
            let cancel = cancel.clone();
            tracker.spawn(async move {
                prefetcher
                    .run_periodic(bookmarks, count, interval, cancel)
                    .await
            });
        }

        tracker.spawn(run_duplicate_sweeps(
            self.detector.clone(),
            self.config.duplicate_scan_interval,
            cancel.clone(),
        ));

        Ok(Background {
            cancel,
            tracker,
            watcher,
            _lock: lock,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            library_root = %self.config.library_root.display(),
            db_path = %self.config.db_path.display(),
            watcher = self.config.enable_watcher,
            "shelfsyncd started"
        );
        let background = self.start().await?;

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        background.shutdown().await;
        debug!("shelfsyncd stopped");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
