//! Directory observation for the managed library root.
//!
//! `initial_snapshot` produces the authoritative full listing at startup.
//! `start_notify_watcher` turns `notify` events into incremental observations,
//! and `run_debounced` coalesces them into reconcile passes spaced at least
//! `DebounceGate::min_interval` apart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use shelfsync_core::{ObservedItem, SyncSnapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::engine::SyncEngine;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Everything the observer side delivers to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMessage {
    Items(Vec<ObservedItem>),
    Progress { url: String, fraction: f64 },
    Deleted(Vec<String>),
}

/// Full recursive listing of `root`, tagged as a first snapshot.
pub async fn initial_snapshot(root: &Path) -> std::io::Result<SyncSnapshot> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || list_tree(&root))
        .await
        .map_err(std::io::Error::other)?
}

fn list_tree(root: &Path) -> std::io::Result<SyncSnapshot> {
    let mut items = walk(root, root, ObservedItem::present)?;
    items.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(SyncSnapshot::full(items))
}

/// Observations for everything below `start`, which must sit under `root`.
fn walk(
    root: &Path,
    start: &Path,
    observe: impl Fn(String) -> ObservedItem,
) -> std::io::Result<Vec<ObservedItem>> {
    let mut items = Vec::new();
    let walker = WalkDir::new(start)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_hidden_name(&entry.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let Some(url) = to_url(root, entry.path()) else {
            continue;
        };
        let item = observe(url);
        items.push(if entry.file_type().is_dir() {
            item.collection()
        } else {
            item
        });
    }
    Ok(items)
}

/// Folders arrive as a single event when moved or renamed into place, so
/// their contents are listed here and reported alongside them.
pub fn expand_folders(root: &Path, items: Vec<ObservedItem>) -> Vec<ObservedItem> {
    let mut expanded = Vec::with_capacity(items.len());
    for item in items {
        let folder = (item.is_collection && !item.is_deleted)
            .then(|| root.join(item.url.trim_start_matches('/')));
        expanded.push(item);
        let Some(folder) = folder else {
            continue;
        };
        match walk(root, &folder, ObservedItem::updated) {
            Ok(children) => expanded.extend(children),
            Err(err) => debug!(path = %folder.display(), error = %err, "folder vanished before listing"),
        }
    }
    expanded
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<ObserverMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                let items = map_event(&watch_root, event, |path| path.is_dir());
                let items = expand_folders(&watch_root, items);
                if !items.is_empty() {
                    let _ = tx.send(ObserverMessage::Items(items));
                }
            }
            Err(err) => warn!(error = %err, "directory watcher error"),
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

/// Maps one `notify` event to observations. A rename becomes a delete of the
/// old url plus an update of the new one.
fn map_event(root: &Path, event: Event, is_dir: impl Fn(&Path) -> bool) -> Vec<ObservedItem> {
    let touched = |path: &PathBuf, folder: bool| {
        let url = to_url(root, path)?;
        let item = ObservedItem::updated(url);
        Some(if folder || is_dir(path) {
            item.collection()
        } else {
            item
        })
    };
    let removed = |path: &PathBuf| to_url(root, path).map(ObservedItem::deleted);

    let paths = event.paths;
    match event.kind {
        EventKind::Modify(ModifyKind::Name(_)) if paths.len() >= 2 => {
            let mut items = Vec::new();
            items.extend(removed(&paths[0]));
            items.extend(touched(&paths[1], false));
            items
        }
        EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::From)) => {
            paths.iter().filter_map(removed).collect()
        }
        EventKind::Create(kind) => paths
            .iter()
            .filter_map(|path| touched(path, kind == CreateKind::Folder))
            .collect(),
        EventKind::Modify(_) => paths.iter().filter_map(|path| touched(path, false)).collect(),
        EventKind::Remove(kind) => paths
            .iter()
            .filter_map(|path| {
                let item = removed(path)?;
                Some(if kind == RemoveKind::Folder {
                    item.collection()
                } else {
                    item
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Logical url of `path` under `root`. In-flight copies and anything hidden
/// never reach the catalog.
fn to_url(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let name = relative.file_name()?.to_string_lossy();
    if name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    let hidden = relative
        .components()
        .any(|part| is_hidden_name(&part.as_os_str().to_string_lossy()));
    if hidden {
        return None;
    }
    let url = PathBuf::from("/").join(relative);
    Some(url.to_string_lossy().replace('\\', "/"))
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// Incremental observations waiting for the next pass. The latest
/// observation of a url replaces earlier ones.
#[derive(Debug, Default)]
pub struct PendingBatch {
    items: BTreeMap<String, ObservedItem>,
}

impl PendingBatch {
    pub fn push(&mut self, item: ObservedItem) {
        if item.is_deleted {
            // Anything queued under a removed url is gone with it.
            let prefix = format!("{}/", item.url);
            self.items.retain(|url, _| !url.starts_with(&prefix));
        }
        self.items.insert(item.url.clone(), item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = ObservedItem>) {
        for item in items {
            self.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empties the batch. `None` when nothing is pending: an empty incremental
    /// snapshot would read as "the directory is now empty".
    pub fn take(&mut self) -> Option<SyncSnapshot> {
        if self.items.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.items).into_values().collect();
        Some(SyncSnapshot::incremental(items))
    }
}

/// Minimum spacing between two reconcile passes from the same stream.
#[derive(Debug, Clone)]
pub struct DebounceGate {
    min_interval: Duration,
    last_pass: Option<Instant>,
}

impl DebounceGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// How long a pass requested at `now` has to wait.
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.last_pass {
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn record_pass(&mut self, at: Instant) {
        self.last_pass = Some(at);
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

/// Feeds observer messages to the engine until the stream closes or `cancel`
/// fires. Progress and bulk deletions apply immediately; item observations
/// are coalesced behind the gate.
pub async fn run_debounced(
    mut rx: mpsc::UnboundedReceiver<ObserverMessage>,
    engine: SyncEngine,
    mut gate: DebounceGate,
    cancel: CancellationToken,
) {
    let mut batch = PendingBatch::default();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            flush(&engine, &mut batch, &mut gate).await;
            break;
        };
        apply(&engine, &mut batch, message).await;

        let wait = gate.wait_time(Instant::now());
        if !wait.is_zero() {
            let deadline = Instant::now() + wait;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    message = rx.recv() => match message {
                        Some(message) => apply(&engine, &mut batch, message).await,
                        None => break,
                    },
                }
            }
        }
        while let Ok(message) = rx.try_recv() {
            apply(&engine, &mut batch, message).await;
        }
        flush(&engine, &mut batch, &mut gate).await;
    }
    debug!("observer stream stopped");
}

async fn apply(engine: &SyncEngine, batch: &mut PendingBatch, message: ObserverMessage) {
    match message {
        ObserverMessage::Items(items) => batch.extend(items),
        ObserverMessage::Progress { url, fraction } => {
            if let Err(err) = engine.record_download_progress(&url, fraction).await {
                warn!(url = %url, error = %err, "failed to record download progress");
            }
        }
        ObserverMessage::Deleted(urls) => {
            let deleted = engine.delete_batch(&urls).await;
            if !deleted.is_empty() {
                info!(count = deleted.len(), "bulk deletion applied");
            }
        }
    }
}

async fn flush(engine: &SyncEngine, batch: &mut PendingBatch, gate: &mut DebounceGate) {
    let Some(snapshot) = batch.take() else {
        return;
    };
    engine.reconcile(&snapshot).await;
    gate.record_pass(Instant::now());
}

#[cfg(test)]
#[path = "observer_tests.rs"]
mod tests;
