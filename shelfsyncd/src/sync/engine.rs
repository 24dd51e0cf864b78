use std::collections::HashSet;

use shelfsync_core::{DownloadStatus, SyncSnapshot};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, CatalogStore, EntryInput};
use crate::events::{EventBus, LibraryEvent};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Urls touched by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Brings the catalog into agreement with directory observations.
///
/// The filesystem is the source of truth. Persistence failures on a single
/// row are logged and skipped; the next pass re-derives the same intent.
#[derive(Clone)]
pub struct SyncEngine {
    catalog: CatalogStore,
    events: EventBus,
}

impl SyncEngine {
    pub fn new(catalog: CatalogStore, events: EventBus) -> Self {
        Self { catalog, events }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub async fn reconcile(&self, snapshot: &SyncSnapshot) -> ReconcileReport {
        self.events.emit(LibraryEvent::SyncStarted);
        let parts = snapshot.partition();
        let full_listing = snapshot.is_full_listing();
        let mut report = ReconcileReport::default();

        // Deletes always run before inserts so a rename never leaves two rows.
        if full_listing {
            let observed: HashSet<&str> = parts
                .for_sync
                .iter()
                .chain(parts.for_update.iter())
                .map(|item| item.url.as_str())
                .collect();
            match self.catalog.list_urls().await {
                Ok(urls) => {
                    for url in urls.into_iter().filter(|url| !observed.contains(url.as_str())) {
                        self.delete_into(&url, &mut report).await;
                    }
                }
                Err(err) => warn!(error = %err, "failed to list catalog for full listing"),
            }
        }

        for item in &parts.for_delete {
            self.delete_into(&item.url, &mut report).await;
        }

        if full_listing {
            for item in &parts.for_sync {
                let input = EntryInput::from_observed(item);
                match self.catalog.insert_entry(&input).await {
                    Ok(true) => report.inserted.push(input.url),
                    Ok(false) => match self.catalog.update_entry(&input).await {
                        Ok(true) => {
                            self.events.emit(LibraryEvent::EntryUpdated {
                                url: input.url.clone(),
                            });
                            report.updated.push(input.url);
                        }
                        Ok(false) => {}
                        Err(err) => warn!(url = %input.url, error = %err, "failed to refresh entry"),
                    },
                    Err(err) => warn!(url = %input.url, error = %err, "failed to insert entry"),
                }
            }
        }

        for item in &parts.for_update {
            let input = EntryInput::from_observed(item);
            let saved = match self.catalog.insert_entry(&input).await {
                Ok(true) => {
                    report.inserted.push(input.url.clone());
                    Ok(())
                }
                Ok(false) => self.catalog.update_entry(&input).await.map(|changed| {
                    if changed {
                        report.updated.push(input.url.clone());
                    }
                }),
                Err(err) => Err(err),
            };
            if let Err(err) = saved {
                warn!(url = %input.url, error = %err, "failed to save updated entry");
                continue;
            }
            self.events.emit(LibraryEvent::EntryUpdated { url: input.url });
        }

        if report.is_empty() {
            debug!(items = snapshot.items.len(), "reconcile: nothing changed");
        } else {
            info!(
                inserted = report.inserted.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                first = snapshot.is_first,
                "reconcile finished"
            );
        }
        self.events.emit(LibraryEvent::SyncFinished {
            inserted: report.inserted.len(),
            updated: report.updated.len(),
            deleted: report.deleted.len(),
        });
        report
    }

    async fn delete_into(&self, url: &str, report: &mut ReconcileReport) {
        // A removed folder takes its contents with it.
        match self.catalog.delete_subtree(url).await {
            Ok(removed) => report.deleted.extend(removed),
            Err(err) => warn!(url = %url, error = %err, "failed to delete entry"),
        }
    }

    /// Bulk deletion batch from the observer.
    pub async fn delete_batch(&self, urls: &[String]) -> Vec<String> {
        let mut report = ReconcileReport::default();
        for url in urls {
            self.delete_into(url, &mut report).await;
        }
        report.deleted
    }

    /// Explicit user delete of one entry.
    pub async fn delete_entry(&self, url: &str) -> Result<bool, EngineError> {
        Ok(self.catalog.delete_entry(url).await?)
    }

    /// Per-url download progress from the observer, `fraction` in `0..=1`.
    pub async fn record_download_progress(
        &self,
        url: &str,
        fraction: f64,
    ) -> Result<bool, EngineError> {
        let fraction = fraction.clamp(0.0, 1.0);
        let changed = self
            .catalog
            .set_download_status(url, DownloadStatus::from_fraction(fraction))
            .await?;
        self.events.emit(LibraryEvent::DownloadProgress {
            url: url.to_string(),
            fraction,
        });
        Ok(changed)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
