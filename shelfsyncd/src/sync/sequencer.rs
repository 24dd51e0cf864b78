use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::catalog::{CatalogError, CatalogStore, EntryRecord};
use crate::events::{EventBus, LibraryEvent};

/// First order assigned by sequential mode; lower values stay free for promotion.
pub const SEQUENTIAL_BASE: i64 = 100;
pub const STICKY_ORDER: i64 = 0;
pub const DEMOTED_ORDER: i64 = 1;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("entry not found: {0}")]
    MissingEntry(String),
    #[error("loop mode requires a target entry")]
    MissingLoopTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Sequential,
    Loop,
    Shuffle,
}

/// Owns `sort_order`. Assignment differs per mode; traversal does not.
#[derive(Clone)]
pub struct Sequencer {
    catalog: CatalogStore,
    events: EventBus,
}

impl Sequencer {
    pub fn new(catalog: CatalogStore, events: EventBus) -> Self {
        Self { catalog, events }
    }

    pub async fn apply_mode(
        &self,
        mode: PlaybackMode,
        sticky: Option<&str>,
    ) -> Result<(), SequencerError> {
        match mode {
            PlaybackMode::Sequential => self.apply_sequential(sticky).await,
            PlaybackMode::Loop => {
                let target = sticky.ok_or(SequencerError::MissingLoopTarget)?;
                self.apply_loop(target).await
            }
            PlaybackMode::Shuffle => self.apply_shuffle(sticky).await,
        }
    }

    /// Title order starting at 100; `sticky` is pulled out and pinned to 0.
    pub async fn apply_sequential(&self, sticky: Option<&str>) -> Result<(), SequencerError> {
        self.bracket(PlaybackMode::Sequential, async {
            let mut entries = self.entries_except(sticky).await?;
            entries.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.url.cmp(&b.url)));
            let orders: Vec<(String, i64)> = entries
                .into_iter()
                .zip(SEQUENTIAL_BASE..)
                .map(|(entry, order)| (entry.url, order))
                .collect();
            self.commit(orders, sticky).await
        })
        .await
    }

    /// Two-row swap: the target takes 0, a previous holder drops to 1.
    pub async fn apply_loop(&self, target: &str) -> Result<(), SequencerError> {
        self.bracket(PlaybackMode::Loop, async {
            match self.catalog.promote_sticky(target).await {
                Err(CatalogError::MissingEntry(url)) => Err(SequencerError::MissingEntry(url)),
                other => Ok(other?),
            }
        })
        .await
    }

    pub async fn apply_shuffle(&self, sticky: Option<&str>) -> Result<(), SequencerError> {
        self.bracket(PlaybackMode::Shuffle, async {
            let entries = self.entries_except(sticky).await?;
            let draws = {
                let mut rng = rand::thread_rng();
                draw_shuffle_orders(&mut rng, entries.len())
            };
            let orders = entries.into_iter().map(|e| e.url).zip(draws).collect();
            self.commit(orders, sticky).await
        })
        .await
    }

    /// Shuffle with a caller-supplied generator, for reproducible orderings.
    pub async fn apply_shuffle_with_rng<R: Rng + Send + ?Sized>(
        &self,
        sticky: Option<&str>,
        rng: &mut R,
    ) -> Result<(), SequencerError> {
        self.bracket(PlaybackMode::Shuffle, async {
            let entries = self.entries_except(sticky).await?;
            let draws = draw_shuffle_orders(rng, entries.len());
            let orders = entries.into_iter().map(|e| e.url).zip(draws).collect();
            self.commit(orders, sticky).await
        })
        .await
    }

    pub async fn next(&self, url: &str) -> Result<Option<String>, SequencerError> {
        let entry = self.require(url).await?;
        match self.catalog.next_after(entry.traversal_key(), url).await? {
            Some(next) => Ok(Some(next)),
            None => self.first_other_than(url).await,
        }
    }

    pub async fn prev(&self, url: &str) -> Result<Option<String>, SequencerError> {
        let entry = self.require(url).await?;
        match self.catalog.prev_before(entry.traversal_key(), url).await? {
            Some(prev) => Ok(Some(prev)),
            None => {
                let last = self.catalog.last().await?;
                Ok(last.filter(|last| last != url))
            }
        }
    }

    pub async fn first(&self) -> Result<Option<String>, SequencerError> {
        Ok(self.catalog.first().await?)
    }

    pub async fn last(&self) -> Result<Option<String>, SequencerError> {
        Ok(self.catalog.last().await?)
    }

    pub async fn sticky(&self) -> Result<Option<String>, SequencerError> {
        Ok(self.catalog.sticky().await?)
    }

    async fn first_other_than(&self, url: &str) -> Result<Option<String>, SequencerError> {
        let first = self.catalog.first().await?;
        Ok(first.filter(|first| first != url))
    }

    async fn require(&self, url: &str) -> Result<EntryRecord, SequencerError> {
        self.catalog
            .get_entry(url)
            .await?
            .ok_or_else(|| SequencerError::MissingEntry(url.to_string()))
    }

    async fn entries_except(
        &self,
        sticky: Option<&str>,
    ) -> Result<Vec<EntryRecord>, SequencerError> {
        if let Some(sticky) = sticky {
            self.require(sticky).await?;
        }
        let mut entries = self.catalog.list_entries().await?;
        entries.retain(|entry| Some(entry.url.as_str()) != sticky);
        Ok(entries)
    }

    async fn commit(
        &self,
        mut orders: Vec<(String, i64)>,
        sticky: Option<&str>,
    ) -> Result<(), SequencerError> {
        if let Some(sticky) = sticky {
            orders.push((sticky.to_string(), STICKY_ORDER));
        }
        self.catalog.assign_orders(&orders).await?;
        Ok(())
    }

    async fn bracket<F>(&self, mode: PlaybackMode, work: F) -> Result<(), SequencerError>
    where
        F: Future<Output = Result<(), SequencerError>>,
    {
        self.events.emit(LibraryEvent::SortStarted { mode });
        let result = work.await;
        self.events.emit(LibraryEvent::SortFinished { mode });
        if result.is_ok() {
            info!(?mode, "ordering applied");
        }
        result
    }
}

/// Independent draws in `1..=u32::MAX`; collisions are allowed and broken by url.
pub fn draw_shuffle_orders<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<i64> {
    (0..count)
        .map(|_| rng.gen_range(1..=i64::from(u32::MAX)))
        .collect()
}

#[cfg(test)]
#[path = "sequencer_tests.rs"]
mod tests;
