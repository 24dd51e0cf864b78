use serde::{Deserialize, Serialize};

/// Materialization state of a file as reported by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DownloadStatus {
    NotMaterialized,
    Materializing(f64),
    Materialized,
}

impl DownloadStatus {
    /// Persisted form. Progress is transient and is not stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotMaterialized => "remote",
            DownloadStatus::Materializing(_) => "downloading",
            DownloadStatus::Materialized => "local",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remote" => Some(DownloadStatus::NotMaterialized),
            "downloading" => Some(DownloadStatus::Materializing(0.0)),
            "local" => Some(DownloadStatus::Materialized),
            _ => None,
        }
    }

    pub fn from_fraction(fraction: f64) -> Self {
        if fraction >= 1.0 {
            DownloadStatus::Materialized
        } else {
            DownloadStatus::Materializing(fraction.max(0.0))
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, DownloadStatus::Materialized)
    }

    /// Compares the persisted kind only, ignoring progress.
    pub fn same_kind(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedItem {
    pub url: String,
    pub is_deleted: bool,
    pub is_updated: bool,
    pub is_collection: bool,
    pub download_status: DownloadStatus,
}

impl ObservedItem {
    pub fn present(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_deleted: false,
            is_updated: false,
            is_collection: false,
            download_status: DownloadStatus::Materialized,
        }
    }

    pub fn updated(url: impl Into<String>) -> Self {
        Self {
            is_updated: true,
            ..Self::present(url)
        }
    }

    pub fn deleted(url: impl Into<String>) -> Self {
        Self {
            is_deleted: true,
            ..Self::present(url)
        }
    }

    pub fn with_status(mut self, status: DownloadStatus) -> Self {
        self.download_status = status;
        self
    }

    pub fn collection(mut self) -> Self {
        self.is_collection = true;
        self
    }
}

/// One observation of the managed directory. `is_first` marks a full listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub items: Vec<ObservedItem>,
    pub is_first: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPartition {
    pub for_sync: Vec<ObservedItem>,
    pub for_update: Vec<ObservedItem>,
    pub for_delete: Vec<ObservedItem>,
}

impl SyncSnapshot {
    pub fn full(items: Vec<ObservedItem>) -> Self {
        Self {
            items,
            is_first: true,
        }
    }

    pub fn incremental(items: Vec<ObservedItem>) -> Self {
        Self {
            items,
            is_first: false,
        }
    }

    /// A first listing, or an empty observation meaning the directory is now empty.
    pub fn is_full_listing(&self) -> bool {
        self.is_first || self.items.is_empty()
    }

    pub fn partition(&self) -> SnapshotPartition {
        let mut out = SnapshotPartition::default();
        for item in &self.items {
            if item.is_deleted {
                out.for_delete.push(item.clone());
            } else if item.is_updated {
                out.for_update.push(item.clone());
            } else {
                out.for_sync.push(item.clone());
            }
        }
        out
    }
}

pub fn parent_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}

/// Display title for a url: the last component without its extension.
pub fn title_for_url(url: &str) -> String {
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}
