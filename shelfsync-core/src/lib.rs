mod bookmark;
mod capability;
mod snapshot;
mod storage;

pub use bookmark::{BookmarkError, CurrentItemStore, MemoryBookmarks};
pub use capability::{
    CapabilityError, PathToken, PathTokenResolver, ResolvedSource, SourceToken, TokenResolver,
};
pub use snapshot::{
    DownloadStatus, ObservedItem, SnapshotPartition, SyncSnapshot, parent_url, title_for_url,
};
pub use storage::{LocalStorage, StorageError, StorageLayer, managed_path_for};
