//! Durable copy-into-library imports.
//!
//! `CopyTaskQueue` persists requests in the catalog database and wakes the
//! worker; `CopyWorker` copies one task at a time into the managed root.
//! `WorkerLock` keeps a second process from running its own worker.

mod lock;
mod queue;
mod worker;

use shelfsync_core::{CapabilityError, StorageError};
use thiserror::Error;

use crate::catalog::CatalogError;

pub use lock::WorkerLock;
pub use queue::CopyTaskQueue;
pub use worker::{CopyWorker, TaskOutcome, candidate_name, partial_path};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("source unavailable: {0}")]
    Capability(#[from] CapabilityError),
    #[error("invalid destination: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
}
