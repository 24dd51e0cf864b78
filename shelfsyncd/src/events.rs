//! Typed notifications for the presentation layer.
//!
//! Events are published on a `tokio::sync::broadcast` channel. Delivery order
//! matches publish order, but subscribers receive them asynchronously. A slow
//! subscriber sees `RecvError::Lagged` instead of blocking publishers.

use serde::Serialize;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::Receiver;
pub use tokio::sync::broadcast::error::RecvError;

use crate::sync::sequencer::PlaybackMode;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LibraryEvent {
    SyncStarted,
    SyncFinished {
        inserted: usize,
        updated: usize,
        deleted: usize,
    },
    EntryUpdated {
        url: String,
    },
    DownloadProgress {
        url: String,
        fraction: f64,
    },
    SortStarted {
        mode: PlaybackMode,
    },
    SortFinished {
        mode: PlaybackMode,
    },
    TaskCountChanged {
        count: i64,
    },
    TaskStarted {
        remaining: i64,
    },
    TaskFinished {
        remaining: i64,
        previous: i64,
    },
    TaskFailed {
        id: i64,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LibraryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire-and-forget: having no subscriber is not an error.
    pub fn emit(&self, event: LibraryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Receiver<LibraryEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

/// Drains everything currently buffered for `rx` without waiting.
pub fn drain(rx: &mut Receiver<LibraryEvent>) -> Vec<LibraryEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}
