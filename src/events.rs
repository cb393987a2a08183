//! Lifecycle event bus.
//!
//! The teacher emits to a Tauri `AppHandle`; there is no window here, so the
//! same tagged-enum event shape is published on a `tokio::sync::broadcast`
//! channel instead. Consumers (tests, the host binary, a future UI layer)
//! subscribe independently; a slow or absent subscriber never blocks a job.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::DownloadProgress;

/// Default channel capacity. Generous enough that a subscriber which is
/// merely slow (not absent) won't miss events under normal job counts.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub active_ids: Vec<String>,
}

/// Engine/queue/subscription lifecycle events, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum VidBeeEvent {
    DownloadStarted {
        id: String,
    },
    DownloadProgress {
        id: String,
        progress: DownloadProgress,
    },
    DownloadCompleted {
        id: String,
    },
    DownloadError {
        id: String,
        message: String,
    },
    DownloadCancelled {
        id: String,
    },
    QueueUpdated {
        status: QueueStatus,
    },
    SubscriptionChecking {
        subscription_id: String,
    },
    SubscriptionUpToDate {
        subscription_id: String,
    },
    SubscriptionFailed {
        subscription_id: String,
        message: String,
    },
}

/// Thin wrapper around a `broadcast::Sender` so call sites read like the
/// teacher's `emit_event(app, ...)` calls.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VidBeeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VidBeeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A `SendError` only occurs when there are no
    /// subscribers at all; that's expected when nothing is listening yet and
    /// is not itself an error condition for the caller.
    pub fn emit(&self, event: VidBeeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(VidBeeEvent::DownloadStarted {
            id: "abc".to_string(),
        });
        let received = rx.recv().await.unwrap();
        matches!(received, VidBeeEvent::DownloadStarted { id } if id == "abc");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(VidBeeEvent::QueueUpdated {
            status: QueueStatus {
                queued: 0,
                active: 0,
                active_ids: vec![],
            },
        });
    }
}
