//! DownloadQueue: admission control and bounded parallelism.
//!
//! Grounded in `download_manager.rs::DownloadManager`'s
//! `Arc<RwLock<HashMap<Uuid, broadcast::Sender<()>>>>` active-set pattern,
//! generalized into an explicit waiting-queue + active-set actor guarded by
//! a single `tokio::sync::Mutex` so every mutating call serializes, matching
//! the "single logical actor" requirement in §5.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::{Result, VidBeeError};
use crate::events::{EventBus, QueueStatus, VidBeeEvent};
use crate::models::{DownloadRequest, DownloadTask};

/// Bound on how many completed jobs `get_details` can still answer for
/// after `on_completion`. Beyond this, HistoryStore is the source of truth.
const COMPLETED_CACHE_SIZE: usize = 256;

/// Carries a job id + request to whatever is driving execution.
#[derive(Debug, Clone)]
pub struct StartSignal {
    pub id: String,
    pub request: DownloadRequest,
}

struct Inner {
    waiting: VecDeque<String>,
    active: HashSet<String>,
    active_cancel: HashMap<String, broadcast::Sender<()>>,
    requests: HashMap<String, DownloadRequest>,
    tasks: HashMap<String, DownloadTask>,
    completed_order: VecDeque<String>,
    max_concurrent: usize,
}

pub struct DownloadQueue {
    inner: Mutex<Inner>,
    start_tx: mpsc::Sender<StartSignal>,
    events: EventBus,
}

impl DownloadQueue {
    pub fn new(max_concurrent: usize, events: EventBus) -> (Self, mpsc::Receiver<StartSignal>) {
        let (start_tx, start_rx) = mpsc::channel(64);
        let queue = Self {
            inner: Mutex::new(Inner {
                waiting: VecDeque::new(),
                active: HashSet::new(),
                active_cancel: HashMap::new(),
                requests: HashMap::new(),
                tasks: HashMap::new(),
                completed_order: VecDeque::new(),
                max_concurrent,
            }),
            start_tx,
            events,
        };
        (queue, start_rx)
    }

    /// Appends to the waiting queue and publishes `queue-updated`. Rejects a
    /// duplicate id already present in the queue or active set.
    pub async fn add(&self, id: String, request: DownloadRequest, task: DownloadTask) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.requests.contains_key(&id) || inner.active.contains(&id) {
                return Err(VidBeeError::QueueDuplicateId(id));
            }
            inner.waiting.push_back(id.clone());
            inner.requests.insert(id.clone(), request);
            inner.tasks.insert(id, task);
        }
        self.schedule().await;
        Ok(())
    }

    /// Removes a queued job, or requests cancellation of an active one.
    /// Returns whether anything was found.
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.waiting.iter().position(|w| w == id) {
            inner.waiting.remove(pos);
            inner.requests.remove(id);
            inner.tasks.remove(id);
            drop(inner);
            self.publish_status().await;
            return true;
        }
        if let Some(sender) = inner.active_cancel.get(id).cloned() {
            let _ = sender.send(());
            return true;
        }
        false
    }

    /// Called by the owner of execution once a cancel channel exists for an
    /// active job (registered right after the start signal is consumed).
    pub async fn register_active_cancel(&self, id: &str, sender: broadcast::Sender<()>) {
        let mut inner = self.inner.lock().await;
        inner.active_cancel.insert(id.to_string(), sender);
    }

    /// Moves a job from active to the completed cache and re-drives scheduling.
    pub async fn on_completion(&self, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.active.remove(id);
            inner.active_cancel.remove(id);
            inner.completed_order.push_back(id.to_string());
            while inner.completed_order.len() > COMPLETED_CACHE_SIZE {
                if let Some(evicted) = inner.completed_order.pop_front() {
                    inner.requests.remove(&evicted);
                    inner.tasks.remove(&evicted);
                }
            }
        }
        self.schedule().await;
    }

    pub async fn set_max_concurrent(&self, n: usize) {
        {
            let mut inner = self.inner.lock().await;
            inner.max_concurrent = n;
        }
        self.schedule().await;
    }

    pub async fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        QueueStatus {
            queued: inner.waiting.len(),
            active: inner.active.len(),
            active_ids: inner.active.iter().cloned().collect(),
        }
    }

    pub async fn get_details(&self, id: &str) -> Option<(DownloadRequest, DownloadTask)> {
        let inner = self.inner.lock().await;
        match (inner.requests.get(id), inner.tasks.get(id)) {
            (Some(req), Some(task)) => Some((req.clone(), task.clone())),
            _ => None,
        }
    }

    /// Merges a patch into whichever copy of the display task currently
    /// holds the id (queued, active, or still in the completed cache).
    pub async fn update_task_info(&self, id: &str, patch: impl FnOnce(&mut DownloadTask)) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(id) {
            patch(task);
        }
    }

    async fn schedule(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                if inner.active.len() >= inner.max_concurrent {
                    break;
                }
                match inner.waiting.pop_front() {
                    Some(id) => {
                        inner.active.insert(id.clone());
                        let request = inner.requests.get(&id).cloned();
                        request.map(|r| (id, r))
                    }
                    None => break,
                }
            };
            match next {
                Some((id, request)) => {
                    let _ = self.start_tx.send(StartSignal { id, request }).await;
                }
                None => break,
            }
        }
        self.publish_status().await;
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.events.emit(VidBeeEvent::QueueUpdated { status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadRequest, DownloadTask, RequestKind};

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest::manual(url, RequestKind::Video)
    }

    #[tokio::test]
    async fn active_count_never_exceeds_max_concurrent() {
        let (queue, mut start_rx) = DownloadQueue::new(2, EventBus::new());
        for i in 0..5 {
            let id = format!("job-{i}");
            let task = DownloadTask::new(id.clone(), request("https://example.com"));
            queue.add(id, request("https://example.com"), task).await.unwrap();
        }
        let status = queue.status().await;
        assert!(status.active <= 2);
        assert_eq!(status.active + status.queued, 5);

        // Drain exactly two start signals (one per active slot).
        start_rx.try_recv().unwrap();
        start_rx.try_recv().unwrap();
        assert!(start_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (queue, _start_rx) = DownloadQueue::new(2, EventBus::new());
        let task = DownloadTask::new("dup", request("https://example.com"));
        queue.add("dup".to_string(), request("https://example.com"), task.clone()).await.unwrap();
        let err = queue.add("dup".to_string(), request("https://example.com"), task).await;
        assert!(matches!(err, Err(VidBeeError::QueueDuplicateId(_))));
    }

    #[tokio::test]
    async fn completion_frees_a_slot_for_the_next_queued_job() {
        let (queue, mut start_rx) = DownloadQueue::new(1, EventBus::new());
        for i in 0..2 {
            let id = format!("job-{i}");
            let task = DownloadTask::new(id.clone(), request("https://example.com"));
            queue.add(id, request("https://example.com"), task).await.unwrap();
        }
        let first = start_rx.try_recv().unwrap();
        assert!(start_rx.try_recv().is_err());
        queue.on_completion(&first.id).await;
        let second = start_rx.try_recv().unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn remove_from_waiting_queue_reports_removed() {
        let (queue, _start_rx) = DownloadQueue::new(0, EventBus::new());
        let task = DownloadTask::new("waiting-job", request("https://example.com"));
        queue.add("waiting-job".to_string(), request("https://example.com"), task).await.unwrap();
        assert!(queue.remove("waiting-job").await);
        assert!(!queue.remove("waiting-job").await);
    }
}
