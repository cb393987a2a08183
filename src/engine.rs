//! DownloadEngine: drives one job at a time through `info` resolution,
//! format selection, `yt-dlp` invocation, and history persistence.
//!
//! Grounded in `download_manager.rs::DownloadManager::start`/
//! `execute_download` (metadata-first-if-untitled flow, cancel channel
//! creation, spawn + select loop, cleanup-on-completion match) fused with
//! `ytdlp.rs`'s JSON-line parsing for the `info`/`playlist` calls.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventBus, VidBeeEvent};
use crate::extractor::{DownloadEvent, ExtractorDriver};
use crate::format_resolver;
use crate::history::HistoryStore;
use crate::models::{
    DownloadRequest, DownloadStatus, DownloadTask, HistoryRecord, PlaylistContext, RequestKind,
};
use crate::queue::{DownloadQueue, StartSignal};
use crate::settings::Settings;

pub struct DownloadEngine {
    queue: Arc<DownloadQueue>,
    extractor: Arc<ExtractorDriver>,
    history: Arc<HistoryStore>,
    events: EventBus,
    settings: Arc<RwLock<Settings>>,
}

impl DownloadEngine {
    /// Builds the engine and spawns the loop that consumes `StartSignal`s
    /// from the queue's admission channel. Returns the engine handle; the
    /// driving task runs for the lifetime of the process.
    pub fn spawn(
        queue: Arc<DownloadQueue>,
        start_rx: mpsc::Receiver<StartSignal>,
        extractor: Arc<ExtractorDriver>,
        history: Arc<HistoryStore>,
        events: EventBus,
        settings: Arc<RwLock<Settings>>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            queue,
            extractor,
            history,
            events,
            settings,
        });
        let driving = engine.clone();
        tokio::spawn(async move { driving.run(start_rx).await });
        engine
    }

    async fn run(self: Arc<Self>, mut start_rx: mpsc::Receiver<StartSignal>) {
        while let Some(signal) = start_rx.recv().await {
            let job = self.clone();
            tokio::spawn(async move { job.execute(signal).await });
        }
    }

    /// Admits a manual request to the queue under a fresh id.
    pub async fn submit(&self, request: DownloadRequest) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.submit_with_id(id, request).await
    }

    /// Admits a request under a caller-chosen id. Subscription polling uses
    /// this with a deterministic `(subscription_id, item_id)` derived id so
    /// re-polling the same feed item never double-enqueues: `queue.add`
    /// rejects a duplicate id outright.
    pub async fn submit_with_id(&self, id: String, request: DownloadRequest) -> Result<String> {
        let task = DownloadTask::new(id.clone(), request.clone());
        self.queue.add(id.clone(), request, task.clone()).await?;

        let record = HistoryRecord::pending_from_task(&task);
        if let Err(e) = self.history.upsert(&record).await {
            log::warn!("failed to persist pending history for {id}: {e}");
        }

        Ok(id)
    }

    /// Resolves a playlist and submits one request per entry, tagging each
    /// with a `PlaylistContext`.
    pub async fn submit_playlist(&self, url: &str, kind: RequestKind) -> Result<Vec<String>> {
        let settings = self.settings.read().await.clone();
        let playlist = self.extractor.playlist(url, &settings).await?;
        let mut ids = Vec::with_capacity(playlist.entries.len());
        for entry in &playlist.entries {
            let mut request = DownloadRequest::manual(entry.url.clone(), kind.clone());
            request.playlist_context = Some(PlaylistContext {
                playlist_id: playlist.id.clone(),
                playlist_title: playlist.title.clone(),
                playlist_index: entry.index,
                playlist_size: playlist.entry_count,
            });
            ids.push(self.submit(request).await?);
        }
        Ok(ids)
    }

    pub async fn cancel(&self, id: &str) -> bool {
        self.queue.remove(id).await
    }

    pub async fn status(&self) -> crate::events::QueueStatus {
        self.queue.status().await
    }

    pub async fn get_task(&self, id: &str) -> Option<DownloadTask> {
        self.queue.get_details(id).await.map(|(_, task)| task)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.history.save_settings(&settings).await?;
        *self.settings.write().await = settings;
        Ok(())
    }

    pub async fn current_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Used by the LoopbackBridge's `/video-info` endpoint: a one-shot
    /// metadata fetch that never touches the queue.
    pub async fn fetch_info(
        &self,
        url: &str,
        settings: &Settings,
    ) -> Result<crate::models::VideoInfo> {
        self.extractor.info(url, settings).await
    }

    async fn execute(&self, signal: StartSignal) {
        let id = signal.id;
        let request = signal.request;
        let settings = self.settings.read().await.clone();

        self.queue
            .update_task_info(&id, |t| t.status = DownloadStatus::Downloading)
            .await;
        self.events.emit(VidBeeEvent::DownloadStarted { id: id.clone() });

        if let Some(task) = self.queue.get_details(&id).await.map(|(_, t)| t) {
            let record = HistoryRecord::pending_from_task(&task);
            if let Err(e) = self.history.upsert(&record).await {
                log::warn!("failed to persist downloading history for {id}: {e}");
            }
        }

        // Best-effort metadata resolution. Failure here is non-fatal: the
        // download proceeds with whatever yt-dlp resolves at invocation time.
        let mut selected = None;
        let mut catalog: Vec<crate::models::FormatDescriptor> = Vec::new();
        match self.extractor.info(&request.url, &settings).await {
            Ok(info) => {
                self.queue
                    .update_task_info(&id, |t| {
                        t.title = Some(info.title.clone());
                        t.thumbnail = info.thumbnail.clone();
                        t.duration = info.duration;
                        t.description = info.description.clone();
                        t.uploader = info.uploader.clone();
                        t.view_count = info.view_count;
                    })
                    .await;
                selected = format_resolver::resolve(
                    &info.formats,
                    request.kind.clone(),
                    request.explicit_format_selector.as_deref(),
                    settings.default_preset,
                )
                .cloned();
                catalog = info.formats;
                if let Some(descriptor) = &selected {
                    self.queue
                        .update_task_info(&id, |t| {
                            t.resolved_ext = Some(descriptor.ext.clone());
                            t.resolved_codec = descriptor.vcodec.clone().or_else(|| descriptor.acodec.clone());
                            t.resolved_quality_label = descriptor.height.map(|h| format!("{h}p"));
                            t.selected_format = Some(descriptor.clone());
                        })
                        .await;
                }
            }
            Err(e) => {
                log::warn!("metadata resolution failed for {id}: {e}");
            }
        }

        let output_template = self.build_output_template(&request, &settings);
        let args = self.extractor.build_download_args(
            &request,
            selected.as_ref(),
            &output_template,
            &settings,
        );
        self.queue
            .update_task_info(&id, |t| {
                let mut command = vec![self.extractor_binary_display()];
                command.extend(args.clone());
                t.yt_dlp_command = Some(command);
            })
            .await;

        let (cancel_tx, cancel_rx) = tokio::sync::broadcast::channel::<()>(1);
        let mut cancel_witness = cancel_tx.subscribe();
        self.queue.register_active_cancel(&id, cancel_tx).await;

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<DownloadEvent>();
        let on_event = move |event: DownloadEvent| {
            let _ = ev_tx.send(event);
        };

        let download_fut = self.extractor.download(&args, cancel_rx, on_event);
        let job_id = id.clone();
        let queue = self.queue.clone();
        let events = self.events.clone();
        let format_catalog = catalog.clone();
        let drain_fut = async move {
            while let Some(event) = ev_rx.recv().await {
                match event {
                    DownloadEvent::Progress(progress) => {
                        queue
                            .update_task_info(&job_id, |t| t.progress = Some(progress.clone()))
                            .await;
                        events.emit(VidBeeEvent::DownloadProgress {
                            id: job_id.clone(),
                            progress,
                        });
                    }
                    DownloadEvent::FormatHint(format_id) => {
                        match format_catalog.iter().find(|d| d.id == format_id) {
                            Some(descriptor) => {
                                let descriptor = descriptor.clone();
                                queue
                                    .update_task_info(&job_id, |t| {
                                        t.resolved_ext = Some(descriptor.ext.clone());
                                        t.resolved_codec =
                                            descriptor.vcodec.clone().or_else(|| descriptor.acodec.clone());
                                        t.resolved_quality_label = descriptor.height.map(|h| format!("{h}p"));
                                        t.selected_format = Some(descriptor.clone());
                                    })
                                    .await;
                            }
                            None => {
                                queue
                                    .update_task_info(&job_id, |t| {
                                        if t.resolved_quality_label.is_none() {
                                            t.resolved_quality_label = Some(format_id.clone());
                                        }
                                    })
                                    .await;
                            }
                        }
                    }
                    DownloadEvent::Error(message) => {
                        log::debug!("extractor stream error for {job_id}: {message}");
                    }
                    DownloadEvent::Close(_) => {}
                }
            }
        };

        let (download_result, _) = tokio::join!(download_fut, drain_fut);
        let was_cancelled = cancel_witness.try_recv().is_ok();

        self.finish(id, request, selected, settings, download_result, was_cancelled)
            .await;
    }

    async fn finish(
        &self,
        id: String,
        request: DownloadRequest,
        selected: Option<crate::models::FormatDescriptor>,
        settings: Settings,
        download_result: Result<()>,
        was_cancelled: bool,
    ) {
        if was_cancelled {
            self.queue
                .update_task_info(&id, |t| t.status = DownloadStatus::Cancelled)
                .await;
            self.events.emit(VidBeeEvent::DownloadCancelled { id: id.clone() });

            if let Some(task) = self.queue.get_details(&id).await.map(|(_, t)| t) {
                let mut record = HistoryRecord::pending_from_task(&task);
                record.status = DownloadStatus::Cancelled;
                record.completed_at = Some(chrono::Utc::now());
                record.sort_key = record.completed_at.unwrap();
                if let Err(e) = self.history.upsert(&record).await {
                    log::warn!("failed to persist cancelled history for {id}: {e}");
                }
            }

            self.queue.on_completion(&id).await;
            return;
        }

        match download_result {
            Ok(()) => {
                let task = self.queue.get_details(&id).await.map(|(_, t)| t);
                let download_dir = request
                    .output_dir_override
                    .clone()
                    .map(std::path::PathBuf::from)
                    .unwrap_or_else(|| settings.download_path.clone());
                let ext = match request.kind {
                    RequestKind::Audio => "mp3".to_string(),
                    RequestKind::Video => selected
                        .as_ref()
                        .map(|d| d.ext.clone())
                        .unwrap_or_else(|| default_ext(&request.kind)),
                };
                let title = task.as_ref().and_then(|t| t.title.clone()).unwrap_or_else(|| id.clone());
                let replaced = sanitize_filename::sanitize_with_options(
                    title.trim(),
                    sanitize_filename::Options {
                        truncate: false,
                        windows: true,
                        replacement: "_",
                    },
                );
                let sanitized: String = replaced.chars().take(50).collect();
                let final_path = download_dir.join(format!("{sanitized}.{ext}"));
                let file_size = tokio::fs::metadata(&final_path).await.ok().map(|m| m.len());

                self.queue
                    .update_task_info(&id, |t| {
                        t.status = DownloadStatus::Completed;
                        t.completed_at = Some(chrono::Utc::now());
                        t.file_size = file_size;
                    })
                    .await;
                self.events.emit(VidBeeEvent::DownloadCompleted { id: id.clone() });

                if let Some(task) = self.queue.get_details(&id).await.map(|(_, t)| t) {
                    let mut record = HistoryRecord::pending_from_task(&task);
                    record.status = DownloadStatus::Completed;
                    record.completed_at = Some(chrono::Utc::now());
                    record.sort_key = record.completed_at.unwrap();
                    record.download_path = Some(download_dir.display().to_string());
                    record.saved_file_name = Some(format!("{sanitized}.{ext}"));
                    record.file_size = file_size;
                    if let Err(e) = self.history.upsert(&record).await {
                        log::warn!("failed to persist history for {id}: {e}");
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.queue
                    .update_task_info(&id, |t| {
                        t.status = DownloadStatus::Error;
                        t.error = Some(message.clone());
                    })
                    .await;
                self.events.emit(VidBeeEvent::DownloadError {
                    id: id.clone(),
                    message: message.clone(),
                });

                if let Some(task) = self.queue.get_details(&id).await.map(|(_, t)| t) {
                    let mut record = HistoryRecord::pending_from_task(&task);
                    record.status = DownloadStatus::Error;
                    record.error = Some(message);
                    if let Err(e) = self.history.upsert(&record).await {
                        log::warn!("failed to persist history for {id}: {e}");
                    }
                }
            }
        }

        self.queue.on_completion(&id).await;
    }

    fn build_output_template(&self, request: &DownloadRequest, settings: &Settings) -> String {
        let default = &settings.filename_template;
        let template = request.filename_template_override.as_deref().unwrap_or(default.as_str());
        let sanitized = crate::extractor::sanitize_filename_template(template, default);
        let dir = request
            .output_dir_override
            .clone()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| settings.download_path.clone());
        dir.join(sanitized).display().to_string()
    }

    fn extractor_binary_display(&self) -> String {
        "yt-dlp".to_string()
    }
}

fn default_ext(kind: &RequestKind) -> String {
    match kind {
        RequestKind::Video => "mp4".to_string(),
        RequestKind::Audio => "mp3".to_string(),
    }
}
