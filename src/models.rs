use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One entry in an extractor-reported format catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub id: String,
    pub ext: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub format_note: Option<String>,
    pub protocol: Option<String>,
    pub video_ext: Option<String>,
    pub audio_ext: Option<String>,
    pub language: Option<String>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        matches!(&self.vcodec, Some(c) if c != "none")
    }

    pub fn has_audio(&self) -> bool {
        matches!(&self.acodec, Some(c) if c != "none")
    }

    /// True when both a video and an audio track are muxed into this one format.
    pub fn is_muxed(&self) -> bool {
        self.has_video() && self.has_audio()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistEntryRef {
    pub id: String,
    pub title: Option<String>,
    pub url: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    pub entries: Vec<PlaylistEntryRef>,
    pub entry_count: usize,
}

/// A request for one video/audio acquisition, before it is admitted to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Manual,
    Subscription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistContext {
    pub playlist_id: String,
    pub playlist_title: String,
    pub playlist_index: u32,
    pub playlist_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub kind: RequestKind,
    #[serde(default)]
    pub explicit_format_selector: Option<String>,
    #[serde(default)]
    pub explicit_audio_format: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub download_subs: bool,
    #[serde(default)]
    pub output_dir_override: Option<String>,
    #[serde(default)]
    pub filename_template_override: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    pub origin: Origin,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub playlist_context: Option<PlaylistContext>,
}

impl DownloadRequest {
    pub fn manual(url: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            url: url.into(),
            kind,
            explicit_format_selector: None,
            explicit_audio_format: None,
            start_time: None,
            end_time: None,
            download_subs: false,
            output_dir_override: None,
            filename_template_override: None,
            tags: HashSet::new(),
            origin: Origin::Manual,
            subscription_id: None,
            playlist_context: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => DownloadStatus::Pending,
            "downloading" => DownloadStatus::Downloading,
            "processing" => DownloadStatus::Processing,
            "completed" => DownloadStatus::Completed,
            "error" => DownloadStatus::Error,
            "cancelled" => DownloadStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub percent: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    pub fn empty() -> Self {
        Self {
            percent: None,
            downloaded: None,
            total: None,
            speed_bps: None,
            eta_seconds: None,
        }
    }
}

/// A job tracked through queue, engine, and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub request: DownloadRequest,
    pub status: DownloadStatus,
    pub progress: Option<DownloadProgress>,
    pub selected_format: Option<FormatDescriptor>,
    pub resolved_ext: Option<String>,
    pub resolved_quality_label: Option<String>,
    pub resolved_codec: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub error: Option<String>,
    pub yt_dlp_command: Option<Vec<String>>,
    #[serde(default)]
    pub yt_dlp_log: Vec<String>,

    // Display fields copied from VideoInfo.
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
    #[serde(default)]
    pub tags: HashSet<String>,
}

impl DownloadTask {
    pub fn new(id: impl Into<String>, request: DownloadRequest) -> Self {
        let tags = request.tags.clone();
        Self {
            id: id.into(),
            request,
            status: DownloadStatus::Pending,
            progress: None,
            selected_format: None,
            resolved_ext: None,
            resolved_quality_label: None,
            resolved_codec: None,
            started_at: None,
            completed_at: None,
            file_size: None,
            error: None,
            yt_dlp_command: None,
            yt_dlp_log: Vec::new(),
            title: None,
            thumbnail: None,
            duration: None,
            uploader: None,
            description: None,
            view_count: None,
            tags,
        }
    }
}

/// Durable shadow of a DownloadTask. Superset of fields that survive process termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub kind: RequestKind,
    pub status: DownloadStatus,
    pub download_path: Option<String>,
    pub saved_file_name: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<f64>,
    pub downloaded_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sort_key: DateTime<Utc>,
    pub error: Option<String>,
    pub description: Option<String>,
    pub channel: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub tags: HashSet<String>,
    pub origin: Origin,
    pub subscription_id: Option<String>,
    pub selected_format: Option<FormatDescriptor>,
    pub playlist_context: Option<PlaylistContext>,
}

impl HistoryRecord {
    pub fn pending_from_task(task: &DownloadTask) -> Self {
        let now = Utc::now();
        Self {
            id: task.id.clone(),
            url: task.request.url.clone(),
            title: task.title.clone(),
            thumbnail: task.thumbnail.clone(),
            kind: task.request.kind.clone(),
            status: task.status,
            download_path: None,
            saved_file_name: None,
            file_size: None,
            duration: task.duration,
            downloaded_at: now,
            completed_at: None,
            sort_key: now,
            error: None,
            description: task.description.clone(),
            channel: None,
            uploader: task.uploader.clone(),
            view_count: task.view_count,
            tags: task.tags.clone(),
            origin: task.request.origin.clone(),
            subscription_id: task.request.subscription_id.clone(),
            selected_format: task.selected_format.clone(),
            playlist_context: task.request.playlist_context.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    YouTube,
    Bilibili,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Idle,
    Checking,
    UpToDate,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub feed_url: String,
    pub platform: Platform,
    pub keywords: HashSet<String>,
    pub tags: HashSet<String>,
    pub only_latest: bool,
    pub enabled: bool,
    pub cover_url: Option<String>,
    pub latest_video_title: Option<String>,
    pub latest_video_published_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub status: SubscriptionStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub download_directory: Option<String>,
    pub naming_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub subscription_id: String,
    pub item_id: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub thumbnail: Option<String>,
    pub added_to_queue: bool,
    pub download_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
