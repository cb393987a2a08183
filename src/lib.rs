//! VidBee: library facade wiring DownloadQueue + DownloadEngine + HistoryStore
//! + SubscriptionScheduler + LoopbackBridge together.
//!
//! Grounded in the teacher's `lib.rs` composition root
//! (`AppState`/`get_or_init_download_manager`), with the Tauri
//! `AppHandle`/`State`/command-handler layer removed since there is no UI
//! shell in scope; the consumer here is any process that links the crate
//! (tests, the host binary, or a future UI layer).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

pub mod bridge;
pub mod engine;
pub mod error;
pub mod events;
pub mod extractor;
pub mod format_resolver;
pub mod history;
pub mod locator;
pub mod models;
pub mod queue;
pub mod settings;
pub mod subscription;

use bridge::LoopbackBridge;
use engine::DownloadEngine;
use error::Result;
use events::EventBus;
use extractor::ExtractorDriver;
use history::HistoryStore;
use queue::DownloadQueue;
use settings::Settings;
use subscription::SubscriptionScheduler;

/// Default per-user data directory, mirroring the teacher's `app_data_dir`.
pub fn app_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "VidBee")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| error::VidBeeError::Persistence("could not resolve app data dir".to_string()))
}

/// The assembled engine: queue, extractor-driven execution, durable history,
/// subscription polling, and the loopback bridge, all sharing one event bus.
pub struct VidBee {
    pub engine: Arc<DownloadEngine>,
    pub history: Arc<HistoryStore>,
    pub scheduler: Arc<SubscriptionScheduler>,
    pub events: EventBus,
    pub bridge_port: Option<u16>,
}

impl VidBee {
    /// Opens the history database at `data_dir/history.sqlite3`, locates the
    /// extractor binary, and wires every component together. Spawns the
    /// engine's execution loop and the subscription scheduler's timer; does
    /// NOT start the loopback bridge (call `start_bridge` separately so
    /// tests can opt out of binding a socket).
    pub async fn bootstrap(data_dir: PathBuf, settings: Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let history = Arc::new(HistoryStore::open(data_dir.join("history.sqlite3")).await?);
        let binary = locator::locate_ytdlp()?;
        let extractor = Arc::new(ExtractorDriver::new(binary));
        let events = EventBus::new();

        let settings = match history.load_settings().await? {
            Some(persisted) => persisted,
            None => {
                history.save_settings(&settings).await?;
                settings
            }
        };
        let settings = Arc::new(RwLock::new(settings));

        let max_concurrent = settings.read().await.max_concurrent;
        let (queue, start_rx) = DownloadQueue::new(max_concurrent, events.clone());
        let queue = Arc::new(queue);

        let engine = DownloadEngine::spawn(
            queue.clone(),
            start_rx,
            extractor,
            history.clone(),
            events.clone(),
            settings.clone(),
        );

        let scheduler = Arc::new(SubscriptionScheduler::new(
            engine.clone(),
            history.clone(),
            events.clone(),
            settings,
        ));
        scheduler.clone().spawn();

        Ok(Self {
            engine,
            history,
            scheduler,
            events,
            bridge_port: None,
        })
    }

    /// Starts the loopback HTTP bridge, binding the first free port in its
    /// fixed range. Returns the bound port.
    pub async fn start_bridge(&mut self) -> Result<u16> {
        let bridge = LoopbackBridge::start(self.engine.clone()).await?;
        self.bridge_port = Some(bridge.bound_port);
        Ok(bridge.bound_port)
    }
}
