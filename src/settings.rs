//! Settings
//!
//! Persistence and retrieval of engine configuration using SQLite, stored as
//! a single JSON blob keyed by setting name — the same shape the teacher uses
//! for its `UserSettings`, trimmed to the surface the engine actually reads
//! (UI editors, SponsorBlock, window state, and update-channel settings have
//! no counterpart here).

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, VidBeeError};
use crate::format_resolver::Preset;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,

    #[serde(default = "default_concurrency")]
    pub max_concurrent: usize,

    #[serde(default = "default_preset")]
    pub default_preset: Preset,

    #[serde(default = "default_check_interval")]
    pub subscription_check_interval_hours: u32,

    #[serde(default = "default_filename_template")]
    pub filename_template: String,

    #[serde(default)]
    pub subscription_filename_template: Option<String>,

    #[serde(default = "default_true")]
    pub embed_metadata: bool,
    #[serde(default = "default_true")]
    pub embed_thumbnail: bool,
    #[serde(default)]
    pub embed_subs: bool,
    #[serde(default)]
    pub embed_chapters: bool,

    #[serde(default)]
    pub subtitles: SubtitleSettings,

    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
    #[serde(default)]
    pub cookies_from_browser: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub config_location: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: default_download_path(),
            max_concurrent: default_concurrency(),
            default_preset: default_preset(),
            subscription_check_interval_hours: default_check_interval(),
            filename_template: default_filename_template(),
            subscription_filename_template: None,
            embed_metadata: true,
            embed_thumbnail: true,
            embed_subs: false,
            embed_chapters: false,
            subtitles: SubtitleSettings::default(),
            cookies_file: None,
            cookies_from_browser: None,
            proxy: None,
            config_location: None,
        }
    }
}

impl Settings {
    /// `clamp(subscription_check_interval_hours, 1, 24)`, per §4.6.
    pub fn effective_check_interval_hours(&self) -> u32 {
        self.subscription_check_interval_hours.clamp(1, 24)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleSettings {
    #[serde(default)]
    pub enabled_by_default: bool,
    #[serde(default = "default_subtitle_language")]
    pub default_language: String,
    #[serde(default)]
    pub include_auto_captions: bool,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            enabled_by_default: false,
            default_language: default_subtitle_language(),
            include_auto_captions: false,
        }
    }
}

fn default_download_path() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_concurrency() -> usize {
    2
}

fn default_check_interval() -> u32 {
    6
}

fn default_preset() -> Preset {
    Preset::Good
}

fn default_filename_template() -> String {
    "%(title)s via VidBee.%(ext)s".to_string()
}

fn default_subtitle_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

pub mod keys {
    pub const SETTINGS: &str = "vidbee_settings";
}

/// Reads/writes `Settings` from a `settings(key, value_json)` table.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json).map_err(|e| VidBeeError::Parse {
                    where_: "settings".to_string(),
                    message: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(|e| VidBeeError::Parse {
            where_: "settings".to_string(),
            message: e.to_string(),
        })?;
        self.conn.execute(
            "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
            params![key, json],
        )?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<Settings> {
        self.get::<Settings>(keys::SETTINGS)
            .map(|opt| opt.unwrap_or_default())
    }

    /// Like `get_settings`, but returns `None` when nothing has been saved
    /// yet instead of silently substituting the default.
    pub fn get_settings_opt(&self) -> Result<Option<Settings>> {
        self.get::<Settings>(keys::SETTINGS)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.set(keys::SETTINGS, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE settings (key TEXT PRIMARY KEY, value_json TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn missing_settings_returns_default() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);
        let settings = manager.get_settings().unwrap();
        assert_eq!(settings.max_concurrent, default_concurrency());
    }

    #[test]
    fn save_then_get_round_trips() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);
        let mut settings = Settings::default();
        settings.max_concurrent = 5;
        manager.save_settings(&settings).unwrap();
        let loaded = manager.get_settings().unwrap();
        assert_eq!(loaded.max_concurrent, 5);
    }

    #[test]
    fn check_interval_clamps_to_range() {
        let mut settings = Settings::default();
        settings.subscription_check_interval_hours = 48;
        assert_eq!(settings.effective_check_interval_hours(), 24);
        settings.subscription_check_interval_hours = 0;
        assert_eq!(settings.effective_check_interval_hours(), 1);
    }
}
