//! Crate-wide error taxonomy.
//!
//! Every module returns `Result<T, VidBeeError>`; `anyhow::Result` is used
//! only at the host-binary boundary in `main.rs`, the same split the teacher
//! draws between its inner `YtDlpError`/`DownloadError` types and the
//! `anyhow::Result` its Tauri command handlers return.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VidBeeError {
    #[error("extractor binary not found: {0}")]
    ExtractorNotFound(String),

    #[error("extractor exited with code {exit_code:?}: {stderr}")]
    Extractor {
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("parse error in {where_}: {message}")]
    Parse { where_: String, message: String },

    #[error("a job with id {0} is already active")]
    QueueDuplicateId(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("feed error: {cause}")]
    Feed { cause: String },

    #[error("token error: {0}")]
    Token(#[from] TokenError),
}

/// LoopbackBridge single-use-token failure modes (§7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token missing")]
    Missing,
    #[error("token invalid")]
    Invalid,
}

impl From<rusqlite::Error> for VidBeeError {
    fn from(e: rusqlite::Error) -> Self {
        VidBeeError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for VidBeeError {
    fn from(e: std::io::Error) -> Self {
        VidBeeError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VidBeeError>;
