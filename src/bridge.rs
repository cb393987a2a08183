//! LoopbackBridge: a loopback-only HTTP server handing the browser extension
//! single-use tokens and a thin `/video-info` delegate into the engine.
//!
//! No teacher counterpart — built on `axum` + `tower_http::cors::CorsLayer`,
//! grounded in `other_examples/manifests/Developer-Geekay-yt-agent`'s
//! axum-based yt-dlp HTTP agent shape.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::engine::DownloadEngine;
use crate::error::TokenError;

const PORT_RANGE_START: u16 = 27100;
const PORT_RANGE_END: u16 = 27120;
const TOKEN_TTL: Duration = Duration::from_secs(60);

struct TokenEntry {
    expires_at: Instant,
}

struct BridgeState {
    engine: Arc<DownloadEngine>,
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

pub struct LoopbackBridge {
    pub bound_port: u16,
}

impl LoopbackBridge {
    /// Tries ports in `27100..=27120`, keeping the first one that binds, and
    /// spawns the server on it.
    pub async fn start(engine: Arc<DownloadEngine>) -> crate::error::Result<Self> {
        let state = Arc::new(BridgeState {
            engine,
            tokens: Mutex::new(HashMap::new()),
        });

        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_static("*"))
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        let app = Router::new()
            .route("/status", get(status_handler))
            .route("/token", get(token_handler))
            .route("/video-info", get(video_info_handler))
            .layer(cors)
            .with_state(state);

        for port in PORT_RANGE_START..=PORT_RANGE_END {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    log::info!("loopback bridge bound to {addr}");
                    let app = app.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                                .await
                        {
                            log::error!("loopback bridge server error: {e}");
                        }
                    });
                    return Ok(Self { bound_port: port });
                }
                Err(_) => continue,
            }
        }

        Err(crate::error::VidBeeError::Persistence(format!(
            "no free port in {PORT_RANGE_START}..={PORT_RANGE_END} for the loopback bridge"
        )))
    }
}

fn is_loopback_peer(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or(false),
    }
}

async fn status_handler(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !is_loopback_peer(&peer) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response();
    }
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    #[serde(rename = "expiresInMs")]
    expires_in_ms: u64,
}

async fn token_handler(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    if !is_loopback_peer(&peer) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response();
    }

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    state.tokens.lock().await.insert(
        token.clone(),
        TokenEntry {
            expires_at: Instant::now() + TOKEN_TTL,
        },
    );

    (
        StatusCode::OK,
        Json(TokenResponse {
            token,
            expires_in_ms: TOKEN_TTL.as_millis() as u64,
        }),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
struct VideoInfoQuery {
    url: Option<String>,
    token: Option<String>,
}

async fn video_info_handler(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<VideoInfoQuery>,
) -> impl IntoResponse {
    if !is_loopback_peer(&peer) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response();
    }

    if let Err(e) = state.consume_token(query.token.as_deref()).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": e.to_string()}))).into_response();
    }

    let Some(url) = query.url else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing url"}))).into_response();
    };

    let settings = state.engine.current_settings().await;
    match state.engine_info(&url, &settings).await {
        Ok(info) => (
            StatusCode::OK,
            Json(json!({
                "title": info.title,
                "thumbnail": info.thumbnail,
                "duration": info.duration,
                "formats": info.formats,
            })),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

impl BridgeState {
    /// Validates and consumes a single-use token per the `TokenError` taxonomy
    /// entry in §7: missing, unknown/invalid, or expired are distinguished so
    /// callers can report a precise reason.
    async fn consume_token(&self, token: Option<&str>) -> Result<(), TokenError> {
        let token = token.ok_or(TokenError::Missing)?;
        let mut tokens = self.tokens.lock().await;
        match tokens.remove(token) {
            Some(entry) if entry.expires_at >= Instant::now() => Ok(()),
            Some(_) => Err(TokenError::Expired),
            None => Err(TokenError::Invalid),
        }
    }

    async fn engine_info(
        &self,
        url: &str,
        settings: &crate::settings::Settings,
    ) -> crate::error::Result<crate::models::VideoInfo> {
        self.engine.fetch_info(url, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_and_mapped_v6_are_recognized() {
        let v4: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(is_loopback_peer(&v4));

        let mapped: SocketAddr = "[::ffff:127.0.0.1]:9000".parse().unwrap();
        assert!(is_loopback_peer(&mapped));

        let external: SocketAddr = "93.184.216.34:9000".parse().unwrap();
        assert!(!is_loopback_peer(&external));
    }
}
