//! File server: serves the live HLS playlists and segments, plus a health
//! check. Playlists are rendered on the fly from the segment store; segments
//! are read straight off disk.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use mux_core::{MuxConfig, SegmentStore, StreamManager};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SegmentStore>,
    pub stream_manager: Arc<StreamManager>,
    pub config: Arc<MuxConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/live/stream.m3u8", get(master_playlist))
        .route("/live/{*path}", get(serve_live_path))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn master_playlist(State(state): State<AppState>) -> Response {
    let body = state.store.generate_master_playlist().await;
    playlist_response(body)
}

fn playlist_response(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

/// Parses `stream_<N>/playlist.m3u8`, returning the variant index.
fn parse_variant_playlist_path(path: &str) -> Option<usize> {
    let rest = path.strip_prefix("stream_")?;
    let (num, tail) = rest.split_once('/')?;
    if tail != "playlist.m3u8" {
        return None;
    }
    num.parse().ok()
}

async fn serve_live_path(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    if path.contains("..") || path.starts_with('/') {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(variant) = parse_variant_playlist_path(&path) {
        let body = state.store.generate_variant_playlist(variant).await;
        return playlist_response(body);
    }

    let file_path = state.config.output_dir.join(&path);

    if !file_path.exists() && path.ends_with(".ts") {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    if !file_path.exists() {
        return StatusCode::NOT_FOUND.into_response();
    }

    serve_file(&file_path, &path).await
}

async fn serve_file(file_path: &PathBuf, name: &str) -> Response {
    let bytes = match tokio::fs::read(file_path).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(path = %file_path.display(), error = %e, "failed to read file");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let (content_type, cache_control) = if name.ends_with(".m3u8") {
        ("application/vnd.apple.mpegurl", "no-cache, no-store, must-revalidate")
    } else if name.ends_with(".ts") {
        ("video/mp2t", "public, max-age=3600, immutable")
    } else {
        ("application/octet-stream", "no-cache")
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache_control),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        bytes,
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let stream_ready = state.config.output_dir.join("stream.m3u8").exists()
        || state.stream_manager.state().await == mux_core::StreamState::Running;
    axum::Json(serde_json::json!({
        "status": "ok",
        "stream_ready": stream_ready,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_variant_playlist_path() {
        assert_eq!(parse_variant_playlist_path("stream_0/playlist.m3u8"), Some(0));
        assert_eq!(parse_variant_playlist_path("stream_12/playlist.m3u8"), Some(12));
        assert_eq!(parse_variant_playlist_path("segment_00001.ts"), None);
        assert_eq!(parse_variant_playlist_path("stream_0/segment_1.ts"), None);
    }
}
