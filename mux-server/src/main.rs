//! mux-server: continuous HLS mux engine.
//!
//! Watches the upstream playhead for the active stream URL, keeps an
//! ffmpeg-based transcoder pointed at it, and serves the resulting HLS
//! playlists and segments over HTTP.

mod http;
mod logging;

use std::sync::Arc;

use mux_core::{MuxConfig, MuxResult, PlayheadMonitor, PlayheadSwitchSink, SegmentStore, StreamManager};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> MuxResult<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").ok();
    let _guard = logging::init(log_dir.as_deref());

    tracing::info!("starting mux-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(MuxConfig::from_env()?);
    std::fs::create_dir_all(&config.output_dir)?;
    tracing::info!(mode = ?config.mode, output_dir = %config.output_dir.display(), "configuration loaded");

    let shutdown = CancellationToken::new();
    logging::spawn_retention_cleanup(log_dir, shutdown.clone());

    let store = Arc::new(SegmentStore::new(&config));
    let stream_manager = Arc::new(StreamManager::new(Arc::clone(&config), Arc::clone(&store)));

    spawn_cleanup_loop(Arc::clone(&store), shutdown.clone());
    spawn_recovery_loop(Arc::clone(&stream_manager), shutdown.clone());
    spawn_playhead_monitor(Arc::clone(&config), Arc::clone(&stream_manager), shutdown.clone());

    let state = http::AppState {
        store,
        stream_manager: Arc::clone(&stream_manager),
        config: Arc::clone(&config),
    };
    let app = http::router(state);

    let addr = format!("{}:{}", config.server_bind_address, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr, "http server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!(error = %e, "http server exited with error");
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    stream_manager.stop().await;
    tracing::info!("mux-server shutdown complete");

    Ok(())
}

fn spawn_cleanup_loop(store: Arc<SegmentStore>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
                    store.cleanup_old_segments().await;
                }
            }
        }
    });
}

fn spawn_recovery_loop(stream_manager: Arc<StreamManager>, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = stream_manager.run_recovery_loop() => {}
        }
    });
}

fn spawn_playhead_monitor(
    config: Arc<MuxConfig>,
    stream_manager: Arc<StreamManager>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let monitor = Arc::new(PlayheadMonitor::new(config));
        let sink: Arc<dyn mux_core::PlayheadSink> =
            Arc::new(PlayheadSwitchSink::new(Arc::clone(&stream_manager)));

        let monitor_for_watch = Arc::clone(&monitor);
        tokio::select! {
            _ = cancel.cancelled() => monitor_for_watch.stop(),
            _ = monitor.run(sink) => {}
        }
    });
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = wait_for_sigterm() => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
