//! Playhead monitor: watches the upstream API's server-sent-events feed for
//! playhead changes and notifies a callback whenever the active stream URL
//! changes.
//!
//! The feed carries more than stream-url changes; lines that don't parse as
//! JSON, or parse but carry an empty/missing `head`, are ignored rather than
//! treated as errors — a transient malformed line should never take the
//! monitor down.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::MuxConfig;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_LOG_EVERY: u32 = 6; // 6 * 5s = 30s
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct PlayheadEvent {
    pub url: String,
    pub name: String,
}

/// Receives playhead changes. `on_change` is awaited by the monitor's own
/// consumer loop before the next line is read, so two calls never overlap —
/// callers needing to reach the stream manager should call it directly
/// (see `stream_manager::PlayheadSwitchSink`) rather than spawning a
/// detached task, which would let a burst of events race each other.
#[async_trait::async_trait]
pub trait PlayheadSink: Send + Sync {
    async fn on_change(&self, event: PlayheadEvent);
}

pub struct PlayheadMonitor {
    config: Arc<MuxConfig>,
    client: reqwest::Client,
    current_url: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl PlayheadMonitor {
    pub fn new(config: Arc<MuxConfig>) -> Self {
        PlayheadMonitor {
            config,
            client: reqwest::Client::new(),
            current_url: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn current_url(&self) -> Option<String> {
        self.current_url.lock().await.clone()
    }

    /// Blocks until `{api_url}/health` responds successfully, polling every
    /// five seconds and logging a waiting message every thirty.
    pub async fn wait_for_api(&self) {
        let url = format!("{}/health", self.config.api_url);
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!("api is available");
                    return;
                }
                _ => {}
            }
            attempts += 1;
            if attempts % HEALTH_LOG_EVERY == 0 {
                tracing::info!(url, "still waiting for api to become available");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
            }
        }
    }

    /// Runs until `stop()` is called: waits for the API, then consumes the
    /// SSE feed, reconnecting with a fixed delay on any error.
    pub async fn run(&self, sink: Arc<dyn PlayheadSink>) {
        self.wait_for_api().await;

        while !self.cancel.is_cancelled() {
            if let Err(err) = self.consume_sse(&sink).await {
                tracing::warn!(error = %err, "playhead event stream disconnected, reconnecting");
            }
            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn consume_sse(&self, sink: &Arc<dyn PlayheadSink>) -> crate::error::MuxResult<()> {
        let url = format!("{}/events", self.config.api_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::MuxError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].trim_end_matches('\r').to_string();
                buf.drain(..=idx);
                self.handle_line(&line, sink).await;
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str, sink: &Arc<dyn PlayheadSink>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with("event:") {
            return;
        }
        let Some(payload) = line.strip_prefix("data: ") else {
            return;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return;
        };

        let Some(head) = value.get("head").and_then(|v| v.as_str()) else {
            return;
        };
        if head.is_empty() {
            return;
        }
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let rewritten = self.config.rewrite_stream_url(head);

        let mut current = self.current_url.lock().await;
        if current.as_deref() == Some(rewritten.as_str()) {
            return;
        }
        *current = Some(rewritten.clone());
        drop(current);

        tracing::info!(url = %rewritten, name, "playhead changed");
        sink.on_change(PlayheadEvent { url: rewritten, name }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Arc<MuxConfig> {
        Arc::new(MuxConfig {
            api_url: "http://127.0.0.1:0".into(),
            output_dir: PathBuf::from("/tmp/hls"),
            segment_time_secs: 4,
            list_size: 20,
            mode: crate::config::MuxMode::Copy,
            abr_variants: Vec::new(),
            abr_preset: "veryfast".into(),
            abr_gop_size: 48,
            transcoder_binary: "ffmpeg".into(),
            icecast: crate::config::IcecastConfig {
                enabled: false,
                host: "icecast".into(),
                port: 8000,
                source_password: "hackme".into(),
                mount: "/stream.mp3".into(),
                audio_bitrate: "128k".into(),
                audio_format: crate::config::IcecastAudioFormat::Mp3,
            },
            transition_timeout: Duration::from_secs_f64(15.0),
            segment_stability_delay: Duration::from_secs_f64(0.1),
            server_port: 8091,
            server_bind_address: "0.0.0.0".into(),
            restreamer_internal_url: None,
            restreamer_public_host: None,
        })
    }

    struct CountingSink {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PlayheadSink for CountingSink {
        async fn on_change(&self, _event: PlayheadEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ignores_malformed_and_empty_lines() {
        let monitor = PlayheadMonitor::new(test_config());
        let sink: Arc<dyn PlayheadSink> = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });

        monitor.handle_line("", &sink).await;
        monitor.handle_line("event: ping", &sink).await;
        monitor.handle_line("data: not json", &sink).await;
        monitor.handle_line(r#"data: {"head": ""}"#, &sink).await;
        monitor.handle_line(r#"data: {"no_head": true}"#, &sink).await;

        assert_eq!(monitor.current_url().await, None);
    }

    #[tokio::test]
    async fn dedups_repeated_url_and_defaults_name() {
        let monitor = PlayheadMonitor::new(test_config());
        let sink: Arc<dyn PlayheadSink> = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });

        monitor
            .handle_line(r#"data: {"head": "http://a/stream.m3u8"}"#, &sink)
            .await;
        monitor
            .handle_line(r#"data: {"head": "http://a/stream.m3u8"}"#, &sink)
            .await;
        monitor
            .handle_line(r#"data: {"head": "http://b/stream.m3u8", "name": "b"}"#, &sink)
            .await;

        assert_eq!(
            monitor.current_url().await,
            Some("http://b/stream.m3u8".to_string())
        );
    }

    #[tokio::test]
    async fn rewrites_url_before_dedup() {
        let mut cfg = (*test_config()).clone();
        cfg.restreamer_public_host = Some("public.example.com".to_string());
        cfg.restreamer_internal_url = Some("http://restreamer:8080".to_string());
        let monitor = PlayheadMonitor::new(Arc::new(cfg));
        let sink: Arc<dyn PlayheadSink> = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });

        monitor
            .handle_line(
                r#"data: {"head": "https://public.example.com/live/a.m3u8"}"#,
                &sink,
            )
            .await;

        assert_eq!(
            monitor.current_url().await,
            Some("http://restreamer:8080/live/a.m3u8".to_string())
        );
    }
}
