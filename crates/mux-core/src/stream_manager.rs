//! Stream manager: owns the transcoder lifecycle, serializes `start`,
//! `switch`, and `stop`, and drives crash recovery.
//!
//! The key property the transition protocol buys is clean segment
//! boundaries: wait for the in-flight segment to finish writing, stop the
//! transcoder, mark the discontinuity, and only then launch the
//! replacement. Killing mid-segment would leave a short, truncated `.ts`
//! file that breaks playback at the seam.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::MuxConfig;
use crate::playhead::{PlayheadEvent, PlayheadSink};
use crate::segment_store::SegmentStore;
use crate::transcoder::{detect_source_info, TranscoderRunner};

const RECOVERY_BACKOFF_BASE: f64 = 2.0;
const RECOVERY_BACKOFF_MAX: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Switching,
    Stopping,
}

/// Computes the recovery backoff for the `attempt`-th consecutive failure
/// (1-indexed), per `min(BASE * 2^(attempt-1), CAP)`.
pub fn recovery_backoff(attempt: u32) -> Duration {
    let secs = (RECOVERY_BACKOFF_BASE * 2f64.powi(attempt as i32 - 1)).min(RECOVERY_BACKOFF_MAX);
    Duration::from_secs_f64(secs)
}

struct Inner {
    state: StreamState,
    current_url: Option<String>,
    transcoder: Option<TranscoderRunner>,
}

pub struct StreamManager {
    config: Arc<MuxConfig>,
    store: Arc<SegmentStore>,
    inner: Mutex<Inner>,
    recovery_attempts: AtomicU32,
    shutdown: CancellationToken,
}

impl StreamManager {
    pub fn new(config: Arc<MuxConfig>, store: Arc<SegmentStore>) -> Self {
        StreamManager {
            config,
            store,
            inner: Mutex::new(Inner {
                state: StreamState::Idle,
                current_url: None,
                transcoder: None,
            }),
            recovery_attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state
    }

    pub async fn current_url(&self) -> Option<String> {
        self.inner.lock().await.current_url.clone()
    }

    fn new_runner(&self) -> TranscoderRunner {
        TranscoderRunner::new(Arc::clone(&self.config), Arc::clone(&self.store) as _)
    }

    pub async fn start(&self, url: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner, url).await
    }

    async fn start_locked(&self, inner: &mut Inner, url: &str) -> bool {
        if !matches!(inner.state, StreamState::Idle | StreamState::Stopping) {
            tracing::warn!(state = ?inner.state, "cannot start in current state");
            return false;
        }

        inner.state = StreamState::Starting;
        tracing::info!(url, "starting stream");

        let start_seq = self.store.next_sequence().await;
        let runner = self.new_runner();

        let spawned = runner.start(url, start_seq).await;
        if !spawned {
            inner.state = StreamState::Idle;
            return false;
        }

        let has_segment = runner.wait_for_segment(self.config.transition_timeout).await;
        if has_segment {
            if let Some(info) = detect_source_info(&self.config, url).await {
                self.store.set_source_info(info.width, info.height, info.bitrate).await;
            }
            inner.transcoder = Some(runner);
            inner.current_url = Some(url.to_string());
            inner.state = StreamState::Running;
            self.recovery_attempts.store(0, Ordering::SeqCst);
            tracing::info!("stream started successfully");
            true
        } else {
            tracing::error!("no segment produced within timeout");
            runner.stop(Duration::from_secs(5)).await;
            inner.state = StreamState::Idle;
            false
        }
    }

    pub async fn switch(&self, new_url: &str) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state == StreamState::Idle {
            return self.start_locked(&mut inner, new_url).await;
        }

        if inner.state != StreamState::Running {
            tracing::warn!(state = ?inner.state, "cannot switch in current state");
            return false;
        }

        if inner.current_url.as_deref() == Some(new_url) {
            tracing::debug!("same url, no switch needed");
            return true;
        }

        inner.state = StreamState::Switching;
        tracing::info!(url = new_url, "switching stream");

        if let Some(runner) = inner.transcoder.as_ref() {
            if runner.is_running().await {
                let drain_timeout =
                    Duration::from_secs(u64::from(self.config.segment_time_secs) + 2);
                if runner.wait_for_segment(drain_timeout).await {
                    tracing::debug!("segment completed, stopping transcoder cleanly");
                } else {
                    tracing::warn!("timed out waiting for segment to complete, stopping anyway");
                }
            }
        }

        if let Some(runner) = inner.transcoder.take() {
            runner.stop(Duration::from_secs(5)).await;
        }

        self.store.mark_discontinuity().await;
        let next_seq = self.store.next_sequence().await;

        let runner = self.new_runner();
        if !runner.start(new_url, next_seq).await {
            tracing::error!("failed to start new transcoder");
            inner.state = StreamState::Idle;
            return false;
        }

        let has_segment = runner.wait_for_segment(self.config.transition_timeout).await;
        if has_segment {
            if let Some(info) = detect_source_info(&self.config, new_url).await {
                self.store.set_source_info(info.width, info.height, info.bitrate).await;
            }
            inner.transcoder = Some(runner);
            inner.current_url = Some(new_url.to_string());
            inner.state = StreamState::Running;
            self.recovery_attempts.store(0, Ordering::SeqCst);
            tracing::info!("stream switch completed successfully");
            true
        } else {
            tracing::error!("new stream did not produce segment in time");
            runner.stop(Duration::from_secs(5)).await;
            inner.state = StreamState::Idle;
            false
        }
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == StreamState::Idle {
            return;
        }
        inner.state = StreamState::Stopping;
        self.shutdown.cancel();
        tracing::info!("stopping stream");

        if let Some(runner) = inner.transcoder.take() {
            runner.stop(Duration::from_secs(5)).await;
        }
        inner.current_url = None;
        inner.state = StreamState::Idle;
        tracing::info!("stream stopped");
    }

    /// Background loop: poll once a second for an unexpectedly-exited
    /// transcoder while `Running`, and recover it with exponential backoff.
    pub async fn run_recovery_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            self.check_and_recover().await;
        }
    }

    async fn check_and_recover(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != StreamState::Running {
            return;
        }
        let Some(runner) = inner.transcoder.as_ref() else {
            return;
        };
        if runner.is_running().await {
            return;
        }

        let exit_code = runner.wait().await;
        tracing::warn!(?exit_code, "transcoder exited unexpectedly");

        let Some(url) = inner.current_url.clone() else {
            inner.state = StreamState::Idle;
            return;
        };

        let attempt = self.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let backoff = recovery_backoff(attempt);
        tracing::info!(attempt, backoff_secs = backoff.as_secs_f64(), "attempting crash recovery");

        // Release the lock while sleeping: holding the manager's mutex
        // across this wait would block every other caller (switch/stop) for
        // up to RECOVERY_BACKOFF_MAX seconds.
        drop(inner);
        tokio::time::sleep(backoff).await;
        let mut inner = self.inner.lock().await;

        if inner.state != StreamState::Running {
            return;
        }

        self.store.mark_discontinuity().await;
        let next_seq = self.store.next_sequence().await;

        let runner = self.new_runner();
        if runner.start(&url, next_seq).await {
            if runner.wait_for_segment(self.config.transition_timeout).await {
                if let Some(info) = detect_source_info(&self.config, &url).await {
                    self.store.set_source_info(info.width, info.height, info.bitrate).await;
                }
                tracing::info!("crash recovery successful");
                self.recovery_attempts.store(0, Ordering::SeqCst);
                inner.transcoder = Some(runner);
            } else {
                tracing::error!("crash recovery: no segment produced");
                runner.stop(Duration::from_secs(5)).await;
                // Leave state at Running so the loop retries on the next tick.
            }
        } else {
            tracing::error!("crash recovery: failed to start transcoder");
        }
    }
}

/// Bridges the playhead monitor to the stream manager. `on_change` awaits
/// `switch` directly rather than spawning it, so the monitor's own serial
/// consume loop is what serializes concurrent playhead events — see
/// `playhead::PlayheadSink`.
pub struct PlayheadSwitchSink {
    stream_manager: Arc<StreamManager>,
}

impl PlayheadSwitchSink {
    pub fn new(stream_manager: Arc<StreamManager>) -> Self {
        PlayheadSwitchSink { stream_manager }
    }
}

#[async_trait::async_trait]
impl PlayheadSink for PlayheadSwitchSink {
    async fn on_change(&self, event: PlayheadEvent) {
        self.stream_manager.switch(&event.url).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_formula() {
        assert_eq!(recovery_backoff(1), Duration::from_secs_f64(2.0));
        assert_eq!(recovery_backoff(2), Duration::from_secs_f64(4.0));
        assert_eq!(recovery_backoff(3), Duration::from_secs_f64(8.0));
        assert_eq!(recovery_backoff(6), Duration::from_secs_f64(60.0));
        assert_eq!(recovery_backoff(10), Duration::from_secs_f64(60.0));
    }
}
