//! Transcoder runner: wraps one `ffmpeg` child process, watches its output
//! directory for new segments, and drains its stderr.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{IcecastAudioFormat, MuxConfig, MuxMode};
use crate::error::MuxError;
use crate::segment::{parse_segment_sequence, SourceInfo};

/// Receives segments detected by a transcoder runner's watcher task.
///
/// Replaces the source's `on_segment` constructor callback with a named
/// interface; `SegmentStore` implements it directly.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    async fn on_segment(&self, variant: usize, filename: &str, duration: f64);
}

#[async_trait]
impl SegmentSink for crate::segment_store::SegmentStore {
    async fn on_segment(&self, variant: usize, filename: &str, duration: f64) {
        self.add_segment(variant, filename, duration).await;
    }
}

fn icecast_output_args(config: &MuxConfig) -> Vec<String> {
    let ic = &config.icecast;
    if !ic.enabled {
        return Vec::new();
    }
    let url = format!(
        "icecast://source:{}@{}:{}{}",
        ic.source_password, ic.host, ic.port, ic.mount
    );
    match ic.audio_format {
        IcecastAudioFormat::Aac => vec![
            "-map".into(),
            "0:a".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            ic.audio_bitrate.clone(),
            "-f".into(),
            "adts".into(),
            "-content_type".into(),
            "audio/aac".into(),
            url,
        ],
        IcecastAudioFormat::Mp3 => vec![
            "-map".into(),
            "0:a".into(),
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            ic.audio_bitrate.clone(),
            "-f".into(),
            "mp3".into(),
            "-content_type".into(),
            "audio/mpeg".into(),
            url,
        ],
    }
}

/// Swaps a `...ffmpeg` binary name/path for its `ffprobe` sibling. Falls
/// back to a bare `ffprobe` lookup on `PATH` when the configured binary
/// doesn't follow that naming convention.
fn ffprobe_binary(config: &MuxConfig) -> String {
    match config.transcoder_binary.strip_suffix("ffmpeg") {
        Some(prefix) => format!("{prefix}ffprobe"),
        None => "ffprobe".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    bit_rate: Option<String>,
}

/// Probes `input_url`'s negotiated video stream parameters via `ffprobe`, for
/// the master playlist's variant-0 `STREAM-INF` line. Returns `None` on any
/// probe or parse failure, leaving the store's previous source info in place.
pub async fn detect_source_info(config: &MuxConfig, input_url: &str) -> Option<SourceInfo> {
    let probe_bin = ffprobe_binary(config);
    let output = process_utils::tokio_command(&probe_bin)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-select_streams",
            "v:0",
            input_url,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            tracing::warn!(status = ?o.status.code(), "ffprobe exited with error, keeping previous source info");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to run ffprobe, keeping previous source info");
            return None;
        }
    };

    let parsed: FfprobeOutput = match serde_json::from_slice(&output.stdout) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse ffprobe output, keeping previous source info");
            return None;
        }
    };

    let stream = parsed
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))?;

    let width = stream.width.unwrap_or(1920);
    let height = stream.height.unwrap_or(1080);
    let bitrate_bps = stream
        .bit_rate
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|f| f.bit_rate.as_deref())
                .and_then(|s| s.parse::<u64>().ok())
        })
        .unwrap_or(8_000_000);

    Some(SourceInfo {
        width,
        height,
        bitrate: (bitrate_bps / 1000) as u32,
    })
}

fn build_copy_args(config: &MuxConfig, input_url: &str, start_number: u64) -> Vec<String> {
    let output_dir = config.output_dir.display();
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-re".into(),
        "-i".into(),
        input_url.to_string(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        config.segment_time_secs.to_string(),
        "-hls_list_size".into(),
        config.list_size.to_string(),
        "-hls_flags".into(),
        "append_list+omit_endlist".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-start_number".into(),
        start_number.to_string(),
        "-hls_segment_filename".into(),
        format!("{output_dir}/segment_%05d.ts"),
        format!("{output_dir}/stream.m3u8"),
    ];
    args.extend(icecast_output_args(config));
    args
}

fn build_abr_args(config: &MuxConfig, input_url: &str, start_number: u64) -> Vec<String> {
    let num_variants = config.abr_variants.len();
    let total_streams = num_variants + 1;
    let output_dir = config.output_dir.display();

    let split_outputs: String = (0..num_variants).map(|i| format!("[v_{i}_in]")).collect();
    let mut filter_parts = vec![format!("[0:v]split={num_variants}{split_outputs}")];
    for (i, variant) in config.abr_variants.iter().enumerate() {
        let h = variant.height;
        filter_parts.push(format!(
            "[v_{i}_in]scale=w=-2:h='min({h},ih)':force_original_aspect_ratio=decrease[v_{i}]"
        ));
    }
    let filter_complex = filter_parts.join("; ");

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-re".into(),
        "-i".into(),
        input_url.to_string(),
        "-filter_complex".into(),
        filter_complex,
        "-map".into(),
        "0:v".into(),
        "-c:v:0".into(),
        "copy".into(),
        "-map".into(),
        "0:a".into(),
        "-c:a:0".into(),
        "copy".into(),
    ];

    for (i, variant) in config.abr_variants.iter().enumerate() {
        let idx = i + 1;
        let video_kbps = crate::config::parse_bitrate(&variant.video_bitrate, 1000);
        let maxrate = format!("{}k", (video_kbps as f64 * 1.07) as u32);
        let bufsize = format!("{}k", (video_kbps as f64 * 1.5) as u32);

        args.extend([
            "-map".into(),
            format!("[v_{i}]"),
            format!("-c:v:{idx}"),
            "libx264".into(),
            "-preset".into(),
            config.abr_preset.clone(),
            format!("-b:v:{idx}"),
            variant.video_bitrate.clone(),
            format!("-maxrate:v:{idx}"),
            maxrate,
            format!("-bufsize:v:{idx}"),
            bufsize,
            format!("-g:v:{idx}"),
            config.abr_gop_size.to_string(),
            format!("-sc_threshold:v:{idx}"),
            "0".into(),
            "-map".into(),
            "0:a".into(),
            format!("-c:a:{idx}"),
            "aac".into(),
            format!("-b:a:{idx}"),
            variant.audio_bitrate.clone(),
            format!("-ac:a:{idx}"),
            "2".into(),
        ]);
    }

    let var_stream_map = (0..total_streams)
        .map(|i| format!("v:{i},a:{i}"))
        .collect::<Vec<_>>()
        .join(" ");

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        config.segment_time_secs.to_string(),
        "-hls_list_size".into(),
        config.list_size.to_string(),
        "-hls_flags".into(),
        "independent_segments+append_list+omit_endlist".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-start_number".into(),
        start_number.to_string(),
        "-hls_segment_filename".into(),
        format!("{output_dir}/stream_%v/segment_%05d.ts"),
        "-master_pl_name".into(),
        "stream.m3u8".into(),
        "-var_stream_map".into(),
        var_stream_map,
        format!("{output_dir}/stream_%v/playlist.m3u8"),
    ]);

    args.extend(icecast_output_args(config));
    args
}

/// Build the transcoder argument vector for the configured mux mode.
pub fn build_args(config: &MuxConfig, input_url: &str, start_number: u64) -> Vec<String> {
    match config.mode {
        MuxMode::Abr => build_abr_args(config, input_url, start_number),
        MuxMode::Copy => build_copy_args(config, input_url, start_number),
    }
}

/// Poll `path`'s size twice, `check_delay` apart, up to `max_attempts`
/// times; the file is "stable" once two consecutive reads agree on a
/// non-zero size. Proceeds (returns `true`) after the attempt budget if the
/// file exists and is non-empty, to tolerate slow-but-valid writers.
async fn wait_for_stable_file(path: &Path, check_delay: Duration, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        let Ok(meta1) = tokio::fs::metadata(path).await else {
            return false;
        };
        let size1 = meta1.len();
        tokio::time::sleep(check_delay).await;
        let Ok(meta2) = tokio::fs::metadata(path).await else {
            return false;
        };
        let size2 = meta2.len();
        if size1 == size2 && size1 > 0 {
            return true;
        }
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => true,
        _ => false,
    }
}

struct RunState {
    child: Child,
    stdin: Option<ChildStdin>,
    cancel: tokio_util::sync::CancellationToken,
    watcher: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

pub struct TranscoderRunner {
    config: Arc<MuxConfig>,
    sink: Arc<dyn SegmentSink>,
    state: Mutex<Option<RunState>>,
    segments_seen: Arc<AtomicU64>,
    start_baseline: AtomicU64,
    running: AtomicBool,
}

impl TranscoderRunner {
    pub fn new(config: Arc<MuxConfig>, sink: Arc<dyn SegmentSink>) -> Self {
        TranscoderRunner {
            config,
            sink,
            state: Mutex::new(None),
            segments_seen: Arc::new(AtomicU64::new(0)),
            start_baseline: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    fn variant_dir(&self, variant: usize) -> PathBuf {
        match self.config.mode {
            MuxMode::Copy => self.config.output_dir.clone(),
            MuxMode::Abr => self.config.output_dir.join(format!("stream_{variant}")),
        }
    }

    fn scan_existing_segments(&self) -> HashSet<PathBuf> {
        let mut seen = HashSet::new();
        for variant in 0..self.config.num_variants() {
            let dir = self.variant_dir(variant);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("segment_") && n.ends_with(".ts"))
                {
                    seen.insert(path);
                }
            }
        }
        seen
    }

    pub async fn start(&self, url: &str, start_number: u64) -> bool {
        if self.running.load(Ordering::SeqCst) {
            tracing::warn!("transcoder already running, stopping first");
            self.stop(Duration::from_secs(5)).await;
        }

        let known = self.scan_existing_segments();
        self.start_baseline
            .store(self.segments_seen.load(Ordering::SeqCst), Ordering::SeqCst);

        let args = build_args(&self.config, url, start_number);
        tracing::info!(mode = ?self.config.mode, start_number, "starting transcoder");

        let mut cmd = process_utils::tokio_command(&self.config.transcoder_binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let err = MuxError::TranscoderSpawn {
                    path: self.config.transcoder_binary.clone(),
                    source: e,
                };
                tracing::error!(error = %err, "failed to spawn transcoder");
                return false;
            }
        };

        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let cancel = tokio_util::sync::CancellationToken::new();

        let stderr_handle = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::debug!(target: "transcoder", "{line}");
                }
            }
        });

        let watcher_handle = {
            let config = Arc::clone(&self.config);
            let sink = Arc::clone(&self.sink);
            let segments_seen = Arc::clone(&self.segments_seen);
            let cancel = cancel.clone();
            let num_variants = config.num_variants();
            tokio::spawn(async move {
                let mut known = known;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }

                    for variant in 0..num_variants {
                        let dir = match config.mode {
                            MuxMode::Copy => config.output_dir.clone(),
                            MuxMode::Abr => config.output_dir.join(format!("stream_{variant}")),
                        };
                        let Ok(entries) = std::fs::read_dir(&dir) else {
                            continue;
                        };
                        for entry in entries.flatten() {
                            let path = entry.path();
                            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                                continue;
                            };
                            if !(name.starts_with("segment_") && name.ends_with(".ts")) {
                                continue;
                            }
                            if known.contains(&path) {
                                continue;
                            }
                            if !wait_for_stable_file(&path, config.segment_stability_delay, 10).await
                            {
                                continue;
                            }
                            known.insert(path.clone());
                            if parse_segment_sequence(name).is_some() {
                                let duration = f64::from(config.segment_time_secs);
                                sink.on_segment(variant, name, duration).await;
                                segments_seen.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            })
        };

        let mut state = self.state.lock().await;
        *state = Some(RunState {
            child,
            stdin,
            cancel,
            watcher: watcher_handle,
            stderr: stderr_handle,
        });
        drop(state);

        self.running.store(true, Ordering::SeqCst);
        true
    }

    pub async fn stop(&self, graceful_timeout: Duration) -> Option<i32> {
        self.running.store(false, Ordering::SeqCst);
        let mut guard = self.state.lock().await;
        let Some(mut run) = guard.take() else {
            return None;
        };
        drop(guard);

        run.cancel.cancel();
        let _ = run.watcher.await;

        let exit_code = match run.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => {
                tracing::info!("stopping transcoder");
                // Ask ffmpeg to quit cleanly (closes the HLS muxer, finishing
                // the current segment) before resorting to a kill.
                if let Some(mut stdin) = run.stdin.take() {
                    let _ = stdin.write_all(b"q").await;
                    let _ = stdin.shutdown().await;
                }
                match tokio::time::timeout(graceful_timeout, run.child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    _ => {
                        tracing::warn!("transcoder did not terminate, killing");
                        let _ = run.child.start_kill();
                        run.child.wait().await.ok().and_then(|s| s.code())
                    }
                }
            }
        };

        let _ = run.stderr.await;
        tracing::info!(exit_code, "transcoder stopped");
        exit_code
    }

    pub async fn wait_for_segment(&self, timeout: Duration) -> bool {
        let start_count = self.start_baseline.load(Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.segments_seen.load(Ordering::SeqCst) > start_count {
                return true;
            }
            if !self.is_running().await {
                return false;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(run) => matches!(run.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn wait(&self) -> Option<i32> {
        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(run) => run.child.wait().await.ok().and_then(|s| s.code()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbrVariant, IcecastAudioFormat, IcecastConfig};

    fn test_config(mode: MuxMode) -> MuxConfig {
        MuxConfig {
            api_url: "http://api:8080".into(),
            output_dir: std::env::temp_dir(),
            segment_time_secs: 4,
            list_size: 20,
            mode,
            abr_variants: vec![AbrVariant {
                height: 720,
                video_bitrate: "2800k".into(),
                audio_bitrate: "128k".into(),
            }],
            abr_preset: "veryfast".into(),
            abr_gop_size: 48,
            transcoder_binary: "ffmpeg".into(),
            icecast: IcecastConfig {
                enabled: false,
                host: "icecast".into(),
                port: 8000,
                source_password: "hackme".into(),
                mount: "/stream.mp3".into(),
                audio_bitrate: "128k".into(),
                audio_format: IcecastAudioFormat::Mp3,
            },
            transition_timeout: Duration::from_secs_f64(15.0),
            segment_stability_delay: Duration::from_millis(100),
            server_port: 8091,
            server_bind_address: "0.0.0.0".into(),
            restreamer_internal_url: None,
            restreamer_public_host: None,
        }
    }

    #[test]
    fn copy_args_contain_required_flags() {
        let config = test_config(MuxMode::Copy);
        let args = build_args(&config, "rtmp://src", 7);
        assert!(args.windows(2).any(|w| w == ["-start_number", "7"]));
        assert!(args.windows(2).any(|w| w == ["-hls_time", "4"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-hls_flags", "append_list+omit_endlist"]));
        assert!(args.iter().any(|a| a == "-re"));
    }

    #[test]
    fn abr_args_build_filter_graph_and_var_stream_map() {
        let config = test_config(MuxMode::Abr);
        let args = build_args(&config, "rtmp://src", 0);
        assert!(args.iter().any(|a| a.contains("split=1")));
        assert!(args.iter().any(|a| a == "v:0,a:0 v:1,a:1"));
        assert!(args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn icecast_output_appended_when_enabled() {
        let mut config = test_config(MuxMode::Copy);
        config.icecast.enabled = true;
        let args = build_args(&config, "rtmp://src", 0);
        assert!(args.iter().any(|a| a.starts_with("icecast://")));
    }

    #[tokio::test]
    async fn stable_file_detection_waits_for_size_to_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_00000.ts");
        std::fs::write(&path, b"partial").unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&writer_path, b"partial-more-bytes").unwrap();
        });

        let stable = wait_for_stable_file(&path, Duration::from_millis(20), 10).await;
        assert!(stable);
    }

    #[tokio::test]
    async fn stable_file_detection_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_00000.ts");
        let stable = wait_for_stable_file(&path, Duration::from_millis(10), 3).await;
        assert!(!stable);
    }
}
