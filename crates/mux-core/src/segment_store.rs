//! The segment store: single source of truth for segment existence,
//! ordering, discontinuity accounting, and playlist rendering.
//!
//! All public operations acquire one exclusive lock. Reads and writes are
//! both infrequent enough (segments arrive every few seconds; playlists are
//! rendered on player poll) that splitting the lock buys nothing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::{MuxConfig, MuxMode};
use crate::segment::{parse_segment_sequence, Segment, SourceInfo};

struct Inner {
    /// variant index -> ordered segment list (oldest first)
    segments: HashMap<usize, Vec<Segment>>,
    next_sequence: u64,
    pending_discontinuity: bool,
    discontinuity_count: u64,
    source_info: SourceInfo,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            segments: HashMap::new(),
            next_sequence: 0,
            pending_discontinuity: false,
            discontinuity_count: 0,
            // Matches the upstream default before the first ffprobe detection lands.
            source_info: SourceInfo {
                width: 1920,
                height: 1080,
                bitrate: 8_000,
            },
        }
    }
}

pub struct SegmentStore {
    inner: Mutex<Inner>,
    output_dir: PathBuf,
    mode: MuxMode,
    list_size: usize,
    max_segments_in_memory: usize,
    max_segment_age: Duration,
    segment_time_secs: u32,
    abr_variant_count: usize,
    abr_bandwidths: Vec<(u32, u32)>, // (height, bandwidth_bps) per transcoded variant, in order
}

impl SegmentStore {
    pub fn new(config: &MuxConfig) -> Self {
        let abr_bandwidths = config
            .abr_variants
            .iter()
            .map(|v| {
                let video_kbps = crate::config::parse_bitrate(&v.video_bitrate, 1000);
                let audio_kbps = crate::config::parse_bitrate(&v.audio_bitrate, 128);
                (v.height, (video_kbps + audio_kbps) * 1000)
            })
            .collect();

        SegmentStore {
            inner: Mutex::new(Inner::default()),
            output_dir: config.output_dir.clone(),
            mode: config.mode,
            list_size: config.list_size as usize,
            max_segments_in_memory: config.max_segments_in_memory(),
            max_segment_age: config.max_segment_age(),
            segment_time_secs: config.segment_time_secs,
            abr_variant_count: config.abr_variants.len(),
            abr_bandwidths,
        }
    }

    fn segment_path(&self, variant: usize, filename: &str) -> PathBuf {
        match self.mode {
            MuxMode::Copy => self.output_dir.join(filename),
            MuxMode::Abr => self.output_dir.join(format!("stream_{variant}")).join(filename),
        }
    }

    pub async fn add_segment(&self, variant: usize, filename: &str, duration: f64) -> Segment {
        let mut inner = self.inner.lock().await;

        let seq = parse_segment_sequence(filename).unwrap_or(inner.next_sequence);
        if seq >= inner.next_sequence {
            inner.next_sequence = seq + 1;
        }

        let existing_at_seq = inner
            .segments
            .values()
            .flatten()
            .find(|s| s.sequence == seq)
            .map(|s| s.discontinuity_before);

        let discontinuity_before = match existing_at_seq {
            Some(flag) => flag,
            None if inner.pending_discontinuity => {
                inner.pending_discontinuity = false;
                tracing::info!(sequence = seq, "discontinuity attached to segment");
                true
            }
            None => false,
        };

        let segment = Segment {
            sequence: seq,
            variant,
            filename: filename.to_string(),
            duration,
            discontinuity_before,
            discontinuity_sequence: inner.discontinuity_count,
            created_at: Instant::now(),
        };

        let list = inner.segments.entry(variant).or_default();
        list.push(segment.clone());

        let mut evicted = Vec::new();
        if list.len() > self.max_segments_in_memory {
            let excess = list.len() - self.max_segments_in_memory;
            evicted.extend(list.drain(0..excess));
        }
        drop(inner);

        for seg in &evicted {
            self.unlink_segment(seg);
        }

        tracing::debug!(
            variant,
            sequence = segment.sequence,
            filename = %segment.filename,
            "segment added"
        );
        segment
    }

    #[cfg(test)]
    async fn variant_len(&self, variant: usize) -> usize {
        self.inner
            .lock()
            .await
            .segments
            .get(&variant)
            .map(Vec::len)
            .unwrap_or(0)
    }

    #[cfg(test)]
    async fn add_segment_with_age(
        &self,
        variant: usize,
        filename: &str,
        duration: f64,
        age: Duration,
    ) -> Segment {
        let segment = self.add_segment(variant, filename, duration).await;
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.segments.get_mut(&variant) {
            if let Some(s) = list.iter_mut().find(|s| s.sequence == segment.sequence) {
                s.created_at = Instant::now() - age;
            }
        }
        segment
    }

    pub async fn mark_discontinuity(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending_discontinuity = true;
        inner.discontinuity_count += 1;
        tracing::info!(count = inner.discontinuity_count, "discontinuity marked");
    }

    pub async fn next_sequence(&self) -> u64 {
        self.inner.lock().await.next_sequence
    }

    pub async fn set_source_info(&self, width: u32, height: u32, bitrate: u32) {
        let mut inner = self.inner.lock().await;
        inner.source_info = SourceInfo {
            width,
            height,
            bitrate,
        };
        tracing::info!(width, height, bitrate, "source info updated");
    }

    fn unlink_segment(&self, segment: &Segment) {
        let path = self.segment_path(segment.variant, &segment.filename);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to unlink segment"),
        }
    }

    pub async fn cleanup_old_segments(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let max_age = self.max_segment_age;
        let mut evicted = Vec::new();

        for list in inner.segments.values_mut() {
            let mut i = 0;
            while i < list.len() {
                if list[i].created_at.elapsed() > max_age {
                    evicted.push(list.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        drop(inner);

        let count = evicted.len();
        for seg in &evicted {
            self.unlink_segment(seg);
        }
        if count > 0 {
            tracing::debug!(count, "cleaned up old segments");
        }
        count
    }

    pub async fn generate_variant_playlist(&self, variant: usize) -> String {
        let inner = self.inner.lock().await;
        self.render_playlist(inner.segments.get(&variant).map(Vec::as_slice).unwrap_or(&[]))
    }

    fn render_playlist(&self, segments: &[Segment]) -> String {
        let window_start = segments.len().saturating_sub(self.list_size);
        let window = &segments[window_start..];

        if window.is_empty() {
            return format!(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n",
                self.segment_time_secs
            );
        }

        let max_duration = window.iter().fold(0.0f64, |acc, s| acc.max(s.duration));
        let target_duration = max_duration.ceil() as u64 + 1;

        let first = &window[0];
        let disc_seq = if first.discontinuity_before {
            first.discontinuity_sequence.saturating_sub(1)
        } else {
            first.discontinuity_sequence
        };

        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:3".to_string(),
            format!("#EXT-X-TARGETDURATION:{target_duration}"),
            format!("#EXT-X-MEDIA-SEQUENCE:{}", first.sequence),
            format!("#EXT-X-DISCONTINUITY-SEQUENCE:{disc_seq}"),
        ];

        for seg in window {
            if seg.discontinuity_before {
                lines.push("#EXT-X-DISCONTINUITY".to_string());
            }
            lines.push(format!("#EXTINF:{:.3},", seg.duration));
            lines.push(seg.filename.clone());
        }

        lines.join("\n") + "\n"
    }

    pub async fn generate_master_playlist(&self) -> String {
        if self.mode == MuxMode::Copy {
            return self.generate_variant_playlist(0).await;
        }

        let source = self.inner.lock().await.source_info;

        let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];

        lines.push(format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}",
            source.bitrate * 1000,
            source.width,
            source.height
        ));
        lines.push("stream_0/playlist.m3u8".to_string());

        let aspect_ratio = if source.height > 0 {
            source.width as f64 / source.height as f64
        } else {
            16.0 / 9.0
        };

        for (i, (height, bandwidth)) in self.abr_bandwidths.iter().enumerate() {
            let mut width = (*height as f64 * aspect_ratio) as u32;
            width -= width % 2;
            lines.push(format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={width}x{height}"
            ));
            lines.push(format!("stream_{}/playlist.m3u8", i + 1));
        }
        debug_assert_eq!(self.abr_bandwidths.len(), self.abr_variant_count);

        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbrVariant, IcecastConfig, IcecastAudioFormat};

    fn test_config(mode: MuxMode, list_size: u32) -> MuxConfig {
        MuxConfig {
            api_url: "http://api:8080".into(),
            output_dir: std::env::temp_dir().join("mux-core-tests"),
            segment_time_secs: 4,
            list_size,
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
            segment_stability_delay: Duration::from_secs_f64(0.1),
            server_port: 8091,
            server_bind_address: "0.0.0.0".into(),
            restreamer_internal_url: None,
            restreamer_public_host: None,
        }
    }

    #[tokio::test]
    async fn cold_start_renders_expected_playlist() {
        let store = SegmentStore::new(&test_config(MuxMode::Copy, 20));
        store.add_segment(0, "segment_00000.ts", 4.0).await;
        store.add_segment(0, "segment_00001.ts", 4.0).await;
        store.add_segment(0, "segment_00002.ts", 4.0).await;

        let playlist = store.generate_variant_playlist(0).await;
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:5"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY-SEQUENCE:0"));
        assert_eq!(playlist.matches("#EXTINF:4.000,").count(), 3);
        assert!(!playlist.contains("#EXT-X-DISCONTINUITY\n"));
        assert_eq!(store.next_sequence().await, 3);
    }

    #[tokio::test]
    async fn switch_marks_discontinuity_on_first_new_segment() {
        let store = SegmentStore::new(&test_config(MuxMode::Copy, 20));
        store.add_segment(0, "segment_00000.ts", 4.0).await;
        store.add_segment(0, "segment_00001.ts", 4.0).await;
        store.add_segment(0, "segment_00002.ts", 4.0).await;

        store.mark_discontinuity().await;
        assert_eq!(store.next_sequence().await, 3);

        let seg = store.add_segment(0, "segment_00003.ts", 4.0).await;
        assert!(seg.discontinuity_before);
        store.add_segment(0, "segment_00004.ts", 4.0).await;

        let playlist = store.generate_variant_playlist(0).await;
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY-SEQUENCE:0"));
        let disc_pos = playlist.find("#EXT-X-DISCONTINUITY\n").unwrap();
        let seg_pos = playlist.find("segment_00003.ts").unwrap();
        assert!(disc_pos < seg_pos);
    }

    #[tokio::test]
    async fn discontinuity_inherited_across_variants_at_same_sequence() {
        let store = SegmentStore::new(&test_config(MuxMode::Abr, 20));
        store.mark_discontinuity().await;

        let v0 = store.add_segment(0, "segment_00000.ts", 4.0).await;
        assert!(v0.discontinuity_before);

        // Variant 1 produces the same sequence slightly later; it must inherit
        // the flag rather than re-triggering (or missing) the marker.
        let v1 = store.add_segment(1, "segment_00000.ts", 4.0).await;
        assert!(v1.discontinuity_before);
        assert_eq!(v1.discontinuity_sequence, v0.discontinuity_sequence);
    }

    #[tokio::test]
    async fn empty_playlist_is_minimal() {
        let store = SegmentStore::new(&test_config(MuxMode::Copy, 20));
        let playlist = store.generate_variant_playlist(0).await;
        assert_eq!(
            playlist,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n"
        );
    }

    #[tokio::test]
    async fn playlist_rendering_is_deterministic() {
        let store = SegmentStore::new(&test_config(MuxMode::Copy, 20));
        store.add_segment(0, "segment_00000.ts", 4.0).await;
        let a = store.generate_variant_playlist(0).await;
        let b = store.generate_variant_playlist(0).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn eviction_bounds_in_memory_list() {
        // list_size=3 => max_segments_in_memory=9
        let store = SegmentStore::new(&test_config(MuxMode::Copy, 3));
        for i in 0..15 {
            store
                .add_segment(0, &format!("segment_{i:05}.ts"), 4.0)
                .await;
        }
        let playlist = store.generate_variant_playlist(0).await;
        // window is last 3, but in-memory cap is 9
        assert_eq!(store.next_sequence().await, 15);
        assert_eq!(playlist.matches("#EXTINF").count(), 3);
        assert_eq!(store.variant_len(0).await, 9);
    }

    #[tokio::test]
    async fn aging_evicts_old_segments_and_unlinks_files() {
        let cfg = test_config(MuxMode::Copy, 3); // MAX_SEGMENT_AGE = 3*4*3 = 36s
        std::fs::create_dir_all(&cfg.output_dir).unwrap();
        let store = SegmentStore::new(&cfg);

        for i in 0..6 {
            let filename = format!("segment_{i:05}.ts");
            std::fs::write(cfg.output_dir.join(&filename), b"x").unwrap();
            store
                .add_segment_with_age(0, &filename, 4.0, Duration::from_secs(40))
                .await;
        }
        for i in 6..15 {
            let filename = format!("segment_{i:05}.ts");
            std::fs::write(cfg.output_dir.join(&filename), b"x").unwrap();
            store.add_segment(0, &filename, 4.0).await;
        }

        let removed = store.cleanup_old_segments().await;
        assert_eq!(removed, 6);
        for i in 0..6 {
            assert!(!cfg.output_dir.join(format!("segment_{i:05}.ts")).exists());
        }
        assert_eq!(store.next_sequence().await, 15);
    }
}
