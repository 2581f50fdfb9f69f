//! Configuration for the mux engine, loaded from the environment.
//!
//! Mirrors the source's `_parse_env` pattern: a numeric value outside its
//! valid range is clamped and a warning is logged, rather than aborting
//! startup; only structurally invalid values (unparseable `ABR_VARIANTS`)
//! refuse startup outright.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MuxError, MuxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMode {
    Copy,
    Abr,
}

impl MuxMode {
    fn from_env_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("abr") {
            MuxMode::Abr
        } else {
            MuxMode::Copy
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AbrVariant {
    pub height: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

#[derive(Debug, Clone)]
pub struct IcecastConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub source_password: String,
    pub mount: String,
    pub audio_bitrate: String,
    pub audio_format: IcecastAudioFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcecastAudioFormat {
    Mp3,
    Aac,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub api_url: String,
    pub output_dir: PathBuf,
    pub segment_time_secs: u32,
    pub list_size: u32,
    pub mode: MuxMode,
    pub abr_variants: Vec<AbrVariant>,
    pub abr_preset: String,
    pub abr_gop_size: u32,
    pub transcoder_binary: String,
    pub icecast: IcecastConfig,
    pub transition_timeout: Duration,
    pub segment_stability_delay: Duration,
    pub server_port: u16,
    pub server_bind_address: String,
    pub restreamer_internal_url: Option<String>,
    pub restreamer_public_host: Option<String>,
}

fn default_abr_variants() -> Vec<AbrVariant> {
    vec![
        AbrVariant {
            height: 1080,
            video_bitrate: "5000k".to_string(),
            audio_bitrate: "192k".to_string(),
        },
        AbrVariant {
            height: 720,
            video_bitrate: "2800k".to_string(),
            audio_bitrate: "128k".to_string(),
        },
        AbrVariant {
            height: 576,
            video_bitrate: "1400k".to_string(),
            audio_bitrate: "96k".to_string(),
        },
    ]
}

/// Parse and range-clamp a numeric environment variable, logging on any
/// deviation from the raw input (missing, invalid, or out of range).
fn parse_env_clamped<T>(name: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    if raw.is_empty() {
        return default;
    }
    match raw.parse::<T>() {
        Ok(val) if val < min => {
            tracing::warn!(name, %val, %min, "value below minimum, clamping");
            min
        }
        Ok(val) if val > max => {
            tracing::warn!(name, %val, %max, "value above maximum, clamping");
            max
        }
        Ok(val) => val,
        Err(_) => {
            tracing::warn!(name, raw, %default, "invalid value, using default");
            default
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn parse_abr_variants() -> MuxResult<Vec<AbrVariant>> {
    let raw = std::env::var("ABR_VARIANTS").unwrap_or_default();
    if raw.is_empty() {
        return Ok(default_abr_variants());
    }
    let variants: Vec<AbrVariant> = serde_json::from_str(&raw).map_err(|e| {
        MuxError::config("ABR_VARIANTS", &raw, format!("invalid JSON: {e}"))
    })?;
    if variants.is_empty() {
        return Err(MuxError::config(
            "ABR_VARIANTS",
            &raw,
            "must be a non-empty list",
        ));
    }
    Ok(variants)
}

impl MuxConfig {
    pub fn from_env() -> MuxResult<Self> {
        let mode = MuxMode::from_env_str(&env_or("MUX_MODE", "copy"));
        let abr_variants = if mode == MuxMode::Abr {
            parse_abr_variants()?
        } else {
            Vec::new()
        };

        let icecast = IcecastConfig {
            enabled: env_bool("ICECAST_ENABLED", true),
            host: env_or("ICECAST_HOST", "icecast"),
            port: parse_env_clamped("ICECAST_PORT", 8000u16, 1, 65535),
            source_password: env_or("ICECAST_SOURCE_PASSWORD", "hackme"),
            mount: env_or("ICECAST_MOUNT", "/stream.mp3"),
            audio_bitrate: env_or("ICECAST_AUDIO_BITRATE", "128k"),
            audio_format: if env_or("ICECAST_AUDIO_FORMAT", "mp3") == "aac" {
                IcecastAudioFormat::Aac
            } else {
                IcecastAudioFormat::Mp3
            },
        };

        let restreamer_public_host = match env_or("CORE_API_HOSTNAME", "") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let restreamer_internal_url = match env_or("RESTREAMER_INTERNAL_URL", "") {
            s if s.is_empty() => None,
            s => Some(s),
        };

        Ok(MuxConfig {
            api_url: env_or("API_URL", "http://api:8080"),
            output_dir: PathBuf::from(env_or("HLS_OUTPUT_DIR", "/tmp/hls")),
            segment_time_secs: parse_env_clamped("HLS_SEGMENT_TIME", 4u32, 1, 60),
            list_size: parse_env_clamped("HLS_LIST_SIZE", 20u32, 3, 100),
            mode,
            abr_variants,
            abr_preset: env_or("ABR_PRESET", "veryfast"),
            abr_gop_size: parse_env_clamped("ABR_GOP_SIZE", 48u32, 1, 300),
            transcoder_binary: env_or("TRANSCODER_BINARY", "ffmpeg"),
            icecast,
            transition_timeout: Duration::from_secs_f64(parse_env_clamped(
                "TRANSITION_TIMEOUT",
                15.0f64,
                1.0,
                120.0,
            )),
            segment_stability_delay: Duration::from_secs_f64(env_or(
                "SEGMENT_STABILITY_DELAY",
                "0.1",
            )
            .parse()
            .unwrap_or(0.1)),
            server_port: parse_env_clamped("SERVER_PORT", 8091u16, 1, 65535),
            server_bind_address: env_or("SERVER_BIND_ADDRESS", "0.0.0.0"),
            restreamer_internal_url,
            restreamer_public_host,
        })
    }

    pub fn num_variants(&self) -> usize {
        match self.mode {
            MuxMode::Abr => 1 + self.abr_variants.len(),
            MuxMode::Copy => 1,
        }
    }

    pub fn max_segment_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.list_size) * u64::from(self.segment_time_secs) * 3)
    }

    pub fn max_segments_in_memory(&self) -> usize {
        self.list_size as usize * 3
    }

    /// Substitute the configured public hostname prefix with the internal
    /// restreamer URL, so outbound connections never cross the public edge.
    pub fn rewrite_stream_url(&self, url: &str) -> String {
        let (Some(public_host), Some(internal_url)) =
            (&self.restreamer_public_host, &self.restreamer_internal_url)
        else {
            return url.to_string();
        };
        let public_prefix = format!("https://{public_host}/");
        match url.strip_prefix(&public_prefix) {
            Some(rest) => format!("{}/{}", internal_url.trim_end_matches('/'), rest),
            None => url.to_string(),
        }
    }
}

/// Parse a human-readable bitrate (`"5000k"`, `"2.5m"`, `"128"`) into kbps.
pub fn parse_bitrate(bitrate: &str, default_kbps: u32) -> u32 {
    let s = bitrate.to_lowercase();
    let s = s.trim();
    if let Some(prefix) = s.strip_suffix('m') {
        return prefix
            .parse::<f64>()
            .map(|v| (v * 1000.0) as u32)
            .unwrap_or_else(|_| {
                tracing::warn!(bitrate, "invalid bitrate, using default");
                default_kbps
            });
    }
    if let Some(prefix) = s.strip_suffix('k') {
        return prefix.parse::<f64>().map(|v| v as u32).unwrap_or_else(|_| {
            tracing::warn!(bitrate, "invalid bitrate, using default");
            default_kbps
        });
    }
    s.parse::<u32>().unwrap_or_else(|_| {
        tracing::warn!(bitrate, "invalid bitrate, using default");
        default_kbps
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("5000k", 5000)]
    #[case("2.5m", 2500)]
    #[case("128", 128)]
    #[case("0.5m", 500)]
    fn parse_bitrate_variants(#[case] input: &str, #[case] expected: u32) {
        assert_eq!(parse_bitrate(input, 0), expected);
    }

    #[test]
    fn parse_bitrate_falls_back_to_default_on_garbage() {
        assert_eq!(parse_bitrate("garbage", 42), 42);
    }

    #[test]
    fn rewrite_stream_url_substitutes_matching_prefix() {
        let mut cfg = bare_config();
        cfg.restreamer_public_host = Some("public.example.com".to_string());
        cfg.restreamer_internal_url = Some("http://restreamer:8080".to_string());

        assert_eq!(
            cfg.rewrite_stream_url("https://public.example.com/live/a.m3u8"),
            "http://restreamer:8080/live/a.m3u8"
        );
        assert_eq!(
            cfg.rewrite_stream_url("https://other.example.com/live/a.m3u8"),
            "https://other.example.com/live/a.m3u8"
        );
    }

    #[test]
    fn rewrite_stream_url_passthrough_when_unconfigured() {
        let cfg = bare_config();
        assert_eq!(
            cfg.rewrite_stream_url("https://public.example.com/x"),
            "https://public.example.com/x"
        );
    }

    #[test]
    fn derived_values_match_formulas() {
        let mut cfg = bare_config();
        cfg.list_size = 3;
        cfg.segment_time_secs = 4;
        assert_eq!(cfg.max_segments_in_memory(), 9);
        assert_eq!(cfg.max_segment_age(), Duration::from_secs(36));
    }

    fn bare_config() -> MuxConfig {
        MuxConfig {
            api_url: "http://api:8080".into(),
            output_dir: PathBuf::from("/tmp/hls"),
            segment_time_secs: 4,
            list_size: 20,
            mode: MuxMode::Copy,
            abr_variants: Vec::new(),
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
}
