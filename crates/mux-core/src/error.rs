//! Error types for the mux engine.
//!
//! Most failure modes inside the core are recovered locally and never
//! surface as a `Result` error at all — they are logged and the relevant
//! state machine falls back to a safe state. This enum exists for the
//! boundary cases that genuinely cannot proceed: configuration, transcoder
//! spawn, and outbound HTTP to the playhead source.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid configuration: {field} = {value:?}: {reason}")]
    Config {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to spawn transcoder at {path:?}: {source}")]
    TranscoderSpawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("playhead event source request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("playhead event source returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MuxError {
    pub fn config(field: &'static str, value: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        MuxError::Config {
            field,
            value: format!("{value:?}"),
            reason: reason.into(),
        }
    }
}

pub type MuxResult<T> = Result<T, MuxError>;
