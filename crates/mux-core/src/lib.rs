//! Core engine for the continuous HLS mux service: segment storage and
//! playlist rendering, the ffmpeg-based transcoder runner, the stream state
//! machine, and the upstream playhead monitor.

pub mod config;
pub mod error;
pub mod playhead;
pub mod segment;
pub mod segment_store;
pub mod stream_manager;
pub mod transcoder;

pub use config::{AbrVariant, IcecastAudioFormat, IcecastConfig, MuxConfig, MuxMode};
pub use error::{MuxError, MuxResult};
pub use playhead::{PlayheadEvent, PlayheadMonitor, PlayheadSink};
pub use segment::{Segment, SourceInfo};
pub use segment_store::SegmentStore;
pub use stream_manager::{PlayheadSwitchSink, StreamManager, StreamState};
pub use transcoder::{SegmentSink, TranscoderRunner};
