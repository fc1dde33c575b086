//! Adaptive MPEG-DASH streaming client.
//!
//! The crate parses MPD manifests, walks fragmented-MP4 segments via
//! [`mp4_box`], adapts the video bitrate to measured throughput, and feeds
//! decodable access units into per-track sample queues. Everything is driven
//! by a single [`session::Session`] actor; the embedding player talks to it
//! through a [`session::SessionHandle`] and reads samples from the queues.

pub mod abr;
pub mod bandwidth;
pub mod error;
pub mod fetcher;
pub mod mpd;
pub mod queue;
pub mod session;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::DashError;
pub use session::{
    spawn_session, EventCallback, PlayerEvent, SessionCommand, SessionConfig, SessionHandle,
};

use mpd::TrackType;

/// One unit of output: a media sample, a codec configuration record, or a
/// stream marker, timestamped on the presentation timeline.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    pub track: TrackType,
    pub time_us: u64,
    pub duration_us: u64,
    pub payload: Vec<u8>,
    /// Decoder initialization data (e.g. an `avcC` record) rather than a
    /// media sample; emitted ahead of the first sample of a representation.
    pub codec_config: bool,
    /// Set on codec configs that start a new representation; the decoder
    /// must be reconfigured before consuming further samples.
    pub format_change: bool,
    /// Marks the end of the track; carries no payload.
    pub end_of_stream: bool,
    pub error: bool,
}
