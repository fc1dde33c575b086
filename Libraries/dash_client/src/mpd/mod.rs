//! DASH manifest data structures (MPD and related types).
//! These represent parsed MPEG-DASH metadata: the Period → AdaptationSet →
//! Representation tree, segment addressing, and timing.

pub mod parser;
pub mod update;

use chrono::{DateTime, Utc};

/// Logical track kind of an adaptation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
    Subtitle,
    Unknown,
}

/// The track types a session schedules fetchers for, in scheduling order.
pub const TRACK_TYPES: [TrackType; 3] = [TrackType::Audio, TrackType::Video, TrackType::Subtitle];

impl TrackType {
    /// Infers the track type from a `contentType` or MIME string.
    pub fn infer(content_type: &str, mime_type: &str) -> TrackType {
        for hint in [content_type, mime_type] {
            if hint.contains("audio") {
                return TrackType::Audio;
            }
            if hint.contains("video") {
                return TrackType::Video;
            }
            if hint.contains("text") || hint.contains("subtitle") || hint.contains("application/mp4")
            {
                return TrackType::Subtitle;
            }
        }
        TrackType::Unknown
    }

    /// Index into per-track-type arrays; `None` for unknown tracks.
    pub fn slot(&self) -> Option<usize> {
        match self {
            TrackType::Audio => Some(0),
            TrackType::Video => Some(1),
            TrackType::Subtitle => Some(2),
            TrackType::Unknown => None,
        }
    }
}

/// One entry of an explicit segment timeline: a start tick, a duration in
/// ticks, and a repeat count (`repeat` additional segments of the same
/// duration follow the first one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub start_ticks: u64,
    pub duration_ticks: u64,
    pub repeat: u64,
}

impl TimelineEntry {
    pub fn end_ticks(&self) -> u64 {
        self.start_ticks + self.duration_ticks * (self.repeat + 1)
    }
}

/// Template-based segment addressing: URL templates plus either an explicit
/// timeline or implicit constant-duration numbering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentTemplate {
    /// URL template for the initialization segment.
    pub initialization: String,
    /// URL template for media segments (may contain $Number$, $Time$, etc.).
    pub media: String,
    pub start_number: u64,
    /// Ticks per second for all tick-valued fields; defaults to 1.
    pub timescale: u64,
    /// Constant segment duration in ticks when no timeline is present.
    pub duration_ticks: Option<u64>,
    pub timeline: Option<Vec<TimelineEntry>>,
}

/// Single-file addressing: the whole representation is one byte-range
/// addressed file with a segment index box at a known offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentBase {
    /// Byte range of the segment index box (inclusive bounds, as in
    /// `indexRange="a-b"`).
    pub index_range: (u64, u64),
    /// Byte range of the initialization data, when given explicitly.
    pub init_range: Option<(u64, u64)>,
}

/// Exactly one addressing scheme per representation; a manifest offering
/// neither is rejected at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Addressing {
    Template(SegmentTemplate),
    Base(SegmentBase),
}

/// Type-specific representation payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RepresentationKind {
    Audio {
        sampling_rate: Option<u32>,
        channels: Option<u32>,
    },
    Video {
        width: Option<u32>,
        height: Option<u32>,
        frame_rate: Option<f64>,
    },
    Subtitle,
    Unknown,
}

/// One encoded bitrate/resolution variant within an adaptation set.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    /// Unique within the enclosing adaptation set.
    pub id: String,
    /// Declared average bandwidth in bits per second.
    pub bandwidth: u64,
    pub kind: RepresentationKind,
    /// Restricts the ABR candidate set; deselected representations are never
    /// chosen.
    pub selected: bool,
    pub addressing: Addressing,
}

impl Representation {
    pub fn timescale(&self) -> u64 {
        match &self.addressing {
            Addressing::Template(t) => t.timescale.max(1),
            Addressing::Base(_) => 1,
        }
    }
}

/// A group of interchangeable representations for one logical track.
#[derive(Debug, Clone, Default)]
pub struct AdaptationSet {
    pub track_type: TrackType,
    pub mime_type: String,
    pub lang: String,
    // Defaults inherited by representations that do not override them.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub audio_sampling_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub representations: Vec<Representation>,
    /// Currently active representation, clamped into `[0, len)` on update.
    pub active_representation: usize,
}

impl Default for TrackType {
    fn default() -> Self {
        TrackType::Unknown
    }
}

/// A manifest-defined time range of content, possibly with a different set of
/// tracks than adjacent periods.
#[derive(Debug, Clone, Default)]
pub struct Period {
    pub id: String,
    pub start_us: u64,
    pub duration_us: Option<u64>,
    pub base_url: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
    /// Selected adaptation set per track type slot; -1 means none.
    pub selected_adaptation: [i32; 3],
}

impl Period {
    pub fn end_us(&self) -> Option<u64> {
        self.duration_us.map(|d| self.start_us + d)
    }

    /// The adaptation set currently selected for `track`, if any.
    pub fn adaptation_for(&self, track: TrackType) -> Option<&AdaptationSet> {
        let slot = track.slot()?;
        let idx = self.selected_adaptation[slot];
        if idx < 0 {
            return None;
        }
        self.adaptation_sets.get(idx as usize)
    }

    /// Picks the first adaptation set of each track type as the default
    /// selection, leaving -1 for absent types.
    pub fn select_default_adaptations(&mut self) {
        self.selected_adaptation = [-1; 3];
        for (i, set) in self.adaptation_sets.iter().enumerate() {
            if let Some(slot) = set.track_type.slot() {
                if self.selected_adaptation[slot] < 0 {
                    self.selected_adaptation[slot] = i as i32;
                }
            }
        }
    }
}

/// DRM signaling attached to the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentProtection {
    pub scheme_uuid: String,
    pub pssh: Vec<u8>,
}

/// Top-level parsed MPD.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub periods: Vec<Period>,
    /// `mediaPresentationDuration`, when static content declares one.
    pub duration_us: Option<u64>,
    /// True for `type="dynamic"` (live) manifests.
    pub dynamic: bool,
    pub min_buffer_time_us: Option<u64>,
    pub minimum_update_period_us: Option<u64>,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub base_url: Option<String>,
    pub protections: Vec<ContentProtection>,
    /// Hash of the manifest bytes, used to skip no-op live updates.
    pub content_hash: [u8; 32],
    /// Consecutive updates that arrived with unchanged content.
    pub unchanged_updates: u32,
}

impl Manifest {
    /// End time of `period`, falling back to the next period's start or the
    /// presentation duration when the period declares none.
    pub fn period_end_us(&self, index: usize) -> Option<u64> {
        let period = self.periods.get(index)?;
        period
            .end_us()
            .or_else(|| self.periods.get(index + 1).map(|p| p.start_us))
            .or(self.duration_us)
    }
}

/// Converts manifest ticks at `timescale` to microseconds. 128-bit
/// intermediate arithmetic keeps large tick values from overflowing.
pub fn ticks_to_us(ticks: u64, timescale: u64) -> u64 {
    let timescale = timescale.max(1);
    ((ticks as u128) * 1_000_000 / timescale as u128) as u64
}

/// Converts microseconds to ticks at `timescale`, rounding down.
pub fn us_to_ticks(us: u64, timescale: u64) -> u64 {
    ((us as u128) * timescale.max(1) as u128 / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_uses_wide_arithmetic() {
        // Large tick count at a 90 kHz timescale would overflow u64 if the
        // multiply were done in 64 bits.
        let ticks = u64::MAX / 1_000;
        let us = ticks_to_us(ticks, 90_000);
        assert_eq!(us, ((ticks as u128) * 1_000_000 / 90_000) as u64);
    }

    #[test]
    fn timeline_entry_end_expands_repeats() {
        let entry = TimelineEntry {
            start_ticks: 1000,
            duration_ticks: 500,
            repeat: 2,
        };
        assert_eq!(entry.end_ticks(), 2500);
    }

    #[test]
    fn track_type_inference() {
        assert_eq!(TrackType::infer("", "video/mp4"), TrackType::Video);
        assert_eq!(TrackType::infer("audio", ""), TrackType::Audio);
        assert_eq!(TrackType::infer("", "application/mp4"), TrackType::Subtitle);
        assert_eq!(TrackType::infer("", "image/jpeg"), TrackType::Unknown);
    }
}
