//! Per-track segment fetcher: a small state machine that turns the active
//! representation into a sequence of byte-range or templated-URL downloads
//! and queues the decoded samples.

use std::sync::OnceLock;

use mp4_box::reader::{parse_fragment, parse_init, parse_sidx, InitInfo, SegmentIndex};
use regex::Regex;
use tracing::{debug, trace};
use url::Url;

use crate::bandwidth::BandwidthEstimator;
use crate::error::DashError;
use crate::mpd::{ticks_to_us, us_to_ticks, Addressing, Representation, TrackType};
use crate::queue::SampleQueue;
use crate::source::{ByteRange, DataSource};
use crate::AccessUnit;

/// First byte-range size tried for an initialization segment; widened by
/// doubling (or to the parser's reported need) on BufferTooSmall.
const INITIAL_INIT_REQUEST: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    Init,
    Sidx,
    Fragment,
    Stopped,
}

impl FetcherState {
    /// Scheduling tie-break order: metadata states run before media.
    pub fn rank(&self) -> u8 {
        match self {
            FetcherState::Init => 0,
            FetcherState::Sidx => 1,
            FetcherState::Fragment => 2,
            FetcherState::Stopped => 3,
        }
    }
}

/// Result of one download step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; schedule again soon.
    Progressed,
    /// First media fragment landed: the actual starting timestamp, for
    /// correcting the playback position after a seek.
    Established { time_us: u64 },
    /// Nothing fetchable right now (live edge, source still growing).
    Idle,
    /// Period content exhausted; reported once, the fetcher stops itself.
    EndOfStream,
}

/// Where the next fragment lives.
enum NextFragment {
    Range {
        range: ByteRange,
        time_ticks: u64,
        duration_ticks: u64,
    },
    Uri {
        uri: String,
        time_ticks: u64,
        duration_ticks: Option<u64>,
    },
}

pub struct SegmentFetcher {
    track: TrackType,
    /// Stale results from a superseded fetcher are recognized by generation.
    generation: u64,
    rep_id: String,
    bandwidth: u64,
    addressing: Addressing,
    base: Url,
    period_start_us: u64,
    period_end_us: Option<u64>,

    state: FetcherState,
    init_request_len: u64,
    init_info: Option<InitInfo>,
    tkhd_raw: Vec<u8>,
    codec_configs: Vec<Vec<u8>>,
    index: Option<SegmentIndex>,
    /// DRM signaling found in the init segment, drained by the session.
    drm: Vec<(String, Vec<u8>)>,

    /// Seek target in period-relative microseconds; cleared once the first
    /// fragment has been located.
    pending_seek_us: Option<u64>,
    /// End of the last fetched fragment, period-relative ticks.
    next_time_ticks: u64,
    first_fragment: bool,
    eos_reported: bool,
}

impl SegmentFetcher {
    pub fn new(
        track: TrackType,
        generation: u64,
        representation: &Representation,
        base: Url,
        period_start_us: u64,
        period_end_us: Option<u64>,
        start_time_us: u64,
    ) -> Self {
        let rel_start_us = start_time_us.saturating_sub(period_start_us);
        Self {
            track,
            generation,
            rep_id: representation.id.clone(),
            bandwidth: representation.bandwidth,
            addressing: representation.addressing.clone(),
            base,
            period_start_us,
            period_end_us,
            state: FetcherState::Init,
            init_request_len: INITIAL_INIT_REQUEST,
            init_info: None,
            tkhd_raw: Vec::new(),
            codec_configs: Vec::new(),
            index: None,
            drm: Vec::new(),
            pending_seek_us: Some(rel_start_us),
            next_time_ticks: 0,
            first_fragment: true,
            eos_reported: false,
        }
    }

    pub fn track(&self) -> TrackType {
        self.track
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> FetcherState {
        self.state
    }

    pub fn representation_id(&self) -> &str {
        &self.rep_id
    }

    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    pub fn is_stopped(&self) -> bool {
        self.state == FetcherState::Stopped
    }

    /// True once the first media fragment has landed.
    pub fn established(&self) -> bool {
        !self.first_fragment
    }

    /// Absolute time of the next fragment, for smallest-time-first
    /// scheduling across fetchers.
    pub fn next_time_us(&self) -> u64 {
        let rel = self
            .pending_seek_us
            .unwrap_or_else(|| ticks_to_us(self.next_time_ticks, self.timescale()));
        self.period_start_us + rel
    }

    /// Swaps in merged addressing after a live manifest update so timeline
    /// growth is visible without recreating the fetcher.
    pub fn update_addressing(&mut self, addressing: Addressing) {
        self.addressing = addressing;
    }

    /// In-band DRM signaling (hyphenated scheme UUID, raw `pssh` box) found
    /// in the initialization segment; each entry is handed out once.
    pub fn take_drm(&mut self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.drm)
    }

    fn timescale(&self) -> u64 {
        match &self.addressing {
            Addressing::Template(t) => t.timescale.max(1),
            Addressing::Base(_) => self
                .index
                .as_ref()
                .map(|i| i.timescale as u64)
                .unwrap_or(1)
                .max(1),
        }
    }

    /// Runs one download step appropriate for the current state.
    pub async fn step(
        &mut self,
        source: &dyn DataSource,
        estimator: &mut dyn BandwidthEstimator,
        queue: &SampleQueue,
    ) -> Result<StepOutcome, DashError> {
        match self.state {
            FetcherState::Init => self.step_init(source, estimator, queue).await,
            FetcherState::Sidx => self.step_sidx(source, estimator).await,
            FetcherState::Fragment => self.step_fragment(source, estimator, queue).await,
            FetcherState::Stopped => Ok(StepOutcome::Idle),
        }
    }

    async fn step_init(
        &mut self,
        source: &dyn DataSource,
        estimator: &mut dyn BandwidthEstimator,
        queue: &SampleQueue,
    ) -> Result<StepOutcome, DashError> {
        let (url, explicit_range) = match &self.addressing {
            Addressing::Template(t) => {
                if t.initialization.is_empty() {
                    return Err(DashError::Unsupported(
                        "segment template without initialization URL".into(),
                    ));
                }
                let uri =
                    expand_template(&t.initialization, &self.rep_id, self.bandwidth, None, None)?;
                (self.resolve(&uri)?, None)
            }
            Addressing::Base(b) => (self.base.to_string(), b.init_range),
        };

        let (fetch_start, mut request_len) = match explicit_range {
            Some((first, last)) => (first, last + 1 - first),
            None => (0, self.init_request_len),
        };
        let (info, buffer) = loop {
            let fetched = source
                .fetch(
                    &url,
                    Some(ByteRange::new(fetch_start, Some(fetch_start + request_len))),
                )
                .await?;
            estimator.record(fetched.data.len(), fetched.duration_s);
            match parse_init(&fetched.data) {
                Ok(info) => break (info, fetched.data),
                Err(mp4_box::BoxError::BufferTooSmall { needed }) => {
                    let widened = needed.max(request_len.saturating_mul(2));
                    let capped = match fetched.total_len {
                        Some(total) => widened.min(total.saturating_sub(fetch_start)),
                        None => widened,
                    };
                    if capped <= fetched.data.len() as u64 {
                        // Source does not hold the full moov yet; let the
                        // scheduler come back later.
                        trace!(url = %url, request_len, "initialization segment incomplete");
                        return Ok(StepOutcome::Idle);
                    }
                    request_len = capped;
                    if explicit_range.is_none() {
                        self.init_request_len = request_len;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(track) = info.tracks.first() {
            self.tkhd_raw = track.tkhd_raw.clone();
            self.codec_configs = track.codec_configs.clone();
        }
        self.drm = info
            .pssh
            .iter()
            .map(|p| (p.system_id_hyphenated(), p.raw.clone()))
            .collect();
        if self.track == TrackType::Subtitle && !self.tkhd_raw.is_empty() {
            queue.set_subtitle_header(Some(self.tkhd_raw.clone()));
        }

        self.state = match &self.addressing {
            Addressing::Template(_) => FetcherState::Fragment,
            Addressing::Base(_) => FetcherState::Sidx,
        };
        if let (Addressing::Base(_), Some((sidx_off, _))) = (&self.addressing, info.sidx_range) {
            // The initialization request already covered the segment index;
            // no separate index fetch needed. sidx_off is relative to the
            // fetched buffer, which starts at fetch_start.
            self.index = Some(parse_sidx(&buffer, sidx_off as usize, fetch_start)?);
            self.state = FetcherState::Fragment;
        }
        debug!(
            track = ?self.track,
            rep = %self.rep_id,
            init_size = info.init_segment_size,
            "initialization segment parsed"
        );
        self.init_info = Some(info);
        Ok(StepOutcome::Progressed)
    }

    async fn step_sidx(
        &mut self,
        source: &dyn DataSource,
        estimator: &mut dyn BandwidthEstimator,
    ) -> Result<StepOutcome, DashError> {
        let Addressing::Base(base) = &self.addressing else {
            return Err(DashError::Unsupported(
                "segment index state without SegmentBase addressing".into(),
            ));
        };
        let (first, last) = base.index_range;
        let url = self.base.to_string();

        let mut request_len = last + 1 - first;
        loop {
            let fetched = source
                .fetch(&url, Some(ByteRange::new(first, Some(first + request_len))))
                .await?;
            estimator.record(fetched.data.len(), fetched.duration_s);
            match parse_sidx(&fetched.data, 0, first) {
                Ok(index) => {
                    debug!(
                        track = ?self.track,
                        rep = %self.rep_id,
                        subsegments = index.subsegments.len(),
                        "segment index resolved"
                    );
                    self.index = Some(index);
                    self.state = FetcherState::Fragment;
                    return Ok(StepOutcome::Progressed);
                }
                Err(mp4_box::BoxError::BufferTooSmall { needed }) => {
                    let widened = needed.max(request_len.saturating_mul(2));
                    let capped = match fetched.total_len {
                        Some(total) => widened.min(total.saturating_sub(first)),
                        None => widened,
                    };
                    if capped <= fetched.data.len() as u64 {
                        return Ok(StepOutcome::Idle);
                    }
                    request_len = capped;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn step_fragment(
        &mut self,
        source: &dyn DataSource,
        estimator: &mut dyn BandwidthEstimator,
        queue: &SampleQueue,
    ) -> Result<StepOutcome, DashError> {
        let Some(next) = self.locate_next()? else {
            return Ok(self.handle_exhausted(queue));
        };

        let (data, time_ticks, duration_hint) = match next {
            NextFragment::Range {
                range,
                time_ticks,
                duration_ticks,
            } => {
                let url = self.base.to_string();
                let fetched = source.fetch(&url, Some(range)).await?;
                estimator.record(fetched.data.len(), fetched.duration_s);
                (fetched.data, time_ticks, Some(duration_ticks))
            }
            NextFragment::Uri {
                uri,
                time_ticks,
                duration_ticks,
            } => {
                let url = self.resolve(&uri)?;
                let fetched = source.fetch(&url, None).await?;
                estimator.record(fetched.data.len(), fetched.duration_s);
                (fetched.data, time_ticks, duration_ticks)
            }
        };

        let fragment = parse_fragment(&data)?;
        let timescale = self.timescale();

        if self.track == TrackType::Subtitle {
            if let Some(subs) = &fragment.subs_raw {
                let mut header = self.tkhd_raw.clone();
                header.extend_from_slice(subs);
                queue.set_subtitle_header(Some(header));
            }
        }

        if self.first_fragment {
            for config in &self.codec_configs {
                queue.push(AccessUnit {
                    track: self.track,
                    time_us: self.period_start_us + ticks_to_us(time_ticks, timescale),
                    duration_us: 0,
                    payload: config.clone(),
                    codec_config: true,
                    format_change: true,
                    end_of_stream: false,
                    error: false,
                });
            }
        }

        let base_ticks = fragment.base_decode_time.unwrap_or(time_ticks);
        let mut queued_end_ticks = time_ticks;
        for sample in &fragment.samples {
            let end = sample.time_ticks + sample.duration_ticks as u64;
            queued_end_ticks = queued_end_ticks.max(end);
            queue.push(AccessUnit {
                track: self.track,
                time_us: self.period_start_us + ticks_to_us(sample.time_ticks, timescale),
                duration_us: ticks_to_us(sample.duration_ticks as u64, timescale),
                payload: sample.data.clone(),
                codec_config: false,
                format_change: false,
                end_of_stream: false,
                error: false,
            });
        }
        if let Some(duration) = duration_hint {
            queued_end_ticks = queued_end_ticks.max(time_ticks + duration);
        }
        self.next_time_ticks = queued_end_ticks;
        self.pending_seek_us = None;

        if self.first_fragment {
            self.first_fragment = false;
            let established = self.period_start_us + ticks_to_us(base_ticks, timescale);
            debug!(
                track = ?self.track,
                rep = %self.rep_id,
                established_us = established,
                "first fragment established"
            );
            return Ok(StepOutcome::Established {
                time_us: established,
            });
        }
        Ok(StepOutcome::Progressed)
    }

    /// Finds the next fragment by the active addressing mode: explicit
    /// sub-segment table, segment timeline, or constant-duration numbering.
    /// A seek selects the interval containing the target; steady playback
    /// takes the first interval at or after the last-known time.
    fn locate_next(&mut self) -> Result<Option<NextFragment>, DashError> {
        let timescale = self.timescale();
        let seek_ticks = self.pending_seek_us.map(|us| us_to_ticks(us, timescale));

        match &self.addressing {
            Addressing::Base(_) => {
                let index = self
                    .index
                    .as_ref()
                    .ok_or_else(|| DashError::Unsupported("fragment state without index".into()))?;
                let found = match seek_ticks {
                    Some(seek) => index
                        .subsegments
                        .iter()
                        .find(|s| s.time_ticks <= seek && seek < s.time_ticks + s.duration_ticks)
                        .or_else(|| index.subsegments.iter().find(|s| s.time_ticks >= seek)),
                    None => index
                        .subsegments
                        .iter()
                        .find(|s| s.time_ticks >= self.next_time_ticks),
                };
                Ok(found.map(|s| NextFragment::Range {
                    range: ByteRange::new(s.offset, Some(s.offset + s.size as u64)),
                    time_ticks: s.time_ticks,
                    duration_ticks: s.duration_ticks,
                }))
            }
            Addressing::Template(template) => {
                if let Some(timeline) = &template.timeline {
                    let mut found = None;
                    let mut position = 0u64;
                    'outer: for entry in timeline {
                        for r in 0..=entry.repeat {
                            let start = entry.start_ticks + r * entry.duration_ticks;
                            let hit = match seek_ticks {
                                Some(seek) => {
                                    (start <= seek && seek < start + entry.duration_ticks)
                                        || start >= seek
                                }
                                None => start >= self.next_time_ticks,
                            };
                            if hit {
                                found = Some((start, entry.duration_ticks));
                                break 'outer;
                            }
                            position += 1;
                        }
                    }
                    let Some((start, duration)) = found else {
                        return Ok(None);
                    };
                    let uri = expand_template(
                        &template.media,
                        &self.rep_id,
                        self.bandwidth,
                        Some(template.start_number + position),
                        Some(start),
                    )?;
                    Ok(Some(NextFragment::Uri {
                        uri,
                        time_ticks: start,
                        duration_ticks: Some(duration),
                    }))
                } else {
                    let duration = template.duration_ticks.ok_or_else(|| {
                        DashError::Unsupported(
                            "segment template with neither timeline nor duration".into(),
                        )
                    })?;
                    let index = match seek_ticks {
                        Some(seek) => seek / duration,
                        None => self.next_time_ticks / duration,
                    };
                    let start = index * duration;
                    if let Some(end_us) = self.period_end_us {
                        let rel_end = end_us.saturating_sub(self.period_start_us);
                        if ticks_to_us(start, self.timescale()) >= rel_end {
                            return Ok(None);
                        }
                    }
                    let uri = expand_template(
                        &template.media,
                        &self.rep_id,
                        self.bandwidth,
                        Some(template.start_number + index),
                        Some(start),
                    )?;
                    Ok(Some(NextFragment::Uri {
                        uri,
                        time_ticks: start,
                        duration_ticks: Some(duration),
                    }))
                }
            }
        }
    }

    /// No next fragment: end-of-stream when the period end is known and
    /// reached, otherwise wait (a live timeline may still grow).
    fn handle_exhausted(&mut self, queue: &SampleQueue) -> StepOutcome {
        let reached_end = match self.period_end_us {
            Some(end_us) => {
                let queued_end =
                    self.period_start_us + ticks_to_us(self.next_time_ticks, self.timescale());
                queued_end >= end_us
            }
            // A fully walked table with no declared end means the content is
            // exhausted for VOD-style single files.
            None => matches!(self.addressing, Addressing::Base(_)),
        };
        if !reached_end {
            return StepOutcome::Idle;
        }
        if self.eos_reported {
            return StepOutcome::Idle;
        }
        self.eos_reported = true;
        self.state = FetcherState::Stopped;
        queue.push(AccessUnit {
            track: self.track,
            time_us: self.period_start_us + ticks_to_us(self.next_time_ticks, self.timescale()),
            duration_us: 0,
            payload: Vec::new(),
            codec_config: false,
            format_change: false,
            end_of_stream: true,
            error: false,
        });
        debug!(track = ?self.track, rep = %self.rep_id, "end of stream");
        StepOutcome::EndOfStream
    }

    fn resolve(&self, relative: &str) -> Result<String, DashError> {
        self.base
            .join(relative)
            .map(|u| u.to_string())
            .map_err(|e| DashError::Template(format!("{relative}: {e}")))
    }
}

/// Substitutes the DASH URL template tokens. `$Number%0Nd$` pads the number
/// to N digits. Any `$` left after substitution marks an unresolvable token.
pub fn expand_template(
    template: &str,
    rep_id: &str,
    bandwidth: u64,
    number: Option<u64>,
    time: Option<u64>,
) -> Result<String, DashError> {
    static NUMBER_FORMAT: OnceLock<Regex> = OnceLock::new();
    let number_format =
        NUMBER_FORMAT.get_or_init(|| Regex::new(r"\$Number%0(\d+)d\$").expect("static pattern"));

    let mut out = template
        .replace("$RepresentationID$", rep_id)
        .replace("$Bandwidth$", &bandwidth.to_string());
    if let Some(n) = number {
        out = out.replace("$Number$", &n.to_string());
        out = number_format
            .replace_all(&out, |caps: &regex::Captures| {
                let width: usize = caps[1].parse().unwrap_or(1);
                format!("{n:0width$}")
            })
            .into_owned();
    }
    if let Some(t) = time {
        out = out.replace("$Time$", &t.to_string());
    }
    if out.contains('$') {
        return Err(DashError::Template(out));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::EwmaEstimator;
    use crate::mpd::{RepresentationKind, SegmentBase, SegmentTemplate, TimelineEntry};
    use crate::source::MemoryDataSource;
    use crate::testutil::{full_boxed, init_segment, init_segment_with_pssh, minimal_fragment};

    fn template_rep(timeline: Option<Vec<TimelineEntry>>, duration: Option<u64>) -> Representation {
        Representation {
            id: "v1".into(),
            bandwidth: 1_000_000,
            kind: RepresentationKind::Video {
                width: None,
                height: None,
                frame_rate: None,
            },
            selected: true,
            addressing: Addressing::Template(SegmentTemplate {
                initialization: "$RepresentationID$/init.mp4".into(),
                media: "$RepresentationID$/seg-$Time$.m4s".into(),
                start_number: 1,
                timescale: 1000,
                duration_ticks: duration,
                timeline,
            }),
        }
    }

    fn base_url() -> Url {
        Url::parse("http://cdn.test/content/").unwrap()
    }

    /// Single self-indexed file: ftyp+moov | sidx | moof+mdat. Returns the
    /// file plus (init_len, sidx_first, sidx_last).
    fn self_indexed_file() -> (Vec<u8>, u64, u64, u64) {
        let mut file = init_segment();
        let init_len = file.len() as u64;
        let fragment = minimal_fragment(&[(1000, 4)], 0);

        // sidx v0: one media reference covering the fragment.
        let mut sidx_body = vec![];
        sidx_body.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
        sidx_body.extend_from_slice(&1000u32.to_be_bytes()); // timescale
        sidx_body.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
        sidx_body.extend_from_slice(&0u32.to_be_bytes()); // first_offset
        sidx_body.extend_from_slice(&[0, 0, 0, 1]); // reserved + reference_count
        sidx_body.extend_from_slice(&(fragment.len() as u32).to_be_bytes());
        sidx_body.extend_from_slice(&1000u32.to_be_bytes()); // subsegment_duration
        sidx_body.extend_from_slice(&(1u32 << 31).to_be_bytes()); // starts_with_SAP
        let sidx = full_boxed(b"sidx", 0, &sidx_body);

        let sidx_first = file.len() as u64;
        let sidx_last = sidx_first + sidx.len() as u64 - 1;
        file.extend_from_slice(&sidx);
        file.extend_from_slice(&fragment);
        (file, init_len, sidx_first, sidx_last)
    }

    fn base_rep(index_range: (u64, u64), init_range: Option<(u64, u64)>) -> Representation {
        Representation {
            id: "main".into(),
            bandwidth: 500_000,
            kind: RepresentationKind::Audio {
                sampling_rate: None,
                channels: None,
            },
            selected: true,
            addressing: Addressing::Base(SegmentBase {
                index_range,
                init_range,
            }),
        }
    }

    #[test]
    fn template_token_substitution() {
        let uri = expand_template(
            "$RepresentationID$/$Bandwidth$/seg-$Number%05d$-$Time$.m4s",
            "v1",
            800_000,
            Some(7),
            Some(14_000),
        )
        .unwrap();
        assert_eq!(uri, "v1/800000/seg-00007-14000.m4s");

        let err = expand_template("seg-$Unknown$.m4s", "v1", 1, None, None).unwrap_err();
        assert!(matches!(err, DashError::Template(_)));
    }

    #[tokio::test]
    async fn init_request_widens_until_source_has_the_moov() {
        let source = MemoryDataSource::new();
        let init = init_segment();
        // Only the first 150 bytes of the init segment exist yet.
        source.insert("http://cdn.test/content/v1/init.mp4", init[..150].to_vec());

        let rep = template_rep(
            Some(vec![TimelineEntry {
                start_ticks: 0,
                duration_ticks: 1000,
                repeat: 0,
            }]),
            None,
        );
        let mut fetcher =
            SegmentFetcher::new(TrackType::Video, 0, &rep, base_url(), 0, Some(1_000_000), 0);
        fetcher.init_request_len = 100;
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        // 100-byte request, widened to 150 (the whole source), still short.
        let outcome = fetcher
            .step(&source, &mut estimator, &queue)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Idle);
        assert_eq!(fetcher.state(), FetcherState::Init);

        // The source finished growing; the widened request now succeeds.
        source.insert("http://cdn.test/content/v1/init.mp4", init.clone());
        let outcome = fetcher
            .step(&source, &mut estimator, &queue)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Progressed);
        assert_eq!(fetcher.state(), FetcherState::Fragment);
    }

    #[tokio::test]
    async fn timeline_seek_lands_in_repeat_expanded_interval() {
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/content/v1/init.mp4", init_segment());
        // (t=1000, d=500, r=2) expands to [1000,1500) [1500,2000) [2000,2500);
        // a 1700 ms seek must pick the segment starting at t=1500.
        source.insert(
            "http://cdn.test/content/v1/seg-1500.m4s",
            minimal_fragment(&[(500, 4)], 1500),
        );

        let rep = template_rep(
            Some(vec![TimelineEntry {
                start_ticks: 1000,
                duration_ticks: 500,
                repeat: 2,
            }]),
            None,
        );
        let mut fetcher = SegmentFetcher::new(
            TrackType::Video,
            0,
            &rep,
            base_url(),
            0,
            Some(2_500_000),
            1_700_000,
        );
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );
        let outcome = fetcher.step(&source, &mut estimator, &queue).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Established {
                time_us: 1_500_000
            }
        );

        // Codec config first, then the media sample at 1.5 s.
        let config = queue.pop().unwrap();
        assert!(config.codec_config && config.format_change);
        let sample = queue.pop().unwrap();
        assert_eq!(sample.time_us, 1_500_000);
        assert_eq!(sample.duration_us, 500_000);
    }

    #[tokio::test]
    async fn constant_duration_numbering_and_eos() {
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/content/v1/init.mp4", init_segment());
        source.insert(
            "http://cdn.test/content/v1/seg-0.m4s",
            minimal_fragment(&[(2000, 4)], 0),
        );
        source.insert(
            "http://cdn.test/content/v1/seg-2000.m4s",
            minimal_fragment(&[(2000, 4)], 2000),
        );

        let rep = template_rep(None, Some(2000));
        let mut fetcher =
            SegmentFetcher::new(TrackType::Video, 0, &rep, base_url(), 0, Some(4_000_000), 0);
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        fetcher.step(&source, &mut estimator, &queue).await.unwrap();
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Established { time_us: 0 }
        );
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );

        // Period end reached: exactly one end-of-stream report, then idle.
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::EndOfStream
        );
        assert!(fetcher.is_stopped());
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Idle
        );

        // The queue ends with an end-of-stream marker.
        let mut last = None;
        while let Some(sample) = queue.pop() {
            last = Some(sample);
        }
        assert!(last.unwrap().end_of_stream);
    }

    #[tokio::test]
    async fn segment_base_walks_the_subsegment_table() {
        let (file, init_len, sidx_first, sidx_last) = self_indexed_file();
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/media.mp4", file);

        let rep = base_rep((sidx_first, sidx_last), Some((0, init_len - 1)));
        let mut fetcher = SegmentFetcher::new(
            TrackType::Audio,
            0,
            &rep,
            Url::parse("http://cdn.test/media.mp4").unwrap(),
            0,
            None,
            0,
        );
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );
        assert_eq!(fetcher.state(), FetcherState::Sidx);
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );
        assert_eq!(fetcher.state(), FetcherState::Fragment);

        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Established { time_us: 0 }
        );
        // Table exhausted with no declared period end: single-file content
        // is done.
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::EndOfStream
        );
    }

    #[tokio::test]
    async fn init_segment_pssh_is_reported_once() {
        let source = MemoryDataSource::new();
        let system_id: [u8; 16] = [
            0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d,
            0x21, 0xed,
        ];
        source.insert(
            "http://cdn.test/content/v1/init.mp4",
            init_segment_with_pssh(&system_id),
        );

        let rep = template_rep(None, Some(1000));
        let mut fetcher =
            SegmentFetcher::new(TrackType::Video, 0, &rep, base_url(), 0, Some(1_000_000), 0);
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        fetcher.step(&source, &mut estimator, &queue).await.unwrap();
        let drm = fetcher.take_drm();
        assert_eq!(drm.len(), 1);
        assert_eq!(drm[0].0, "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed");
        assert_eq!(&drm[0].1[4..8], b"pssh");
        assert!(fetcher.take_drm().is_empty());
    }

    #[tokio::test]
    async fn declared_init_range_widens_when_too_short() {
        // The manifest under-declares the init range; the fetch must widen
        // past the declared end instead of failing on the truncated moov.
        let (file, init_len, sidx_first, sidx_last) = self_indexed_file();
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/media.mp4", file);

        let rep = base_rep((sidx_first, sidx_last), Some((0, init_len / 2)));
        let mut fetcher = SegmentFetcher::new(
            TrackType::Audio,
            0,
            &rep,
            Url::parse("http://cdn.test/media.mp4").unwrap(),
            0,
            None,
            0,
        );
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );
        // Truncated first answer, one widened retry.
        assert_eq!(source.request_count(), 2);
        assert_ne!(fetcher.state(), FetcherState::Init);

        // The widened buffer walks on into the fragment as usual.
        loop {
            match fetcher.step(&source, &mut estimator, &queue).await.unwrap() {
                StepOutcome::Established { time_us } => {
                    assert_eq!(time_us, 0);
                    break;
                }
                StepOutcome::Progressed => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn inline_segment_index_skips_the_index_fetch() {
        // Same single-file layout, but no explicit ranges in the manifest:
        // the head request captures moov and sidx together.
        let (file, _init_len, sidx_first, sidx_last) = self_indexed_file();
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/media.mp4", file);

        let rep = base_rep((sidx_first, sidx_last), None);
        let mut fetcher = SegmentFetcher::new(
            TrackType::Audio,
            0,
            &rep,
            Url::parse("http://cdn.test/media.mp4").unwrap(),
            0,
            None,
            0,
        );
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        // One request resolves both init and index.
        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Progressed
        );
        assert_eq!(fetcher.state(), FetcherState::Fragment);
        assert_eq!(source.request_count(), 1);

        assert_eq!(
            fetcher.step(&source, &mut estimator, &queue).await.unwrap(),
            StepOutcome::Established { time_us: 0 }
        );
    }

    #[tokio::test]
    async fn subtitle_fragments_carry_track_header_context() {
        let source = MemoryDataSource::new();
        source.insert("http://cdn.test/content/s1/init.mp4", init_segment());
        source.insert(
            "http://cdn.test/content/s1/seg-0.m4s",
            minimal_fragment(&[(1000, 4)], 0),
        );

        let mut rep = template_rep(None, Some(1000));
        rep.id = "s1".into();
        rep.kind = RepresentationKind::Subtitle;
        let mut fetcher =
            SegmentFetcher::new(TrackType::Subtitle, 0, &rep, base_url(), 0, Some(1_000_000), 0);
        let mut estimator = EwmaEstimator::default();
        let queue = SampleQueue::new(u64::MAX, u64::MAX);

        fetcher.step(&source, &mut estimator, &queue).await.unwrap();
        fetcher.step(&source, &mut estimator, &queue).await.unwrap();

        // Skip the codec config, then check the media sample's payload is
        // prefixed with the raw tkhd bytes.
        let mut sample = queue.pop().unwrap();
        while sample.codec_config {
            sample = queue.pop().unwrap();
        }
        assert_eq!(&sample.payload[4..8], b"tkhd");
    }
}
