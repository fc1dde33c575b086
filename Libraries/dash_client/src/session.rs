//! The streaming session actor: a single-threaded event loop that owns the
//! manifest, one fetcher and one sample queue per track type, and the
//! bandwidth/selection machinery. All state changes are serialized through
//! its command channel; the outside world holds only a [`SessionHandle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::abr::{BufferBudget, Selector, SelectorConfig};
use crate::bandwidth::{BandwidthEstimator, EwmaEstimator};
use crate::error::DashError;
use crate::fetcher::{FetcherState, SegmentFetcher, StepOutcome};
use crate::mpd::{parser, Manifest, TrackType, TRACK_TYPES};
use crate::queue::SampleQueue;
use crate::source::DataSource;

const AUDIO_SLOT: usize = 0;
const VIDEO_SLOT: usize = 1;
const SUBTITLE_SLOT: usize = 2;

/// Events reported to the embedding player.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Prepared,
    PrepareFailed(String),
    BufferingStart,
    BufferingEnd,
    SubtitleAvailability(bool),
    RepresentationChanged {
        track: TrackType,
        representation_id: String,
        bandwidth: u64,
    },
    DrmDetected {
        scheme_uuid: String,
        pssh: Vec<u8>,
    },
    EndOfStream,
    Error(String),
}

pub type EventCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;

/// Commands accepted by the session actor.
#[derive(Debug)]
pub enum SessionCommand {
    Connect { url: String },
    Seek { time_us: u64 },
    /// `adaptation: None` deselects the track entirely.
    SelectTrack {
        track: TrackType,
        adaptation: Option<usize>,
    },
    Disconnect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionConfig {
    pub selector: SelectorConfig,
    /// Global buffer cap, pre-partitioned across tracks proportionally to
    /// each representation's bandwidth.
    pub max_buffer_bytes: u64,
    pub max_buffer_duration_us: u64,
    /// Reschedule delay after a productive download step.
    pub progress_interval_ms: u64,
    /// Backoff when no fetcher had anything to do.
    pub idle_interval_ms: u64,
    /// Consecutive failed/unchanged live manifest refreshes tolerated before
    /// a session-level error is raised.
    pub manifest_retry_ceiling: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            selector: SelectorConfig::default(),
            max_buffer_bytes: 32 * 1024 * 1024,
            max_buffer_duration_us: 30_000_000,
            progress_interval_ms: 10,
            idle_interval_ms: 1000,
            manifest_retry_ceiling: 5,
        }
    }
}

/// Cloneable handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    queues: [Arc<SampleQueue>; 3],
}

impl SessionHandle {
    pub async fn connect(&self, url: impl Into<String>) -> Result<(), DashError> {
        self.send(SessionCommand::Connect { url: url.into() }).await
    }

    pub async fn seek(&self, time_us: u64) -> Result<(), DashError> {
        self.send(SessionCommand::Seek { time_us }).await
    }

    pub async fn select_track(
        &self,
        track: TrackType,
        adaptation: Option<usize>,
    ) -> Result<(), DashError> {
        self.send(SessionCommand::SelectTrack { track, adaptation })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), DashError> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Immediate teardown without waiting for the actor to drain commands.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The sample queue the decode/render stage reads from.
    pub fn queue(&self, track: TrackType) -> Option<Arc<SampleQueue>> {
        track.slot().map(|slot| Arc::clone(&self.queues[slot]))
    }

    async fn send(&self, command: SessionCommand) -> Result<(), DashError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DashError::SessionClosed)
    }
}

pub struct Session {
    config: SessionConfig,
    source: Arc<dyn DataSource>,
    callback: EventCallback,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    queues: [Arc<SampleQueue>; 3],

    manifest: Option<Manifest>,
    manifest_url: Option<Url>,
    period_index: usize,
    fetchers: [Option<SegmentFetcher>; 3],
    estimator: Box<dyn BandwidthEstimator>,
    selector: Selector,
    /// Bumped on every fetcher creation; a step result is only ever applied
    /// to the generation that produced it.
    generation: u64,
    playback_time_us: u64,
    /// True between a seek and the first established fragment time.
    position_pending: bool,
    buffering: bool,
    manifest_failures: u32,
    /// Scheme UUIDs already reported, whether manifest-level or in-band.
    drm_reported: HashSet<String>,
    last_refresh: Instant,
}

/// Creates a session and spawns its event loop onto the current runtime.
pub fn spawn_session(
    source: Arc<dyn DataSource>,
    callback: EventCallback,
    config: SessionConfig,
) -> SessionHandle {
    let (session, handle) = Session::new(source, callback, config);
    tokio::spawn(session.run());
    handle
}

impl Session {
    pub fn new(
        source: Arc<dyn DataSource>,
        callback: EventCallback,
        config: SessionConfig,
    ) -> (Session, SessionHandle) {
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let queues = [
            Arc::new(SampleQueue::new(
                config.max_buffer_bytes,
                config.max_buffer_duration_us,
            )),
            Arc::new(SampleQueue::new(
                config.max_buffer_bytes,
                config.max_buffer_duration_us,
            )),
            Arc::new(SampleQueue::new(
                config.max_buffer_bytes,
                config.max_buffer_duration_us,
            )),
        ];
        let handle = SessionHandle {
            commands: tx,
            cancel: cancel.clone(),
            queues: [
                Arc::clone(&queues[0]),
                Arc::clone(&queues[1]),
                Arc::clone(&queues[2]),
            ],
        };
        let session = Session {
            selector: Selector::new(config.selector),
            config,
            source,
            callback,
            commands: rx,
            cancel,
            queues,
            manifest: None,
            manifest_url: None,
            period_index: 0,
            fetchers: [None, None, None],
            estimator: Box::new(EwmaEstimator::default()),
            generation: 0,
            playback_time_us: 0,
            position_pending: false,
            buffering: false,
            manifest_failures: 0,
            drm_reported: HashSet::new(),
            last_refresh: Instant::now(),
        };
        (session, handle)
    }

    pub async fn run(mut self) {
        let mut delay = Duration::from_millis(self.config.idle_interval_ms);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("session cancelled");
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            let disconnect = matches!(command, SessionCommand::Disconnect);
                            self.handle_command(command).await;
                            if disconnect {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    delay = self.tick().await;
                }
            }
        }
        for queue in &self.queues {
            queue.close();
        }
        info!("session stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { url } => {
                if let Err(e) = self.connect(&url).await {
                    warn!(url = %url, error = %e, "prepare failed");
                    (self.callback)(PlayerEvent::PrepareFailed(e.to_string()));
                }
            }
            SessionCommand::Seek { time_us } => {
                if let Err(e) = self.seek(time_us) {
                    (self.callback)(PlayerEvent::Error(e.to_string()));
                }
            }
            SessionCommand::SelectTrack { track, adaptation } => {
                if let Err(e) = self.select_track(track, adaptation) {
                    (self.callback)(PlayerEvent::Error(e.to_string()));
                }
            }
            SessionCommand::Disconnect => {
                self.fetchers = [None, None, None];
                self.manifest = None;
                self.cancel.cancel();
            }
        }
    }

    async fn connect(&mut self, url: &str) -> Result<(), DashError> {
        let manifest_url = Url::parse(url).map_err(|e| DashError::Parse(e.to_string()))?;
        let fetched = self.source.fetch(url, None).await?;
        let mut manifest = parser::parse_mpd(&fetched.data)?;
        if manifest.periods.is_empty() {
            return Err(DashError::Parse("manifest has no periods".into()));
        }

        self.manifest_url = Some(manifest_url);
        self.period_index = 0;
        self.selector.select_defaults(&mut manifest.periods[0]);

        let has_subtitles = manifest.periods[0]
            .adaptation_sets
            .iter()
            .any(|s| s.track_type == TrackType::Subtitle);
        let protections = manifest.protections.clone();
        let start_us = manifest.periods[0].start_us;

        self.manifest = Some(manifest);
        self.create_all_fetchers(start_us)?;

        for protection in protections {
            if self.drm_reported.insert(protection.scheme_uuid.clone()) {
                (self.callback)(PlayerEvent::DrmDetected {
                    scheme_uuid: protection.scheme_uuid,
                    pssh: protection.pssh,
                });
            }
        }
        (self.callback)(PlayerEvent::SubtitleAvailability(has_subtitles));
        (self.callback)(PlayerEvent::Prepared);
        self.buffering = true;
        (self.callback)(PlayerEvent::BufferingStart);
        self.last_refresh = Instant::now();
        info!(url, "session prepared");
        Ok(())
    }

    fn seek(&mut self, time_us: u64) -> Result<(), DashError> {
        // Close first so a concurrent reader drains out, then reset.
        for queue in &self.queues {
            queue.close();
            queue.reopen();
        }
        self.playback_time_us = time_us;
        self.position_pending = true;

        // Find the period containing the target.
        if let Some(manifest) = &self.manifest {
            for (i, period) in manifest.periods.iter().enumerate() {
                let end = manifest.period_end_us(i).unwrap_or(u64::MAX);
                if period.start_us <= time_us && time_us < end {
                    self.period_index = i;
                    break;
                }
            }
        }

        // Buffer occupancy just reset, so the selection may change.
        self.reselect_video();
        self.create_all_fetchers(time_us)?;
        self.buffering = true;
        (self.callback)(PlayerEvent::BufferingStart);
        debug!(
            time_us,
            position_pending = self.position_pending,
            "seek scheduled"
        );
        Ok(())
    }

    fn select_track(&mut self, track: TrackType, adaptation: Option<usize>) -> Result<(), DashError> {
        let Some(slot) = track.slot() else {
            return Err(DashError::Unsupported("unknown track type".into()));
        };
        let Some(manifest) = self.manifest.as_mut() else {
            return Err(DashError::SessionClosed);
        };
        let period = &mut manifest.periods[self.period_index];

        match adaptation {
            Some(index) => {
                if index >= period.adaptation_sets.len() {
                    return Err(DashError::Unsupported(format!(
                        "adaptation set {index} out of range"
                    )));
                }
                period.selected_adaptation[slot] = index as i32;
            }
            None => period.selected_adaptation[slot] = -1,
        }

        self.fetchers[slot] = None;
        self.queues[slot].clear();
        self.queues[slot].set_subtitle_header(None);

        if let Some(index) = adaptation {
            // Default the newly chosen set only; other tracks keep their
            // current (possibly adapted) representation.
            if let Some(manifest) = self.manifest.as_mut() {
                let period = &mut manifest.periods[self.period_index];
                if let Some(set) = period.adaptation_sets.get_mut(index) {
                    self.selector.select_default(set);
                }
            }
            let time = self.playback_time_us;
            self.create_fetcher(slot, time)?;
        }
        debug!(?track, ?adaptation, "track selection changed");
        Ok(())
    }

    /// One scheduler pass; returns the delay until the next pass.
    async fn tick(&mut self) -> Duration {
        self.maybe_refresh_manifest().await;
        let progressed = self.download_next().await;
        if progressed {
            Duration::from_millis(self.config.progress_interval_ms)
        } else {
            Duration::from_millis(self.config.idle_interval_ms)
        }
    }

    /// Picks the neediest fetcher and runs one download step: smallest
    /// next-fragment time first, metadata states before media on ties.
    async fn download_next(&mut self) -> bool {
        if self.manifest.is_none() {
            return false;
        }

        let mut best: Option<(usize, u64, u8)> = None;
        for slot in 0..TRACK_TYPES.len() {
            let Some(fetcher) = &self.fetchers[slot] else {
                continue;
            };
            if fetcher.is_stopped() || self.queue_full(slot) {
                continue;
            }
            let key = (fetcher.next_time_us(), fetcher.state().rank());
            if best
                .map(|(_, t, r)| (key.0, key.1) < (t, r))
                .unwrap_or(true)
            {
                best = Some((slot, key.0, key.1));
            }
        }
        let Some((slot, _, _)) = best else {
            return false;
        };

        // The fetcher never switches representation itself; the session
        // re-decides before each non-first video fragment and swaps the
        // fetcher when the decision changes.
        if slot == VIDEO_SLOT {
            self.reselect_video();
        }

        let expected_generation = match &self.fetchers[slot] {
            Some(f) => f.generation(),
            None => return true,
        };
        let source = Arc::clone(&self.source);
        let queue = Arc::clone(&self.queues[slot]);
        let outcome = {
            let fetcher = match self.fetchers[slot].as_mut() {
                Some(f) => f,
                None => return true,
            };
            fetcher
                .step(source.as_ref(), self.estimator.as_mut(), &queue)
                .await
        };

        // A command processed between ticks may have replaced the fetcher;
        // results from a superseded generation are dropped.
        let still_current = self.fetchers[slot]
            .as_ref()
            .map(|f| f.generation() == expected_generation)
            .unwrap_or(false);
        if !still_current {
            debug!(slot, "discarding result from superseded fetcher");
            return true;
        }

        // Init segments may carry pssh boxes the manifest never declared.
        if let Some(fetcher) = self.fetchers[slot].as_mut() {
            for (scheme_uuid, pssh) in fetcher.take_drm() {
                if self.drm_reported.insert(scheme_uuid.clone()) {
                    info!(scheme_uuid = %scheme_uuid, "DRM system detected");
                    (self.callback)(PlayerEvent::DrmDetected { scheme_uuid, pssh });
                }
            }
        }

        match outcome {
            Ok(StepOutcome::Progressed) => true,
            Ok(StepOutcome::Established { time_us }) => {
                // After a seek the video track settles the playback position;
                // audio and subtitles follow it. Without a video fetcher the
                // first established track settles it instead.
                if slot == VIDEO_SLOT || self.fetchers[VIDEO_SLOT].is_none() {
                    self.playback_time_us = time_us;
                    self.position_pending = false;
                }
                if self.buffering && !self.position_pending {
                    self.buffering = false;
                    (self.callback)(PlayerEvent::BufferingEnd);
                }
                true
            }
            Ok(StepOutcome::Idle) => false,
            Ok(StepOutcome::EndOfStream) => {
                self.on_end_of_stream();
                true
            }
            Err(e) => {
                self.on_fetcher_error(slot, e);
                true
            }
        }
    }

    /// Queue fullness under the global buffer cap, partitioned across the
    /// live tracks proportionally to their declared bandwidth.
    fn queue_full(&self, slot: usize) -> bool {
        let occupancy = self.queues[slot].occupancy();
        if occupancy.duration_us >= self.config.max_buffer_duration_us {
            return true;
        }
        let total_bw: u64 = self
            .fetchers
            .iter()
            .flatten()
            .map(|f| f.bandwidth())
            .sum();
        let slot_bw = self.fetchers[slot]
            .as_ref()
            .map(|f| f.bandwidth())
            .unwrap_or(0);
        if total_bw == 0 {
            return occupancy.bytes >= self.config.max_buffer_bytes;
        }
        occupancy.bytes >= self.config.max_buffer_bytes * slot_bw.max(1) / total_bw
    }

    /// Asks the selector for a fresh video decision and swaps the fetcher
    /// when it changes. Only applies once the current fetcher is past its
    /// first fragment.
    fn reselect_video(&mut self) {
        let estimate = self.estimator.estimate_bps();
        let Some(fetcher) = self.fetchers[VIDEO_SLOT].as_ref() else {
            return;
        };
        if fetcher.state() != FetcherState::Fragment || !fetcher.established() {
            return;
        }
        let continue_us = fetcher.next_time_us();

        let audio_bps = self.fetchers[AUDIO_SLOT]
            .as_ref()
            .map(|f| f.bandwidth() as f64)
            .unwrap_or(0.0);
        let subtitle_bps = self.fetchers[SUBTITLE_SLOT]
            .as_ref()
            .map(|f| f.bandwidth() as f64)
            .unwrap_or(0.0);
        let buffered_other = self.queues[AUDIO_SLOT].occupancy().bytes
            + self.queues[SUBTITLE_SLOT].occupancy().bytes;
        let min_buffer_s = self
            .manifest
            .as_ref()
            .and_then(|m| m.min_buffer_time_us)
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or(4.0);
        let available = Selector::video_budget_bps(
            estimate,
            audio_bps,
            subtitle_bps,
            Some(BufferBudget {
                max_buffer_bytes: self.config.max_buffer_bytes,
                buffered_other_bytes: buffered_other,
                min_buffer_time_s: min_buffer_s,
            }),
        );

        let Some(manifest) = self.manifest.as_mut() else {
            return;
        };
        let period = &mut manifest.periods[self.period_index];
        let set_index = period.selected_adaptation[VIDEO_SLOT];
        if set_index < 0 {
            return;
        }
        let set = &mut period.adaptation_sets[set_index as usize];
        if !self.selector.select(set, available) {
            return;
        }
        let representation = &set.representations[set.active_representation];
        let event = PlayerEvent::RepresentationChanged {
            track: TrackType::Video,
            representation_id: representation.id.clone(),
            bandwidth: representation.bandwidth,
        };
        (self.callback)(event);

        // Already-buffered samples of the old representation stay queued;
        // the new fetcher continues where they end.
        if let Err(e) = self.create_fetcher(VIDEO_SLOT, continue_us) {
            warn!(error = %e, "failed to switch video representation");
        }
    }

    fn create_all_fetchers(&mut self, start_time_us: u64) -> Result<(), DashError> {
        for slot in 0..TRACK_TYPES.len() {
            self.create_fetcher(slot, start_time_us)?;
        }
        Ok(())
    }

    fn create_fetcher(&mut self, slot: usize, start_time_us: u64) -> Result<(), DashError> {
        self.fetchers[slot] = None;
        let base = self.period_base()?;
        let Some(manifest) = self.manifest.as_ref() else {
            return Ok(());
        };
        let period_end = manifest.period_end_us(self.period_index);
        let period = &manifest.periods[self.period_index];
        let set_index = period.selected_adaptation[slot];
        if set_index < 0 {
            return Ok(());
        }
        let set = &period.adaptation_sets[set_index as usize];
        let Some(representation) = set.representations.get(set.active_representation) else {
            return Ok(());
        };

        self.generation += 1;
        self.fetchers[slot] = Some(SegmentFetcher::new(
            TRACK_TYPES[slot],
            self.generation,
            representation,
            base,
            period.start_us,
            period_end,
            start_time_us,
        ));
        debug!(
            track = ?TRACK_TYPES[slot],
            rep = %representation.id,
            generation = self.generation,
            start_time_us,
            "fetcher created"
        );
        Ok(())
    }

    /// Resolved base URL for the active period: manifest URL, then MPD-level
    /// BaseURL, then Period-level BaseURL.
    fn period_base(&self) -> Result<Url, DashError> {
        let manifest = self.manifest.as_ref().ok_or(DashError::SessionClosed)?;
        let mut base = self
            .manifest_url
            .clone()
            .ok_or(DashError::SessionClosed)?;
        if let Some(b) = &manifest.base_url {
            base = base.join(b).map_err(|e| DashError::Parse(e.to_string()))?;
        }
        if let Some(b) = &manifest.periods[self.period_index].base_url {
            base = base.join(b).map_err(|e| DashError::Parse(e.to_string()))?;
        }
        Ok(base)
    }

    /// A fetcher reached the end of its period. Once every live fetcher has
    /// stopped, either advance to the next period or report end-of-stream.
    fn on_end_of_stream(&mut self) {
        let all_stopped = self.fetchers.iter().flatten().all(|f| f.is_stopped());
        if !all_stopped {
            return;
        }
        let Some(manifest) = self.manifest.as_mut() else {
            return;
        };
        if self.period_index + 1 < manifest.periods.len() {
            self.period_index += 1;
            let period = &mut manifest.periods[self.period_index];
            let start_us = period.start_us;
            self.selector.select_defaults(period);
            info!(period = self.period_index, start_us, "advancing period");
            if let Err(e) = self.create_all_fetchers(start_us) {
                (self.callback)(PlayerEvent::Error(e.to_string()));
            }
        } else {
            (self.callback)(PlayerEvent::EndOfStream);
        }
    }

    /// Non-recoverable fetcher failure: stop that fetcher; escalate only
    /// when no media track is running and nothing is left buffered.
    fn on_fetcher_error(&mut self, slot: usize, error: DashError) {
        warn!(track = ?TRACK_TYPES[slot], error = %error, "fetcher failed");
        self.fetchers[slot] = None;

        let media_alive = self.fetchers[..=VIDEO_SLOT]
            .iter()
            .flatten()
            .any(|f| !f.is_stopped());
        let media_buffered = self.queues[AUDIO_SLOT].occupancy().samples > 0
            || self.queues[VIDEO_SLOT].occupancy().samples > 0;
        if !media_alive && !media_buffered {
            (self.callback)(PlayerEvent::Error(error.to_string()));
        }
    }

    /// Live manifests are periodically re-fetched and merged; failures and
    /// unchanged documents escalate after the retry ceiling.
    async fn maybe_refresh_manifest(&mut self) {
        let Some(update_period_us) = self
            .manifest
            .as_ref()
            .filter(|m| m.dynamic)
            .and_then(|m| m.minimum_update_period_us)
        else {
            return;
        };
        if self.last_refresh.elapsed() < Duration::from_micros(update_period_us) {
            return;
        }
        self.last_refresh = Instant::now();
        let Some(url) = self.manifest_url.as_ref().map(|u| u.to_string()) else {
            return;
        };

        let outcome = match self.source.fetch(&url, None).await {
            Ok(fetched) => match self.manifest.as_mut() {
                Some(manifest) => manifest.update(&fetched.data),
                None => return,
            },
            Err(e) => Err(e),
        };
        match outcome {
            Ok(true) => {
                self.manifest_failures = 0;
                self.sync_fetcher_addressing();
                debug!("live manifest updated");
            }
            Ok(false) => {
                let unchanged = self
                    .manifest
                    .as_ref()
                    .map(|m| m.unchanged_updates)
                    .unwrap_or(0);
                if unchanged == self.config.manifest_retry_ceiling {
                    (self.callback)(PlayerEvent::Error(format!(
                        "live manifest unchanged for {unchanged} refreshes"
                    )));
                }
            }
            Err(e) => {
                self.manifest_failures += 1;
                warn!(error = %e, failures = self.manifest_failures, "manifest refresh failed");
                if self.manifest_failures == self.config.manifest_retry_ceiling {
                    (self.callback)(PlayerEvent::Error(e.to_string()));
                }
            }
        }
    }

    /// Pushes merged (possibly extended) addressing into the live fetchers
    /// so a grown timeline is visible without recreating them.
    fn sync_fetcher_addressing(&mut self) {
        let Some(manifest) = self.manifest.as_ref() else {
            return;
        };
        let Some(period) = manifest.periods.get(self.period_index) else {
            return;
        };
        for fetcher in self.fetchers.iter_mut().flatten() {
            let Some(set) = period.adaptation_for(fetcher.track()) else {
                continue;
            };
            if let Some(rep) = set
                .representations
                .iter()
                .find(|r| r.id == fetcher.representation_id())
            {
                fetcher.update_addressing(rep.addressing.clone());
            }
        }
    }
}
