//! Representation selection. Pure decision logic, no I/O: the session feeds
//! in a bandwidth estimate and the selector mutates the adaptation set's
//! active representation index.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mpd::{AdaptationSet, Period, TrackType};

/// Switching thresholds. These are tuned values carried over from field
/// experience, not derived; kept configurable so deployments can adjust them
/// without a rebuild.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// An up-switch with less than this headroom factor is a "close call"
    /// and must be confirmed over consecutive calls.
    pub up_switch_close_call: f64,
    /// Headroom factor above which a close-call up-switch commits at once.
    pub up_switch_immediate: f64,
    /// Bandwidth fraction of the current representation down to which it is
    /// retained before a down-switch is allowed.
    pub down_switch_floor: f64,
    /// Consecutive agreeing calls required by both hysteresis directions.
    pub confirm_calls: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            up_switch_close_call: 1.3,
            up_switch_immediate: 1.1,
            down_switch_floor: 0.9,
            confirm_calls: 3,
        }
    }
}

/// Buffer-derived cap on the bandwidth the video track may consume.
#[derive(Debug, Clone, Copy)]
pub struct BufferBudget {
    pub max_buffer_bytes: u64,
    /// Bytes currently buffered by the non-video tracks.
    pub buffered_other_bytes: u64,
    pub min_buffer_time_s: f64,
}

/// Stateful selector: carries the hysteresis counters between calls.
#[derive(Debug, Default)]
pub struct Selector {
    config: SelectorConfig,
    /// Close-call up-switch candidate under confirmation, by representation
    /// id, with the number of consecutive calls that proposed it.
    pending_up: Option<(String, u32)>,
    /// Consecutive borderline calls the current representation survived.
    borderline: u32,
}

impl Selector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            pending_up: None,
            borderline: 0,
        }
    }

    /// Initial per-track defaults: audio takes the highest bandwidth (audio
    /// is cheap and quality-critical), video the lowest (safe start under
    /// unknown bandwidth), subtitles the first listed.
    pub fn select_defaults(&self, period: &mut Period) {
        for &set_idx in period.selected_adaptation.iter() {
            if set_idx < 0 {
                continue;
            }
            if let Some(set) = period.adaptation_sets.get_mut(set_idx as usize) {
                self.select_default(set);
            }
        }
    }

    /// Default pick for a single adaptation set, by track type.
    pub fn select_default(&self, set: &mut AdaptationSet) {
        let candidates = candidate_indices(set);
        let Some(&lowest) = candidates.first() else {
            return;
        };
        set.active_representation = match set.track_type {
            TrackType::Audio => *candidates.last().unwrap_or(&lowest),
            TrackType::Subtitle => 0,
            _ => lowest,
        };
    }

    /// Bandwidth left over for video once the fixed tracks are accounted
    /// for, optionally capped by the buffer-derived ceiling.
    pub fn video_budget_bps(
        total_estimate_bps: f64,
        audio_bps: f64,
        subtitle_bps: f64,
        budget: Option<BufferBudget>,
    ) -> f64 {
        let mut available = total_estimate_bps - audio_bps - subtitle_bps;
        if let Some(budget) = budget {
            if budget.min_buffer_time_s > 0.0 {
                let free = budget
                    .max_buffer_bytes
                    .saturating_sub(budget.buffered_other_bytes);
                let ceiling = free as f64 * 8.0 / budget.min_buffer_time_s;
                available = available.min(ceiling);
            }
        }
        available.max(0.0)
    }

    /// One re-selection step over the video adaptation set.
    ///
    /// Candidates are the representations marked selected, ordered by
    /// bandwidth, evaluated from the highest down. Returns true when the
    /// active representation changed.
    pub fn select(&mut self, set: &mut AdaptationSet, available_bps: f64) -> bool {
        let candidates = candidate_indices(set);
        if candidates.is_empty() {
            return false;
        }
        let current = set
            .active_representation
            .min(set.representations.len() - 1);
        let current_bw = set.representations[current].bandwidth as f64;

        // A comfortably running current selection is not borderline.
        if available_bps >= current_bw {
            self.borderline = 0;
        }

        let mut committed = None;
        let mut proposed_up: Option<String> = None;
        for &idx in candidates.iter().rev() {
            let bw = set.representations[idx].bandwidth as f64;

            if bw < available_bps {
                let close_call_up =
                    bw > current_bw && available_bps < bw * self.config.up_switch_close_call;
                if close_call_up {
                    if available_bps > bw * self.config.up_switch_immediate {
                        committed = Some(idx);
                        break;
                    }
                    let id = set.representations[idx].id.clone();
                    let count = match &mut self.pending_up {
                        Some((pending_id, count)) if *pending_id == id => {
                            *count += 1;
                            *count
                        }
                        _ => {
                            self.pending_up = Some((id.clone(), 1));
                            1
                        }
                    };
                    proposed_up = Some(id);
                    if count >= self.config.confirm_calls {
                        committed = Some(idx);
                        break;
                    }
                    // Not confirmed yet, keep looking below.
                    continue;
                }
                // Down-switch or confident up-switch.
                committed = Some(idx);
                break;
            }

            if idx == current
                && available_bps >= bw * self.config.down_switch_floor
                && available_bps < bw
            {
                self.borderline += 1;
                if self.borderline <= self.config.confirm_calls {
                    committed = Some(idx);
                    break;
                }
                // Hysteresis exhausted, allow a lower pick.
            }
        }

        let committed = committed.unwrap_or(candidates[0]);
        let changed = committed != current;
        if changed {
            debug!(
                from = %set.representations[current].id,
                to = %set.representations[committed].id,
                available_bps,
                "representation switch"
            );
            self.borderline = 0;
            self.pending_up = None;
        } else if proposed_up.is_none() {
            // The confirmation streak only survives calls that keep
            // proposing the same candidate.
            self.pending_up = None;
        }
        set.active_representation = committed;
        changed
    }
}

/// Indices of selectable representations, ascending by bandwidth. Falls back
/// to the full list when everything was deselected, so a selection always
/// exists.
fn candidate_indices(set: &AdaptationSet) -> Vec<usize> {
    let mut candidates: Vec<usize> = set
        .representations
        .iter()
        .enumerate()
        .filter(|(_, r)| r.selected)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        candidates = (0..set.representations.len()).collect();
    }
    candidates.sort_by_key(|&i| set.representations[i].bandwidth);
    candidates
}
