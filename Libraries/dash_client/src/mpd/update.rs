//! Live manifest refresh: re-parse and merge into the existing model while
//! preserving playback state (selections, active representations) and never
//! rewinding a timeline the fetchers have already walked.

use tracing::{debug, warn};

use crate::error::DashError;
use crate::mpd::{parser, Addressing, AdaptationSet, Manifest, Period, Representation};

impl Manifest {
    /// Applies a freshly downloaded manifest document.
    ///
    /// Returns `Ok(false)` without touching the model when the bytes are
    /// identical to the previous document, `Ok(true)` when the model changed.
    /// Periods are matched by id; within a matched period, representations
    /// are matched by id and their segment timelines are extended with the
    /// entries the server appended since the last refresh.
    pub fn update(&mut self, bytes: &[u8]) -> Result<bool, DashError> {
        let hash = parser::content_hash(bytes);
        if hash == self.content_hash {
            self.unchanged_updates += 1;
            debug!(
                consecutive = self.unchanged_updates,
                "manifest refresh returned unchanged document"
            );
            return Ok(false);
        }

        let fresh = parser::parse_mpd(bytes)?;

        self.duration_us = fresh.duration_us;
        self.dynamic = fresh.dynamic;
        self.min_buffer_time_us = fresh.min_buffer_time_us;
        self.minimum_update_period_us = fresh.minimum_update_period_us;
        self.availability_start_time = fresh.availability_start_time;
        self.base_url = fresh.base_url;
        self.protections = fresh.protections;

        for fresh_period in fresh.periods {
            match self.periods.iter_mut().find(|p| p.id == fresh_period.id) {
                Some(existing) => merge_period(existing, fresh_period),
                None => {
                    debug!(id = %fresh_period.id, "manifest update added period");
                    self.periods.push(fresh_period);
                }
            }
        }

        self.content_hash = hash;
        self.unchanged_updates = 0;
        Ok(true)
    }
}

/// Merges a re-parsed period into the live one. Adaptation sets are matched
/// by track type and language; old sets the server no longer advertises are
/// dropped, new ones appended. The previously selected set of each track type
/// is re-selected when it survives the merge.
fn merge_period(existing: &mut Period, fresh: Period) {
    existing.start_us = fresh.start_us;
    existing.duration_us = fresh.duration_us;
    existing.base_url = fresh.base_url;

    // Remember what was selected so indices can be re-resolved afterwards.
    let selected_keys: Vec<Option<(crate::mpd::TrackType, String)>> = existing
        .selected_adaptation
        .iter()
        .map(|&idx| {
            if idx < 0 {
                None
            } else {
                existing
                    .adaptation_sets
                    .get(idx as usize)
                    .map(|s| (s.track_type, s.lang.clone()))
            }
        })
        .collect();

    let old_sets = std::mem::take(&mut existing.adaptation_sets);
    let mut merged = Vec::with_capacity(old_sets.len());
    let mut old_sets: Vec<Option<AdaptationSet>> = old_sets.into_iter().map(Some).collect();

    for fresh_set in fresh.adaptation_sets {
        let matched = old_sets.iter_mut().find_map(|slot| {
            let matches = slot
                .as_ref()
                .map(|s| s.track_type == fresh_set.track_type && s.lang == fresh_set.lang)
                .unwrap_or(false);
            if matches {
                slot.take()
            } else {
                None
            }
        });
        match matched {
            Some(old_set) => merged.push(merge_adaptation_set(old_set, fresh_set)),
            None => merged.push(fresh_set),
        }
    }
    for dropped in old_sets.into_iter().flatten() {
        warn!(
            track = ?dropped.track_type,
            lang = %dropped.lang,
            "manifest update dropped adaptation set"
        );
    }
    existing.adaptation_sets = merged;

    existing.select_default_adaptations();
    for (slot, key) in selected_keys.iter().enumerate() {
        if let Some((track, lang)) = key {
            if let Some(idx) = existing
                .adaptation_sets
                .iter()
                .position(|s| s.track_type == *track && s.lang == *lang)
            {
                existing.selected_adaptation[slot] = idx as i32;
            }
        }
    }
}

fn merge_adaptation_set(mut old: AdaptationSet, mut fresh: AdaptationSet) -> AdaptationSet {
    let old_active_id = old
        .representations
        .get(old.active_representation)
        .map(|r| r.id.clone());

    let old_reps = std::mem::take(&mut old.representations);
    let mut old_reps: Vec<Option<Representation>> = old_reps.into_iter().map(Some).collect();

    let fresh_reps = std::mem::take(&mut fresh.representations);
    let mut merged = Vec::with_capacity(fresh_reps.len());
    for fresh_rep in fresh_reps {
        let matched = old_reps.iter_mut().find_map(|slot| {
            if slot.as_ref().map(|r| r.id == fresh_rep.id).unwrap_or(false) {
                slot.take()
            } else {
                None
            }
        });
        match matched {
            Some(old_rep) => merged.push(merge_representation(old_rep, fresh_rep)),
            None => merged.push(fresh_rep),
        }
    }

    let mut set = fresh;
    set.representations = merged;
    set.active_representation = old_active_id
        .and_then(|id| set.representations.iter().position(|r| r.id == id))
        .unwrap_or(0)
        .min(set.representations.len().saturating_sub(1));
    set
}

/// The old representation keeps its identity and selection state; only the
/// segment timeline grows. Entries the server dropped from its window stay in
/// the model so in-flight fetch positions remain valid.
fn merge_representation(mut old: Representation, fresh: Representation) -> Representation {
    old.bandwidth = fresh.bandwidth;
    old.kind = fresh.kind;

    if let (Addressing::Template(old_t), Addressing::Template(fresh_t)) =
        (&mut old.addressing, &fresh.addressing)
    {
        match (&mut old_t.timeline, &fresh_t.timeline) {
            (Some(old_tl), Some(fresh_tl)) => {
                let last_end = old_tl.last().map(|e| e.end_ticks()).unwrap_or(0);
                let appended = fresh_tl
                    .iter()
                    .filter(|e| e.start_ticks >= last_end)
                    .copied();
                old_tl.extend(appended);
            }
            (old_tl @ None, Some(fresh_tl)) => *old_tl = Some(fresh_tl.clone()),
            _ => {}
        }
        old_t.initialization = fresh_t.initialization.clone();
        old_t.media = fresh_t.media.clone();
        old_t.duration_ticks = fresh_t.duration_ticks;
    } else if matches!(old.addressing, Addressing::Base(_)) {
        old.addressing = fresh.addressing;
    }
    old
}
