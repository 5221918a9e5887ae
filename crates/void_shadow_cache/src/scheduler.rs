//! Distant light time slicing
//!
//! Fully cached distant lights are normally reused untouched. Each frame the
//! scheduler picks the few that have gone longest without a refresh and
//! stamps them so the render stage draws them for real.
//!
//! Selection runs on a background task over a snapshot of the entries. The
//! stamp lands when the task is joined, so everything that reads
//! `last_scheduled_frame` or mutates the entry set joins first.

use crate::entry::{CacheEntryMap, LightCacheKey};
use crate::frame::FrameNumber;
use crate::task::FrameTask;
use std::cmp::Reverse;
use void_structures::BoundedHeap;

/// What selection needs to know about one eligible light
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistantLightCandidate {
    pub key: LightCacheKey,
    pub last_scheduled_frame: i64,
}

/// Snapshot the lights eligible for a forced refresh
pub fn collect_candidates(entries: &CacheEntryMap) -> Vec<DistantLightCandidate> {
    entries
        .iter()
        .filter(|(_, entry)| entry.is_distant() && entry.is_fully_cached())
        .map(|(key, entry)| DistantLightCandidate {
            key: *key,
            last_scheduled_frame: entry.last_scheduled_frame(),
        })
        .collect()
}

/// Pick at most `max_to_update` candidates with the largest age, oldest first.
///
/// Equal ages prefer the smaller key so the result does not depend on
/// iteration order.
pub fn select_distant_lights(
    candidates: &[DistantLightCandidate],
    frame: FrameNumber,
    max_to_update: usize,
) -> Vec<LightCacheKey> {
    let mut heap = BoundedHeap::new(max_to_update);
    for candidate in candidates {
        let age = i64::from(frame) - candidate.last_scheduled_frame;
        heap.push((age, Reverse(candidate.key)));
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|(_, Reverse(key))| key)
        .collect()
}

struct PendingSelection {
    frame: FrameNumber,
    task: FrameTask<Vec<LightCacheKey>>,
}

/// Owner of the in-flight selection task
#[derive(Default)]
pub struct DistantLightScheduler {
    pending: Option<PendingSelection>,
    last_scheduled: usize,
}

impl DistantLightScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start selecting this frame's refreshes.
    ///
    /// Joins any previous selection first. With `max_to_update == 0` nothing is
    /// started and no entry is ever stamped.
    pub fn kick(&mut self, entries: &mut CacheEntryMap, frame: FrameNumber, max_to_update: u32) {
        self.wait(entries);
        self.last_scheduled = 0;
        if max_to_update == 0 {
            return;
        }

        let candidates = collect_candidates(entries);
        if candidates.is_empty() {
            return;
        }
        let max_to_update = max_to_update as usize;
        let task = FrameTask::spawn("distant-light-scheduling", move || {
            select_distant_lights(&candidates, frame, max_to_update)
        });
        self.pending = Some(PendingSelection { frame, task });
    }

    /// Join the selection and stamp the chosen entries. Returns how many were stamped.
    pub fn wait(&mut self, entries: &mut CacheEntryMap) -> usize {
        let Some(PendingSelection { frame, task }) = self.pending.take() else {
            return 0;
        };
        let selected = match task.wait() {
            Ok(selected) => selected,
            Err(err) => {
                log::error!("{}; no distant lights refreshed this frame", err);
                return 0;
            }
        };

        let mut stamped = 0;
        for key in &selected {
            // Entries removed since the snapshot are skipped
            if let Some(entry) = entries.get_mut(key) {
                entry.mark_scheduled(frame);
                stamped += 1;
            }
        }
        log::debug!("Scheduled {} distant lights for frame {}", stamped, frame);
        self.last_scheduled = stamped;
        stamped
    }

    /// Whether a selection is still in flight
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Lights stamped by the last joined selection
    pub fn last_scheduled_count(&self) -> usize {
        self.last_scheduled
    }
}

impl core::fmt::Debug for DistantLightScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DistantLightScheduler")
            .field("pending_frame", &self.pending.as_ref().map(|p| p.frame))
            .field("last_scheduled", &self.last_scheduled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LocalLightUpdate, PerLightCacheEntry};
    use crate::frame::NEVER;
    use crate::slots::ShadowMapArray;
    use glam::{DMat4, DVec3};

    fn candidate(light_id: u32, last_scheduled_frame: i64) -> DistantLightCandidate {
        DistantLightCandidate {
            key: LightCacheKey::new(0, light_id, 0),
            last_scheduled_frame,
        }
    }

    fn distant_update() -> LocalLightUpdate {
        LocalLightUpdate {
            pre_shadow_translation: DVec3::ZERO,
            world_to_light: DMat4::IDENTITY,
            light_origin: DVec3::ZERO,
            light_radius: 10.0,
            is_distant: true,
            force_invalidate: false,
            allow_invalidation: false,
            use_receiver_mask: false,
        }
    }

    /// Entries for `count` distant lights that have been rendered long enough to be fully cached
    fn cached_distant_entries(count: u32) -> CacheEntryMap {
        let mut entries = CacheEntryMap::new();
        for light_id in 0..count {
            entries.insert(LightCacheKey::new(0, light_id, 0), PerLightCacheEntry::new(1));
        }
        for frame in 0..3 {
            let mut array = ShadowMapArray::new();
            for entry in entries.values_mut() {
                entry.update_local(&distant_update());
                let id = array.allocate(true, 1).unwrap();
                entry.update_shadow_map(0, &mut array, id);
                entry.mark_rendered(frame);
            }
        }
        for entry in entries.values_mut() {
            entry.update_local(&distant_update());
        }
        entries
    }

    #[test]
    fn test_selects_oldest() {
        let candidates = [candidate(1, 10), candidate(2, NEVER), candidate(3, 5), candidate(4, 19)];
        let selected = select_distant_lights(&candidates, 20, 2);
        assert_eq!(selected, vec![LightCacheKey::new(0, 2, 0), LightCacheKey::new(0, 3, 0)]);
    }

    #[test]
    fn test_ties_prefer_smaller_key() {
        let candidates = [candidate(7, NEVER), candidate(3, NEVER), candidate(5, NEVER)];
        let selected = select_distant_lights(&candidates, 0, 2);
        assert_eq!(selected, vec![LightCacheKey::new(0, 3, 0), LightCacheKey::new(0, 5, 0)]);
    }

    #[test]
    fn test_zero_selects_nothing() {
        let candidates = [candidate(1, NEVER)];
        assert!(select_distant_lights(&candidates, 4, 0).is_empty());
    }

    #[test]
    fn test_only_fully_cached_distant_lights() {
        let mut entries = cached_distant_entries(2);
        entries.insert(LightCacheKey::new(0, 9, 0), PerLightCacheEntry::new(1));
        let candidates = collect_candidates(&entries);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.key.light_id < 2));
    }

    #[test]
    fn test_wait_stamps_selected() {
        let mut entries = cached_distant_entries(3);
        let mut scheduler = DistantLightScheduler::new();

        scheduler.kick(&mut entries, 3, 1);
        assert!(scheduler.is_pending());
        assert_eq!(scheduler.wait(&mut entries), 1);
        assert!(!scheduler.is_pending());

        // All were never scheduled; the smallest key wins the tie
        let first = &entries[&LightCacheKey::new(0, 0, 0)];
        assert_eq!(first.last_scheduled_frame(), 3);
        assert_eq!(entries[&LightCacheKey::new(0, 1, 0)].last_scheduled_frame(), NEVER);
    }

    #[test]
    fn test_zero_budget_never_stamps() {
        let mut entries = cached_distant_entries(2);
        let mut scheduler = DistantLightScheduler::new();
        for frame in 3..10 {
            scheduler.kick(&mut entries, frame, 0);
            assert!(!scheduler.is_pending());
            assert_eq!(scheduler.wait(&mut entries), 0);
        }
        assert!(entries.values().all(|e| e.last_scheduled_frame() == NEVER));
    }

    #[test]
    fn test_removed_entry_skipped() {
        let mut entries = cached_distant_entries(1);
        let mut scheduler = DistantLightScheduler::new();
        scheduler.kick(&mut entries, 3, 4);
        entries.clear();
        assert_eq!(scheduler.wait(&mut entries), 0);
    }
}
