//! Dynamic/static primitive classification
//!
//! Every primitive is cached either as dynamic (its pages are expected to be
//! invalidated) or as static. Any invalidation flips a primitive to dynamic;
//! after `frames_static_threshold` quiet frames it flips back and gets one
//! force-static invalidation per shadow map so the static pages receive an
//! authoritative write before they are trusted.

use crate::entry::{CacheEntryMap, PerLightCacheEntry};
use crate::frame::FrameNumber;
use crate::invalidation::{InvalidationCollector, InvalidationPayload, PAYLOAD_FLAG_FORCE_STATIC};
use crate::scene::{PersistentPrimitiveIndex, PrimitiveTable};
use void_structures::BitSet;

/// Last-invalidated stamp of a primitive with no known invalidation
pub const UNKNOWN_FRAME: FrameNumber = u32::MAX;

/// Counters from one classification pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassificationSummary {
    pub marked_dynamic: usize,
    pub removed: usize,
    pub promoted_to_static: usize,
    /// Dynamic indices that no longer map to a live primitive
    pub stale: usize,
    pub force_static_records: usize,
}

/// Persistent per-primitive caching behaviour
#[derive(Clone, Debug, Default)]
pub struct PrimitiveClassifier {
    cache_as_dynamic: BitSet,
    last_invalidated_frame: Vec<FrameNumber>,
    stale_seen: usize,
}

impl PrimitiveClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow to cover `num_primitives` persistent indices
    pub fn ensure_capacity(&mut self, num_primitives: usize) {
        self.cache_as_dynamic.ensure_len(num_primitives);
        if self.last_invalidated_frame.len() < num_primitives {
            self.last_invalidated_frame.resize(num_primitives, UNKNOWN_FRAME);
        }
    }

    /// Number of tracked persistent indices
    pub fn len(&self) -> usize {
        self.last_invalidated_frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_invalidated_frame.is_empty()
    }

    /// Whether instances of this primitive are cached as dynamic.
    /// Primitives without a persistent index always are.
    pub fn is_dynamic(&self, index: PersistentPrimitiveIndex) -> bool {
        !index.is_valid() || self.cache_as_dynamic.get(index.index())
    }

    pub fn last_invalidated_frame(&self, index: PersistentPrimitiveIndex) -> Option<FrameNumber> {
        self.last_invalidated_frame
            .get(index.index())
            .copied()
            .filter(|&frame| frame != UNKNOWN_FRAME)
    }

    /// Flag a primitive as dynamic, invalidated at `frame`
    pub fn set_dynamic(&mut self, index: PersistentPrimitiveIndex, frame: FrameNumber) {
        if !index.is_valid() {
            return;
        }
        self.ensure_capacity(index.index() + 1);
        self.cache_as_dynamic.set(index.index());
        self.last_invalidated_frame[index.index()] = frame;
    }

    /// Reset a removed primitive to "static, never invalidated"
    pub fn on_removed(&mut self, index: PersistentPrimitiveIndex) {
        let i = index.index();
        if index.is_valid() && i < self.len() {
            self.cache_as_dynamic.clear(i);
            self.last_invalidated_frame[i] = UNKNOWN_FRAME;
        }
    }

    pub fn num_dynamic(&self) -> usize {
        self.cache_as_dynamic.count_ones()
    }

    /// Dynamic bits as uploaded for the GPU invalidation pass
    pub fn as_words(&self) -> &[u64] {
        self.cache_as_dynamic.as_words()
    }

    /// Apply one collection to the table, then promote long-quiet primitives.
    ///
    /// Force-static records are appended to the collector's batch.
    pub fn update(
        &mut self,
        collector: &mut InvalidationCollector,
        frame: FrameNumber,
        frames_static_threshold: u32,
        entries: &CacheEntryMap,
        primitives: &PrimitiveTable,
    ) -> ClassificationSummary {
        let mut summary = ClassificationSummary::default();
        self.ensure_capacity(
            primitives
                .max_persistent_index()
                .max(collector.invalidated_primitives().len())
                .max(collector.removed_primitives().len()),
        );

        for index in collector.invalidated_primitives().iter_ones() {
            self.cache_as_dynamic.set(index);
            self.last_invalidated_frame[index] = frame;
            summary.marked_dynamic += 1;
        }

        for index in collector.removed_primitives().iter_ones() {
            self.cache_as_dynamic.clear(index);
            self.last_invalidated_frame[index] = UNKNOWN_FRAME;
            summary.removed += 1;
        }

        let last_invalidated = &self.last_invalidated_frame;
        let promoted: Vec<usize> = self
            .cache_as_dynamic
            .iter_ones()
            .filter(|&index| {
                let last = last_invalidated[index];
                // Unknown stamps age as "forever"
                let age = if frame >= last { frame - last } else { u32::MAX };
                age > frames_static_threshold
            })
            .collect();

        for index in promoted {
            let persistent_index = PersistentPrimitiveIndex(index as u32);
            match primitives.get(persistent_index) {
                Some(primitive) => {
                    if let Some(instances) = primitive.instances {
                        // Every light gets the final write, radius culling or not
                        for shadow_map in entries.values().flat_map(PerLightCacheEntry::shadow_maps) {
                            let Some(payload) =
                                InvalidationPayload::new(shadow_map.current_id(), PAYLOAD_FLAG_FORCE_STATIC).encode()
                            else {
                                continue;
                            };
                            collector.instances_mut().add(instances.offset, instances.count, payload);
                            summary.force_static_records += 1;
                        }
                    }
                    summary.promoted_to_static += 1;
                }
                None => {
                    // A removal was missed; treat the slot as already removed
                    if self.stale_seen == 0 {
                        log::warn!("Stale persistent primitive index {} in shadow cache classification", index);
                    } else {
                        log::debug!("Stale persistent primitive index {} in shadow cache classification", index);
                    }
                    self.stale_seen += 1;
                    self.last_invalidated_frame[index] = UNKNOWN_FRAME;
                    summary.stale += 1;
                }
            }
            self.cache_as_dynamic.clear(index);
        }

        summary
    }
}
