//! Invalidation collection
//!
//! Scene changes become instance ranges tagged with a payload naming the
//! shadow map they dirty. One [`InvalidationCollector`] is built per scene
//! update; its [`InvalidationBatch`] is the only thing handed to the GPU
//! invalidation pass.
//!
//! # Payload Layout
//!
//! ```text
//! bits 0..2   flags (FORCE_STATIC)
//! bits 2..32  shadow map id
//! ```

use crate::classifier::PrimitiveClassifier;
use crate::entry::{CacheEntryMap, PerLightCacheEntry};
use crate::scene::{BoundingSphere, InstanceRange, InvalidationBehavior, PersistentPrimitiveIndex, PrimitiveInfo};
use crate::slots::{ShadowMapId, MAX_SHADOW_MAP_SLOTS};
use void_structures::BitSet;

/// Low payload bits reserved for flags
pub const PAYLOAD_FLAG_BITS: u32 = 2;
const PAYLOAD_FLAG_MASK: u32 = (1 << PAYLOAD_FLAG_BITS) - 1;
pub const PAYLOAD_FLAG_NONE: u32 = 0;
/// Final write for a primitive that is about to be cached as static
pub const PAYLOAD_FLAG_FORCE_STATIC: u32 = 1 << 0;

/// Instances per invalidation item and per dispatch batch
pub const INVALIDATION_GROUP_SIZE: u32 = 64;

/// Decoded invalidation payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidationPayload {
    pub shadow_map_id: ShadowMapId,
    pub flags: u32,
}

impl InvalidationPayload {
    pub fn new(shadow_map_id: ShadowMapId, flags: u32) -> Self {
        Self { shadow_map_id, flags }
    }

    /// Packed payload, or `None` for ids outside the payload's id bits
    #[inline]
    pub fn encode(&self) -> Option<u32> {
        let index = self.shadow_map_id.index();
        if index >= MAX_SHADOW_MAP_SLOTS {
            return None;
        }
        Some((self.flags & PAYLOAD_FLAG_MASK) | (index << PAYLOAD_FLAG_BITS))
    }

    #[inline]
    pub fn decode(payload: u32) -> Self {
        Self {
            shadow_map_id: ShadowMapId::new(payload >> PAYLOAD_FLAG_BITS),
            flags: payload & PAYLOAD_FLAG_MASK,
        }
    }

    pub fn is_force_static(&self) -> bool {
        self.flags & PAYLOAD_FLAG_FORCE_STATIC != 0
    }
}

/// Instance range with an encoded payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidationRecord {
    pub instance_offset: u32,
    pub num_instances: u32,
    pub payload: u32,
}

impl InvalidationRecord {
    /// One past the last instance. [`InvalidationBatch::add`] keeps this within `u32`.
    #[inline]
    pub fn end(&self) -> u32 {
        self.instance_offset + self.num_instances
    }
}

/// Items `first_item..first_item + num_items` processed by one thread group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidationDispatchBatch {
    pub first_item: u32,
    pub num_items: u32,
    pub num_instances: u32,
}

/// One frame's instance invalidations
#[derive(Clone, Debug, Default)]
pub struct InvalidationBatch {
    records: Vec<InvalidationRecord>,
    items: Vec<InvalidationRecord>,
    batches: Vec<InvalidationDispatchBatch>,
    total_instances: u64,
    finalized: bool,
}

impl InvalidationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a range. Empty ranges are dropped, ranges past the end of the
    /// instance space are clamped to it.
    pub fn add(&mut self, instance_offset: u32, num_instances: u32, payload: u32) {
        debug_assert!(!self.finalized, "invalidation added after finalize");
        let num_instances = num_instances.min(u32::MAX - instance_offset);
        if num_instances == 0 {
            return;
        }
        self.records.push(InvalidationRecord {
            instance_offset,
            num_instances,
            payload,
        });
        self.total_instances += u64::from(num_instances);
    }

    /// Sort, merge and split the queued ranges into dispatch-ready batches
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }

        self.records
            .sort_unstable_by_key(|r| (r.payload, r.instance_offset, r.num_instances));

        // Merge overlapping or touching ranges that share a payload
        let mut merged: Vec<InvalidationRecord> = Vec::with_capacity(self.records.len());
        for record in &self.records {
            if let Some(last) = merged.last_mut() {
                let last_end = last.end();
                if last.payload == record.payload && record.instance_offset <= last_end {
                    last.num_instances = last_end.max(record.end()) - last.instance_offset;
                    continue;
                }
            }
            merged.push(*record);
        }

        self.items.clear();
        self.batches.clear();
        for range in merged {
            let mut offset = range.instance_offset;
            let end = range.end();
            while offset < end {
                let count = (end - offset).min(INVALIDATION_GROUP_SIZE);
                self.push_item(InvalidationRecord {
                    instance_offset: offset,
                    num_instances: count,
                    payload: range.payload,
                });
                offset += count;
            }
        }

        self.finalized = true;
    }

    fn push_item(&mut self, item: InvalidationRecord) {
        let index = self.items.len() as u32;
        self.items.push(item);
        match self.batches.last_mut() {
            Some(batch) if batch.num_instances + item.num_instances <= INVALIDATION_GROUP_SIZE => {
                batch.num_items += 1;
                batch.num_instances += item.num_instances;
            }
            _ => self.batches.push(InvalidationDispatchBatch {
                first_item: index,
                num_items: 1,
                num_instances: item.num_instances,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Queued ranges in insertion order (sorted once finalized)
    pub fn records(&self) -> &[InvalidationRecord] {
        &self.records
    }

    /// Dispatch items; empty until finalized
    pub fn items(&self) -> &[InvalidationRecord] {
        &self.items
    }

    pub fn batches(&self) -> &[InvalidationDispatchBatch] {
        &self.batches
    }

    /// Instances queued, counting overlaps
    pub fn total_num_instances(&self) -> u64 {
        self.total_instances
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Instance range queued for invalidation ahead of the next collection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceInvalidation {
    pub persistent_index: PersistentPrimitiveIndex,
    pub instances: InstanceRange,
    /// Also flag the primitive as dynamic
    pub mark_as_dynamic: bool,
}

/// Invalidations requested from outside the scene feed, applied to every light
#[derive(Clone, Debug, Default)]
pub struct GlobalInvalidations {
    ranges: Vec<InstanceInvalidation>,
}

impl GlobalInvalidations {
    /// Invalidate all instances of a primitive
    pub fn add_primitive(&mut self, primitive: &PrimitiveInfo) {
        if let Some(instances) = primitive.instances {
            self.add_instance_range(primitive.persistent_index, instances);
        }
    }

    /// Invalidate an explicit instance range
    pub fn add_instance_range(&mut self, persistent_index: PersistentPrimitiveIndex, instances: InstanceRange) {
        self.ranges.push(InstanceInvalidation {
            persistent_index,
            instances,
            mark_as_dynamic: true,
        });
    }

    pub fn ranges(&self) -> &[InstanceInvalidation] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Why a primitive is invalidating
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationCause {
    Added,
    Removed,
    Updated,
}

/// Turns one scene update into invalidation records
#[derive(Debug)]
pub struct InvalidationCollector {
    invalidated: BitSet,
    removed: BitSet,
    instances: InvalidationBatch,
    light_radius_culling: bool,
}

impl InvalidationCollector {
    /// Collector for a scene with `num_primitives` persistent slots
    pub fn new(num_primitives: usize, light_radius_culling: bool) -> Self {
        Self {
            invalidated: BitSet::new(num_primitives),
            removed: BitSet::new(num_primitives),
            instances: InvalidationBatch::new(),
            light_radius_culling,
        }
    }

    pub fn added(&mut self, entries: &CacheEntryMap, classifier: &PrimitiveClassifier, primitive: &PrimitiveInfo) {
        self.add_invalidation(entries, classifier, primitive, InvalidationCause::Added);
    }

    pub fn removed(&mut self, entries: &CacheEntryMap, classifier: &PrimitiveClassifier, primitive: &PrimitiveInfo) {
        self.add_invalidation(entries, classifier, primitive, InvalidationCause::Removed);
    }

    pub fn updated_transform(
        &mut self,
        entries: &CacheEntryMap,
        classifier: &PrimitiveClassifier,
        primitive: &PrimitiveInfo,
    ) {
        self.add_invalidation(entries, classifier, primitive, InvalidationCause::Updated);
    }

    /// Record a primitive change and fan it out to every light it may affect
    pub fn add_invalidation(
        &mut self,
        entries: &CacheEntryMap,
        classifier: &PrimitiveClassifier,
        primitive: &PrimitiveInfo,
        cause: InvalidationCause,
    ) {
        let Some(instances) = primitive.instances else {
            return;
        };
        if !primitive.flags.cast_dynamic_shadow || !primitive.persistent_index.is_valid() {
            return;
        }

        let index = primitive.persistent_index.index();
        let behavior = primitive.flags.invalidation_behavior;
        match cause {
            InvalidationCause::Removed => {
                self.mark(index, true);
            }
            InvalidationCause::Updated => {
                // Static behaviour suppresses movement invalidations entirely
                if behavior == InvalidationBehavior::Static {
                    return;
                }
                self.mark(index, false);
            }
            InvalidationCause::Added => {
                // Static meshes start static so adding them does not re-cache everything
                if primitive.flags.mesh_shape_often_moving && behavior != InvalidationBehavior::Static {
                    self.mark(index, false);
                }
            }
        }

        let cache_as_dynamic = classifier.is_dynamic(primitive.persistent_index);
        let culling_bounds = self.light_radius_culling.then_some(&primitive.bounds);
        for entry in entries.values() {
            Self::add_entry_invalidation(&mut self.instances, entry, instances, cache_as_dynamic, culling_bounds);
        }
    }

    /// Fan out global and per-light queued ranges, then clear the queues
    pub fn add_primitives_to_invalidate(
        &mut self,
        entries: &mut CacheEntryMap,
        globals: &mut GlobalInvalidations,
        classifier: &PrimitiveClassifier,
    ) {
        for entry in entries.values_mut() {
            let per_light = entry.take_pending_invalidations();
            for range in globals.ranges().iter().chain(per_light.iter()) {
                let cache_as_dynamic = self.queued_range_is_dynamic(classifier, range);
                Self::add_entry_invalidation(&mut self.instances, entry, range.instances, cache_as_dynamic, None);
            }
        }
        globals.clear();
    }

    fn queued_range_is_dynamic(&mut self, classifier: &PrimitiveClassifier, range: &InstanceInvalidation) -> bool {
        // Ranges without a persistent index are treated as dynamic
        if !range.persistent_index.is_valid() {
            return true;
        }
        let cache_as_dynamic = classifier.is_dynamic(range.persistent_index);
        if range.mark_as_dynamic {
            self.mark(range.persistent_index.index(), false);
        }
        cache_as_dynamic
    }

    fn add_entry_invalidation(
        instances: &mut InvalidationBatch,
        entry: &PerLightCacheEntry,
        range: InstanceRange,
        cache_as_dynamic: bool,
        culling_bounds: Option<&BoundingSphere>,
    ) {
        // Uncached lights re-render everything anyway
        if entry.is_uncached() {
            return;
        }
        // Receiver masks already handle dynamic primitives
        if cache_as_dynamic && entry.uses_receiver_mask() {
            return;
        }
        if let Some(bounds) = culling_bounds {
            if !entry.affects_bounds(bounds) {
                return;
            }
        }

        // One record per shadow map balances the GPU work better
        for shadow_map in entry.shadow_maps() {
            if let Some(payload) = InvalidationPayload::new(shadow_map.current_id(), PAYLOAD_FLAG_NONE).encode() {
                instances.add(range.offset, range.count, payload);
            }
        }
    }

    fn mark(&mut self, index: usize, removed: bool) {
        self.invalidated.ensure_len(index + 1);
        self.invalidated.set(index);
        if removed {
            self.removed.ensure_len(index + 1);
            self.removed.set(index);
        }
    }

    /// Primitives invalidated by this update
    pub fn invalidated_primitives(&self) -> &BitSet {
        &self.invalidated
    }

    /// Primitives removed by this update
    pub fn removed_primitives(&self) -> &BitSet {
        &self.removed
    }

    pub fn instances(&self) -> &InvalidationBatch {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut InvalidationBatch {
        &mut self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LightCacheKey, LocalLightUpdate};
    use crate::scene::ProxyFlags;
    use crate::slots::ShadowMapArray;
    use glam::{DMat4, DVec3};

    fn primitive(index: u32, center: DVec3) -> PrimitiveInfo {
        PrimitiveInfo {
            persistent_index: PersistentPrimitiveIndex(index),
            instances: Some(InstanceRange::new(index * 10, 2)),
            bounds: BoundingSphere::new(center, 1.0),
            flags: ProxyFlags::caster(),
        }
    }

    /// A cached light at the origin with radius 10 and `num_maps` shadow maps
    fn cached_entry(num_maps: usize, use_receiver_mask: bool) -> PerLightCacheEntry {
        let mut entry = PerLightCacheEntry::new(num_maps);
        let update = LocalLightUpdate {
            pre_shadow_translation: DVec3::ZERO,
            world_to_light: DMat4::IDENTITY,
            light_origin: DVec3::ZERO,
            light_radius: 10.0,
            is_distant: false,
            force_invalidate: false,
            allow_invalidation: true,
            use_receiver_mask,
        };
        for frame in 0..3 {
            let mut array = ShadowMapArray::new();
            entry.update_local(&update);
            let base = array.allocate(false, num_maps as u32).unwrap();
            for i in 0..num_maps {
                entry.update_shadow_map(i, &mut array, base.offset(i as u32));
            }
            entry.mark_rendered(frame);
        }
        entry
    }

    fn entries_with(entry: PerLightCacheEntry) -> CacheEntryMap {
        let mut entries = CacheEntryMap::new();
        entries.insert(LightCacheKey::new(0, 1, 0), entry);
        entries
    }

    #[test]
    fn test_payload_encoding() {
        let payload = InvalidationPayload::new(ShadowMapId::new(37), PAYLOAD_FLAG_FORCE_STATIC);
        let encoded = payload.encode().unwrap();
        assert_eq!(encoded, 1 | (37 << 2));
        let decoded = InvalidationPayload::decode(encoded);
        assert_eq!(decoded, payload);
        assert!(decoded.is_force_static());
    }

    #[test]
    fn test_payload_rejects_ids_past_id_bits() {
        let last = ShadowMapId::new(MAX_SHADOW_MAP_SLOTS - 1);
        let encoded = InvalidationPayload::new(last, PAYLOAD_FLAG_NONE).encode().unwrap();
        assert_eq!(InvalidationPayload::decode(encoded).shadow_map_id, last);

        assert_eq!(InvalidationPayload::new(ShadowMapId::new(MAX_SHADOW_MAP_SLOTS), 0).encode(), None);
        assert_eq!(InvalidationPayload::new(ShadowMapId::NONE, 0).encode(), None);
    }

    #[test]
    fn test_ranges_at_end_of_instance_space() {
        let mut batch = InvalidationBatch::new();
        batch.add(u32::MAX - 10, 100, 4);
        batch.add(u32::MAX - 4, 4, 4);
        batch.add(u32::MAX, 5, 4);
        batch.finalize();

        let items = batch.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].instance_offset, u32::MAX - 10);
        assert_eq!(items[0].num_instances, 10);
        assert_eq!(items[0].end(), u32::MAX);
    }

    #[test]
    fn test_finalize_merges_and_splits() {
        let mut batch = InvalidationBatch::new();
        batch.add(100, 50, 4);
        batch.add(0, 10, 4);
        batch.add(10, 90, 4);
        batch.add(0, 10, 8);
        batch.add(5, 0, 8);
        batch.finalize();

        // [0, 150) for payload 4 splits into 64 + 64 + 22; payload 8 keeps its 10
        let counts: Vec<_> = batch.items().iter().map(|i| (i.payload, i.instance_offset, i.num_instances)).collect();
        assert_eq!(counts, vec![(4, 0, 64), (4, 64, 64), (4, 128, 22), (8, 0, 10)]);

        assert!(batch.batches().iter().all(|b| b.num_instances <= INVALIDATION_GROUP_SIZE));
        let items_in_batches: u32 = batch.batches().iter().map(|b| b.num_items).sum();
        assert_eq!(items_in_batches as usize, batch.items().len());
        // The 22 and 10 instance items share a group
        assert_eq!(batch.batches().len(), 3);
    }

    #[test]
    fn test_empty_batch() {
        let mut batch = InvalidationBatch::new();
        batch.finalize();
        assert!(batch.is_empty());
        assert!(batch.batches().is_empty());
    }

    #[test]
    fn test_updated_primitive_fans_out_per_shadow_map() {
        let entries = entries_with(cached_entry(6, false));
        let classifier = PrimitiveClassifier::new();
        let mut collector = InvalidationCollector::new(8, true);

        collector.updated_transform(&entries, &classifier, &primitive(2, DVec3::new(3.0, 0.0, 0.0)));
        assert_eq!(collector.instances().records().len(), 6);
        assert!(collector.invalidated_primitives().get(2));
        assert!(!collector.removed_primitives().get(2));
    }

    #[test]
    fn test_removed_primitive_fans_out_regardless_of_behavior() {
        let entries = entries_with(cached_entry(3, false));
        let classifier = PrimitiveClassifier::new();
        let mut collector = InvalidationCollector::new(8, true);

        let mut pinned = primitive(2, DVec3::new(3.0, 0.0, 0.0));
        pinned.flags.invalidation_behavior = InvalidationBehavior::Static;
        collector.removed(&entries, &classifier, &pinned);

        let records = collector.instances().records();
        assert_eq!(records.len(), 3);
        let mut ids: Vec<_> = records
            .iter()
            .map(|r| InvalidationPayload::decode(r.payload))
            .inspect(|p| assert!(!p.is_force_static()))
            .map(|p| p.shadow_map_id)
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(records.iter().all(|r| r.instance_offset == 20 && r.num_instances == 2));
        assert!(collector.invalidated_primitives().get(2));
        assert!(collector.removed_primitives().get(2));
    }

    #[test]
    fn test_radius_culling() {
        let entries = entries_with(cached_entry(1, false));
        let classifier = PrimitiveClassifier::new();

        let far = primitive(1, DVec3::new(100.0, 0.0, 0.0));
        let mut collector = InvalidationCollector::new(8, true);
        collector.updated_transform(&entries, &classifier, &far);
        assert!(collector.instances().is_empty());
        // Still recorded as moving
        assert!(collector.invalidated_primitives().get(1));

        let mut collector = InvalidationCollector::new(8, false);
        collector.updated_transform(&entries, &classifier, &far);
        assert_eq!(collector.instances().records().len(), 1);
    }

    #[test]
    fn test_uncached_light_skipped() {
        let mut entries = entries_with(PerLightCacheEntry::new(1));
        for entry in entries.values_mut() {
            entry.update_local(&LocalLightUpdate {
                pre_shadow_translation: DVec3::ZERO,
                world_to_light: DMat4::IDENTITY,
                light_origin: DVec3::ZERO,
                light_radius: 10.0,
                is_distant: false,
                force_invalidate: true,
                allow_invalidation: true,
                use_receiver_mask: false,
            });
        }
        let classifier = PrimitiveClassifier::new();
        let mut collector = InvalidationCollector::new(8, true);
        collector.updated_transform(&entries, &classifier, &primitive(0, DVec3::ZERO));
        assert!(collector.instances().is_empty());
    }

    #[test]
    fn test_receiver_mask_skips_dynamic_primitives() {
        let entries = entries_with(cached_entry(1, true));
        let mut classifier = PrimitiveClassifier::new();
        classifier.ensure_capacity(8);
        classifier.set_dynamic(PersistentPrimitiveIndex(4), 0);

        let mut collector = InvalidationCollector::new(8, true);
        collector.updated_transform(&entries, &classifier, &primitive(4, DVec3::ZERO));
        assert!(collector.instances().is_empty());

        collector.updated_transform(&entries, &classifier, &primitive(5, DVec3::ZERO));
        assert_eq!(collector.instances().records().len(), 1);
    }

    #[test]
    fn test_causes() {
        let entries = CacheEntryMap::new();
        let classifier = PrimitiveClassifier::new();
        let mut collector = InvalidationCollector::new(8, true);

        collector.removed(&entries, &classifier, &primitive(0, DVec3::ZERO));
        assert!(collector.invalidated_primitives().get(0));
        assert!(collector.removed_primitives().get(0));

        // Plain static mesh added: no dynamic marking
        collector.added(&entries, &classifier, &primitive(1, DVec3::ZERO));
        assert!(!collector.invalidated_primitives().get(1));

        let mut often_moving = primitive(2, DVec3::ZERO);
        often_moving.flags.mesh_shape_often_moving = true;
        collector.added(&entries, &classifier, &often_moving);
        assert!(collector.invalidated_primitives().get(2));

        let mut forced_static = primitive(3, DVec3::ZERO);
        forced_static.flags.invalidation_behavior = InvalidationBehavior::Static;
        collector.updated_transform(&entries, &classifier, &forced_static);
        assert!(!collector.invalidated_primitives().get(3));

        let mut no_shadow = primitive(4, DVec3::ZERO);
        no_shadow.flags.cast_dynamic_shadow = false;
        collector.removed(&entries, &classifier, &no_shadow);
        assert!(!collector.removed_primitives().get(4));

        let mut unallocated = primitive(5, DVec3::ZERO);
        unallocated.instances = None;
        collector.updated_transform(&entries, &classifier, &unallocated);
        assert!(!collector.invalidated_primitives().get(5));
    }

    #[test]
    fn test_queued_ranges_fan_out_and_clear() {
        let mut entries = entries_with(cached_entry(2, false));
        let classifier = PrimitiveClassifier::new();
        let mut globals = GlobalInvalidations::default();
        globals.add_instance_range(PersistentPrimitiveIndex(3), InstanceRange::new(30, 4));
        globals.add_instance_range(PersistentPrimitiveIndex::INVALID, InstanceRange::new(90, 1));

        let config = crate::config::CacheConfig::default();
        let mut revealed = primitive(6, DVec3::ZERO);
        revealed.instances = Some(InstanceRange::new(60, 1));
        for entry in entries.values_mut() {
            entry.on_primitive_rendered(&revealed, true, &config);
        }

        let mut collector = InvalidationCollector::new(8, true);
        collector.add_primitives_to_invalidate(&mut entries, &mut globals, &classifier);

        // Three ranges times two shadow maps
        assert_eq!(collector.instances().records().len(), 6);
        assert!(collector.invalidated_primitives().get(3));
        // Revealed primitives are not marked as moving
        assert!(!collector.invalidated_primitives().get(6));
        assert!(globals.is_empty());
        assert!(entries.values().all(|e| e.pending_invalidations().is_empty()));
    }
}
