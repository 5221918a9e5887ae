//! Shadow Cache Manager
//!
//! Owns every piece of cross-frame shadow state: the per-light entries, the
//! primitive classification, the light mobility and distant light tasks, the
//! pool descriptors and the feedback-driven diagnostics. All per-frame entry
//! points absorb errors; a frame degrades, it never fails.
//!
//! # Frame Flow
//!
//! ```text
//! begin_frame ─► process_scene_changes ─► find_create_entry / update_*
//!     ─► update_unreferenced_entries ─► kick_distant_light_scheduling
//!     ─► (render) ─► wait_distant_light_scheduling ─► extract_frame_data
//! ```

use crate::backend::{InvalidationParams, ShadowBackend};
use crate::classifier::PrimitiveClassifier;
use crate::config::CacheConfig;
use crate::diagnostics::{CacheStats, OverflowFlags, OverflowTracker};
use crate::entry::{CacheEntryMap, LightCacheKey, PerLightCacheEntry};
use crate::frame::{FrameNumber, NEVER};
use crate::invalidation::{GlobalInvalidations, InvalidationCollector};
use crate::mobility::{interpolate_resolution_bias, LightMobilityTracker};
use crate::pool::{
    DynamicResolution, HzbFormat, HzbPoolDesc, PageManagementFeedback, PhysicalPoolDesc, PoolChange, PoolState,
};
use crate::scene::{LightId, LightUpdate, PrimitiveInfo, PrimitiveTable, SceneChanges};
use crate::scheduler::DistantLightScheduler;
use crate::slots::ShadowMapArray;
use glam::UVec2;
use std::time::Instant;

/// What survived from the previous render
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PrevFrameData {
    page_table: bool,
    cache_buffers: bool,
    num_full_shadow_maps: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct SubmissionStats {
    records: u32,
    instances: u64,
    batches: u32,
}

/// Cross-frame shadow cache
pub struct ShadowCacheManager {
    config: CacheConfig,
    backend: Box<dyn ShadowBackend>,
    frame: FrameNumber,
    entries: CacheEntryMap,
    primitives: PrimitiveTable,
    classifier: PrimitiveClassifier,
    global_invalidations: GlobalInvalidations,
    mobility: LightMobilityTracker,
    scheduler: DistantLightScheduler,
    physical_pool: PoolState<PhysicalPoolDesc>,
    hzb_pool: PoolState<HzbPoolDesc>,
    prev: PrevFrameData,
    dynamic_resolution: DynamicResolution,
    overflow: OverflowTracker,
    last_submission: SubmissionStats,
    created_at: Instant,
}

impl ShadowCacheManager {
    /// Create a manager. The configuration is validated first.
    pub fn new(config: CacheConfig, backend: Box<dyn ShadowBackend>) -> Self {
        let config = config.validated();
        Self {
            mobility: LightMobilityTracker::new(config.light_active_frame_count),
            config,
            backend,
            frame: 0,
            entries: CacheEntryMap::new(),
            primitives: PrimitiveTable::new(),
            classifier: PrimitiveClassifier::new(),
            global_invalidations: GlobalInvalidations::default(),
            scheduler: DistantLightScheduler::new(),
            physical_pool: PoolState::new(),
            hzb_pool: PoolState::new(),
            prev: PrevFrameData::default(),
            dynamic_resolution: DynamicResolution::new(),
            overflow: OverflowTracker::new(),
            last_submission: SubmissionStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Replace the configuration at runtime
    pub fn set_config(&mut self, config: CacheConfig) {
        let config = config.validated();
        if config.light_active_frame_count != self.config.light_active_frame_count {
            self.mobility.set_active_frame_count(config.light_active_frame_count);
        }
        self.config = config;
    }

    // ========================================================================
    // Frame
    // ========================================================================

    /// Scene frame number used for every stamp until the next call
    pub fn begin_frame(&mut self, frame: FrameNumber) {
        self.frame = frame;
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Keep what the render produced for the next frame.
    ///
    /// A render without allocated shadow data keeps the previous buffers.
    /// Without persistent data everything is dropped, pools included.
    pub fn extract_frame_data(&mut self, array: &ShadowMapArray, allow_persistent_data: bool) {
        self.wait_distant_light_scheduling();

        let new_shadow_data = array.is_allocated();
        if !allow_persistent_data || new_shadow_data {
            self.prev = PrevFrameData::default();
        }

        if !allow_persistent_data {
            self.free_physical_pool();
            self.free_hzb_pool();
        } else if new_shadow_data {
            // The page table is needed by next frame's HZB even without caching
            self.prev.page_table = true;
            if self.config.enabled {
                self.prev.cache_buffers = true;
                self.prev.num_full_shadow_maps = array.num_full_shadow_maps();
            }
        }

        for entry in self.entries.values_mut() {
            entry.clear_referenced();
        }
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Entry for `key`, created if missing or if its shadow map count changed
    pub fn find_create_entry(&mut self, key: LightCacheKey, num_shadow_maps: usize) -> &mut PerLightCacheEntry {
        self.wait_distant_light_scheduling();

        if let Some(existing) = self.entries.get(&key) {
            if existing.num_shadow_maps() != num_shadow_maps {
                log::info!(
                    "Shadow cache invalidated for light {} due to shadow map count change ({} -> {})",
                    key.light_id,
                    existing.num_shadow_maps(),
                    num_shadow_maps
                );
                self.entries.remove(&key);
            }
        }

        let frame = self.frame;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| PerLightCacheEntry::new(num_shadow_maps));
        entry.mark_referenced(frame);
        entry
    }

    /// Existing entry, without marking it referenced
    pub fn find_entry(&mut self, key: &LightCacheKey) -> Option<&mut PerLightCacheEntry> {
        self.wait_distant_light_scheduling();
        self.entries.get_mut(key)
    }

    /// Read-only entry lookup
    pub fn entry(&self, key: &LightCacheKey) -> Option<&PerLightCacheEntry> {
        self.debug_assert_scheduling_joined();
        self.entries.get(key)
    }

    /// All entries in key order
    pub fn entries(&self) -> impl Iterator<Item = (&LightCacheKey, &PerLightCacheEntry)> {
        self.debug_assert_scheduling_joined();
        self.entries.iter()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Keep recently used lights alive on fresh ids and drop the rest
    pub fn update_unreferenced_entries(&mut self, array: &mut ShadowMapArray) {
        self.wait_distant_light_scheduling();

        let frame = self.frame;
        let max_age = i32::try_from(self.config.max_light_age).unwrap_or(i32::MAX);
        let mut evicted = 0usize;
        self.entries.retain(|key, entry| {
            if entry.referenced_this_render() {
                return true;
            }
            let age = frame.wrapping_sub(entry.last_referenced_frame()) as i32;
            if age > max_age {
                evicted += 1;
                return false;
            }
            match entry.reallocate(array) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("Dropping unreferenced shadow cache entry for light {}: {}", key.light_id, err);
                    false
                }
            }
        });
        if evicted > 0 {
            log::debug!("Evicted {} shadow cache entries at frame {}", evicted, frame);
        }
    }

    /// Forget lights removed from the scene
    pub fn process_removed_lights(&mut self, light_ids: &[LightId]) {
        if light_ids.is_empty() {
            return;
        }
        self.mobility.wait();
        self.wait_distant_light_scheduling();

        let before = self.entries.len();
        self.entries.retain(|key, _| !light_ids.contains(&key.light_id));
        for &light_id in light_ids {
            self.mobility.remove_light(light_id);
        }
        log::debug!(
            "Removed {} lights, {} shadow cache entries dropped",
            light_ids.len(),
            before - self.entries.len()
        );
    }

    // ========================================================================
    // Scene
    // ========================================================================

    /// Apply one scene update.
    ///
    /// Removals and the old state of updated primitives are invalidated before
    /// the table changes, additions and the new state afterwards.
    pub fn process_scene_changes(&mut self, changes: &SceneChanges) {
        self.wait_distant_light_scheduling();
        self.last_submission = SubmissionStats::default();

        if !self.invalidations_enabled() {
            for index in &changes.removed {
                self.primitives.remove(*index);
                self.classifier.on_removed(*index);
            }
            for primitive in changes.added.iter().chain(&changes.updated) {
                self.primitives.insert(primitive.clone());
            }
            self.discard_queued_invalidations();
            return;
        }

        let culling = self.config.light_radius_culling;

        let mut collector = InvalidationCollector::new(self.primitives.max_persistent_index(), culling);
        for index in &changes.always_invalidating {
            if let Some(primitive) = self.primitives.get(*index) {
                collector.updated_transform(&self.entries, &self.classifier, primitive);
            }
        }
        for index in &changes.removed {
            if let Some(primitive) = self.primitives.get(*index) {
                collector.removed(&self.entries, &self.classifier, primitive);
            }
        }
        for primitive in &changes.updated {
            if let Some(previous) = self.primitives.get(primitive.persistent_index) {
                collector.updated_transform(&self.entries, &self.classifier, previous);
            }
        }
        self.process_invalidations(collector);

        for index in &changes.removed {
            self.primitives.remove(*index);
            self.classifier.on_removed(*index);
        }
        for primitive in changes.added.iter().chain(&changes.updated) {
            self.primitives.insert(primitive.clone());
        }

        let mut collector = InvalidationCollector::new(self.primitives.max_persistent_index(), culling);
        for primitive in &changes.added {
            collector.added(&self.entries, &self.classifier, primitive);
        }
        for primitive in &changes.updated {
            collector.updated_transform(&self.entries, &self.classifier, primitive);
        }
        self.process_invalidations(collector);
    }

    /// Invalidations not tied to a scene change, applied to every light
    pub fn global_invalidations(&mut self) -> &mut GlobalInvalidations {
        &mut self.global_invalidations
    }

    /// The render stage drew `primitive` into `key`'s shadow maps
    pub fn on_primitive_rendered(&mut self, key: &LightCacheKey, primitive: &PrimitiveInfo, revealed: bool) {
        self.wait_distant_light_scheduling();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.on_primitive_rendered(primitive, revealed, &self.config);
        }
    }

    /// Live primitives known to the cache
    pub fn primitives(&self) -> &PrimitiveTable {
        &self.primitives
    }

    pub fn classifier(&self) -> &PrimitiveClassifier {
        &self.classifier
    }

    /// Dynamic classification bits uploaded for the invalidation kernels
    pub fn cache_primitive_as_dynamic_words(&self) -> &[u64] {
        self.classifier.as_words()
    }

    /// Single-page maps are refreshed by the distant light scheduler instead
    fn invalidations_enabled(&self) -> bool {
        self.is_cache_data_available() && self.prev.num_full_shadow_maps > 0
    }

    fn discard_queued_invalidations(&mut self) {
        self.global_invalidations.clear();
        for entry in self.entries.values_mut() {
            entry.clear_pending_invalidations();
        }
    }

    fn process_invalidations(&mut self, mut collector: InvalidationCollector) {
        collector.add_primitives_to_invalidate(&mut self.entries, &mut self.global_invalidations, &self.classifier);

        let summary = self.classifier.update(
            &mut collector,
            self.frame,
            self.config.frames_static_threshold,
            &self.entries,
            &self.primitives,
        );
        if summary.promoted_to_static > 0 {
            log::debug!(
                "{} primitives cached as static at frame {}",
                summary.promoted_to_static,
                self.frame
            );
        }

        let batch = collector.instances_mut();
        batch.finalize();
        if batch.is_empty() {
            return;
        }

        let params = InvalidationParams {
            use_hzb: self.config.invalidate_use_hzb && self.is_hzb_data_available(),
        };
        log::debug!(
            "Submitting {} invalidation items in {} batches",
            batch.items().len(),
            batch.batches().len()
        );
        self.backend.submit_invalidations(batch, &params);

        self.last_submission.records += batch.items().len() as u32;
        self.last_submission.instances += batch.total_num_instances();
        self.last_submission.batches += batch.batches().len() as u32;
    }

    // ========================================================================
    // Light Mobility
    // ========================================================================

    pub fn update_light_mobility(&mut self, added: &[LightUpdate], moved: &[LightUpdate]) {
        self.mobility.update(added, moved);
    }

    /// Mobility factor of a light. The decay task must have been joined.
    pub fn light_mobility_factor(&self, light_id: LightId) -> f32 {
        self.mobility.mobility_factor(light_id)
    }

    /// Resolution bias of a light between its static and moving settings
    pub fn light_resolution_bias(&self, light_id: LightId, non_moving_bias: f32, moving_bias: f32) -> f32 {
        interpolate_resolution_bias(non_moving_bias, moving_bias, self.light_mobility_factor(light_id))
    }

    /// Start this frame's mobility decay in the background
    pub fn advance_light_mobility(&mut self) {
        self.mobility.advance_frame();
    }

    pub fn wait_light_mobility(&mut self) {
        self.mobility.wait();
    }

    // ========================================================================
    // Distant Light Scheduling
    // ========================================================================

    /// Start picking this frame's distant light refreshes
    pub fn kick_distant_light_scheduling(&mut self) {
        self.scheduler
            .kick(&mut self.entries, self.frame, self.config.max_distant_lights_to_update);
    }

    /// Join the selection and stamp the chosen entries
    pub fn wait_distant_light_scheduling(&mut self) -> usize {
        self.scheduler.wait(&mut self.entries)
    }

    /// Latest forced-refresh frame of `key`, or [`NEVER`]
    pub fn last_scheduled_frame(&self, key: &LightCacheKey) -> i64 {
        self.debug_assert_scheduling_joined();
        self.entries.get(key).map_or(NEVER, PerLightCacheEntry::last_scheduled_frame)
    }

    pub fn is_fully_cached(&self, key: &LightCacheKey) -> bool {
        self.entries.get(key).is_some_and(PerLightCacheEntry::is_fully_cached)
    }

    fn debug_assert_scheduling_joined(&self) {
        debug_assert!(
            !self.scheduler.is_pending(),
            "distant light schedule read before joining the in-flight update"
        );
    }

    // ========================================================================
    // Pools
    // ========================================================================

    /// Request the physical page pool. Any change drops the whole cache.
    pub fn set_physical_pool_size(&mut self, extent: UVec2, array_size: u32, max_physical_pages: u32) -> PoolChange {
        let desc = PhysicalPoolDesc {
            extent,
            array_size,
            max_physical_pages,
            reserved_resource: self.config.allocate_pool_as_reserved_resource
                && self.backend.supports_reserved_resources(),
        };
        match self.physical_pool.request(desc) {
            Ok(change) => {
                if change == PoolChange::Recreated {
                    log::info!("Recreating shadow physical page pool due to size or flags change, cached pages dropped");
                }
                if change.is_changed() {
                    self.invalidate();
                }
                change
            }
            Err(err) => {
                log::warn!("{}; keeping current physical page pool", err);
                PoolChange::Unchanged
            }
        }
    }

    pub fn free_physical_pool(&mut self) {
        if self.physical_pool.free() {
            self.invalidate();
        }
    }

    /// Request the HZB pool. Any change drops the whole cache.
    pub fn set_hzb_pool_size(&mut self, extent: UVec2, array_size: u32, format: HzbFormat) -> PoolChange {
        let desc = HzbPoolDesc {
            extent,
            array_size,
            format,
        };
        match self.hzb_pool.request(desc) {
            Ok(change) => {
                if change.is_changed() {
                    self.invalidate();
                }
                change
            }
            Err(err) => {
                log::warn!("{}; keeping current HZB pool", err);
                PoolChange::Unchanged
            }
        }
    }

    pub fn free_hzb_pool(&mut self) {
        if self.hzb_pool.free() {
            self.invalidate();
        }
    }

    pub fn physical_pool(&self) -> Option<&PhysicalPoolDesc> {
        self.physical_pool.desc()
    }

    pub fn hzb_pool(&self) -> Option<&HzbPoolDesc> {
        self.hzb_pool.desc()
    }

    /// Drop every entry and all previous-frame data
    pub fn invalidate(&mut self) {
        self.wait_distant_light_scheduling();
        self.entries.clear();
        self.prev = PrevFrameData::default();
        if self.physical_pool.is_allocated() {
            self.backend.clear_physical_page_metadata();
        }
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether last frame's pages may be reused this frame
    pub fn is_cache_data_available(&self) -> bool {
        self.is_cache_enabled() && self.physical_pool.is_allocated() && self.prev.page_table && self.prev.cache_buffers
    }

    pub fn is_hzb_data_available(&self) -> bool {
        self.hzb_pool.is_allocated() && self.prev.page_table
    }

    // ========================================================================
    // Feedback
    // ========================================================================

    /// Fold a page management readback into the global resolution bias
    pub fn on_page_management_feedback(&mut self, feedback: PageManagementFeedback) {
        let max_pages = self.physical_pool.desc().map_or(0, |d| d.max_physical_pages);
        self.dynamic_resolution.on_feedback(
            feedback,
            max_pages,
            self.frame,
            self.config.dynamic_res_max_page_pool_load_factor,
            self.config.dynamic_res_max_lod_bias,
        );
    }

    /// Record which capacity limits the GPU hit
    pub fn on_overflow_feedback(&mut self, flags: OverflowFlags) {
        if !self.config.allow_overflow_messages {
            return;
        }
        let now = self.created_at.elapsed().as_secs_f64();
        self.overflow.on_feedback(flags, now);
    }

    pub fn global_resolution_lod_bias(&self) -> f32 {
        self.dynamic_resolution.lod_bias()
    }

    /// Overflow messages that should currently be on screen
    pub fn active_overflow_messages(&self) -> Vec<&'static str> {
        if !self.config.allow_overflow_messages {
            return Vec::new();
        }
        self.overflow.active_messages(self.created_at.elapsed().as_secs_f64())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entry_count: self.entries.len() as u32,
            dynamic_primitive_count: self.classifier.num_dynamic() as u32,
            invalidation_records: self.last_submission.records,
            invalidation_instances: self.last_submission.instances,
            invalidation_batches: self.last_submission.batches,
            distant_lights_scheduled: self.scheduler.last_scheduled_count() as u32,
            resolution_lod_bias: self.dynamic_resolution.lod_bias(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            stats.referenced_count += u32::from(entry.referenced_this_render());
            stats.distant_count += u32::from(entry.is_distant());
            stats.uncached_count += u32::from(entry.is_uncached());
        }
        stats
    }
}

impl Drop for ShadowCacheManager {
    fn drop(&mut self) {
        self.mobility.wait();
        self.wait_distant_light_scheduling();
    }
}

impl core::fmt::Debug for ShadowCacheManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShadowCacheManager")
            .field("frame", &self.frame)
            .field("entries", &self.entries.len())
            .field("primitives", &self.primitives.len())
            .field("physical_pool", &self.physical_pool.desc())
            .field("hzb_pool", &self.hzb_pool.desc())
            .finish()
    }
}
