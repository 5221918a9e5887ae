//! Cache entries
//!
//! A [`PerLightCacheEntry`] holds the cross-frame state of one light: its
//! classification (uncached, distant, receiver mask), frame stamps, and one
//! [`ShadowMapCacheEntry`] per shadow map the light owns (cube faces,
//! clipmap levels). Shadow map ids change every frame; the shadow map entry
//! decides whether last frame's id may be remapped to this frame's.
//!
//! # Frame flow
//!
//! ```ignore
//! let entry = manager.find_create_entry(key, 6)?;
//! entry.update_local(&LocalLightUpdate { .. });
//! let base = array.allocate(entry.is_distant(), 6)?;
//! for face in 0..6 {
//!     entry.update_shadow_map(face, &mut array, base.offset(face as u32));
//! }
//! // ... render ...
//! entry.mark_rendered(frame);
//! ```

use crate::config::CacheConfig;
use crate::frame::{FrameCounterPair, FrameNumber, NEVER};
use crate::invalidation::InstanceInvalidation;
use crate::scene::{BoundingSphere, InvalidationBehavior, LightId, PrimitiveInfo};
use crate::slots::{ShadowMapArray, ShadowMapId};
use glam::{DMat4, DVec3, I64Vec2, IVec2, Mat4};
use std::collections::BTreeMap;

/// Fraction of the cached depth range a clipmap level may use before it is re-centred
const CLIPMAP_DEPTH_GUARD_BAND: f64 = 0.9;

/// Identity of a cacheable light
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightCacheKey {
    /// Owning view for view-dependent lights (clipmaps), 0 otherwise
    pub view_id: u32,
    pub light_id: LightId,
    /// Distinguishes several shadow setups of one light
    pub type_tag: u32,
}

impl LightCacheKey {
    pub fn new(view_id: u32, light_id: LightId, type_tag: u32) -> Self {
        Self { view_id, light_id, type_tag }
    }
}

/// Live cache entries, ordered by key
pub type CacheEntryMap = BTreeMap<LightCacheKey, PerLightCacheEntry>;

/// Outcome of carrying a shadow map over from last frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheValidity {
    Valid,
    /// No shadow map last frame
    NoPrevious,
    /// Owner never finished a render
    NeverRendered,
    /// Moved between single-page and full allocation
    PageTypeChanged,
    /// Clipmap moved while panning is disabled
    Panned,
    /// Depth range left the guard band of the cached range
    DepthRange,
    RadiusChanged,
    WpoThresholdChanged,
}

impl CacheValidity {
    #[inline]
    pub fn is_valid(self) -> bool {
        self == CacheValidity::Valid
    }
}

/// View state used for HZB occlusion tests
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViewMatrices {
    pub pre_view_translation: DVec3,
    pub translated_view_projection: Mat4,
}

/// Integer pixel rectangle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewRect {
    pub min: IVec2,
    pub max: IVec2,
}

/// Occlusion metadata of one shadow map
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HzbMetadata {
    pub view_matrices: ViewMatrices,
    pub view_rect: ViewRect,
    pub target_layer: u32,
    /// Matrices changed in the last update
    pub matrices_dirty: bool,
}

/// Per-frame description of one clipmap level
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipmapLevelUpdate {
    pub page_space_location: I64Vec2,
    pub level_radius: f64,
    pub view_center_z: f64,
    pub view_radius_z: f64,
    pub wpo_threshold_squared: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct ClipmapLevelCache {
    page_space_location: I64Vec2,
    view_center_z: f64,
    view_radius_z: f64,
    wpo_threshold_squared: f64,
}

/// Cache state of one shadow map slot
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowMapCacheEntry {
    current_id: ShadowMapId,
    clipmap: ClipmapLevelCache,
    current_hzb: HzbMetadata,
    prev_hzb: HzbMetadata,
    unreferenced: bool,
}

impl Default for ShadowMapCacheEntry {
    fn default() -> Self {
        Self {
            current_id: ShadowMapId::NONE,
            clipmap: ClipmapLevelCache::default(),
            current_hzb: HzbMetadata::default(),
            prev_hzb: HzbMetadata::default(),
            unreferenced: false,
        }
    }
}

impl ShadowMapCacheEntry {
    /// This frame's id
    pub fn current_id(&self) -> ShadowMapId {
        self.current_id
    }

    /// Adopt this frame's id, remapping last frame's contents when still valid
    pub fn update(&mut self, array: &mut ShadowMapArray, prev_rendered: bool, id: ShadowMapId) -> CacheValidity {
        let prev_id = self.current_id;
        self.prev_hzb = self.current_hzb;

        let validity = if prev_id.is_none() {
            CacheValidity::NoPrevious
        } else if !prev_rendered {
            CacheValidity::NeverRendered
        } else if prev_id.is_single_page() != id.is_single_page() {
            CacheValidity::PageTypeChanged
        } else {
            CacheValidity::Valid
        };

        if validity.is_valid() {
            array.update_next_data(prev_id, id, IVec2::ZERO);
        }

        self.current_id = id;
        self.unreferenced = false;
        validity
    }

    /// Clipmap variant of [`update`](Self::update) that also tracks panning and depth range
    pub fn update_clipmap_level(
        &mut self,
        array: &mut ShadowMapArray,
        prev_rendered: bool,
        id: ShadowMapId,
        level: &ClipmapLevelUpdate,
        config: &CacheConfig,
    ) -> CacheValidity {
        let prev_id = self.current_id;
        let prev_location = self.clipmap.page_space_location;
        self.prev_hzb = self.current_hzb;

        let delta_z = (level.view_center_z - self.clipmap.view_center_z).abs();
        let validity = if prev_id.is_none() {
            CacheValidity::NoPrevious
        } else if !config.clipmap_panning && level.page_space_location != prev_location {
            CacheValidity::Panned
        } else if delta_z + level.level_radius > CLIPMAP_DEPTH_GUARD_BAND * self.clipmap.view_radius_z {
            CacheValidity::DepthRange
        } else if !prev_rendered {
            CacheValidity::NeverRendered
        } else if level.view_radius_z != self.clipmap.view_radius_z {
            CacheValidity::RadiusChanged
        } else if config.clipmap_wpo_threshold_invalidate
            && level.wpo_threshold_squared != self.clipmap.wpo_threshold_squared
        {
            CacheValidity::WpoThresholdChanged
        } else {
            CacheValidity::Valid
        };

        if validity.is_valid() {
            // Cached pages keep the depth range they were rendered with
            let offset = level.page_space_location - prev_location;
            array.update_next_data(prev_id, id, IVec2::new(offset.x as i32, offset.y as i32));
        } else {
            self.clipmap.view_center_z = level.view_center_z;
            self.clipmap.view_radius_z = level.view_radius_z;
            self.clipmap.wpo_threshold_squared = level.wpo_threshold_squared;
        }

        self.current_id = id;
        self.clipmap.page_space_location = level.page_space_location;
        self.unreferenced = false;
        validity
    }

    /// Record the view this frame rendered with
    pub fn update_hzb_metadata(&mut self, view_matrices: &ViewMatrices, view_rect: ViewRect, target_layer: u32) {
        self.current_hzb.view_rect = view_rect;
        self.current_hzb.target_layer = target_layer;
        self.current_hzb.matrices_dirty = view_matrices.pre_view_translation
            != self.current_hzb.view_matrices.pre_view_translation
            || view_matrices.translated_view_projection != self.current_hzb.view_matrices.translated_view_projection;
        if self.current_hzb.matrices_dirty {
            self.current_hzb.view_matrices = *view_matrices;
        }
    }

    pub fn current_hzb_metadata(&self) -> &HzbMetadata {
        &self.current_hzb
    }

    /// Last frame's metadata, for testing against last frame's HZB
    pub fn prev_hzb_metadata(&self) -> &HzbMetadata {
        &self.prev_hzb
    }

    /// Kept alive this frame without its light being requested
    pub fn is_unreferenced(&self) -> bool {
        self.unreferenced
    }

    pub(crate) fn mark_unreferenced(&mut self) {
        self.unreferenced = true;
    }
}

/// Per-frame shadow setup of a local (spot/point/rect) light
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalLightUpdate {
    pub pre_shadow_translation: DVec3,
    pub world_to_light: DMat4,
    pub light_origin: DVec3,
    pub light_radius: f64,
    pub is_distant: bool,
    pub force_invalidate: bool,
    /// Whether movement may invalidate (distant lights leave it to the scheduler)
    pub allow_invalidation: bool,
    pub use_receiver_mask: bool,
}

/// Per-frame shadow setup of a directional light's clipmap
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipmapUpdate {
    pub light_direction: DVec3,
    pub first_level: i32,
    pub force_invalidate: bool,
    pub use_receiver_mask: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct LocalCacheKey {
    pre_shadow_translation: DVec3,
    world_to_light: DMat4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct ClipmapCacheKey {
    light_direction: DVec3,
    first_level: i32,
}

/// Cache state of one light across frames
#[derive(Clone, Debug)]
pub struct PerLightCacheEntry {
    shadow_maps: Vec<ShadowMapCacheEntry>,
    prev: FrameCounterPair,
    current: FrameCounterPair,
    is_uncached: bool,
    is_distant: bool,
    use_receiver_mask: bool,
    local_key: LocalCacheKey,
    clipmap_key: ClipmapCacheKey,
    light_origin: DVec3,
    light_radius: f64,
    pending_invalidations: Vec<InstanceInvalidation>,
    referenced_this_render: bool,
    last_referenced_frame: FrameNumber,
}

impl PerLightCacheEntry {
    /// New entry with `num_shadow_maps` empty slots, never rendered
    pub fn new(num_shadow_maps: usize) -> Self {
        Self {
            shadow_maps: vec![ShadowMapCacheEntry::default(); num_shadow_maps],
            prev: FrameCounterPair::NEVER,
            current: FrameCounterPair::NEVER,
            is_uncached: false,
            is_distant: false,
            use_receiver_mask: false,
            local_key: LocalCacheKey::default(),
            clipmap_key: ClipmapCacheKey::default(),
            light_origin: DVec3::ZERO,
            light_radius: -1.0,
            pending_invalidations: Vec::new(),
            referenced_this_render: false,
            last_referenced_frame: 0,
        }
    }

    /// Start a frame for a local light
    pub fn update_local(&mut self, update: &LocalLightUpdate) {
        self.prev.fold_max(&self.current);

        let light_moved = self.local_key.pre_shadow_translation != update.pre_shadow_translation
            || self.local_key.world_to_light != update.world_to_light;
        self.local_key = LocalCacheKey {
            pre_shadow_translation: update.pre_shadow_translation,
            world_to_light: update.world_to_light,
        };

        if update.force_invalidate || (update.allow_invalidation && light_moved) {
            self.prev.rendered_frame_number = NEVER;
        }

        // Pages may be incomplete after a receiver mask toggle
        if update.use_receiver_mask != self.use_receiver_mask {
            self.prev.rendered_frame_number = NEVER;
            self.use_receiver_mask = update.use_receiver_mask;
        }

        // Static pages are not initialized across an uncached <-> cached flip
        let new_is_uncached = !self.prev.has_rendered();
        if new_is_uncached != self.is_uncached {
            self.prev.rendered_frame_number = NEVER;
        }

        if update.is_distant != self.is_distant {
            self.prev.rendered_frame_number = NEVER;
        }

        self.current = FrameCounterPair::NEVER;
        self.is_distant = update.is_distant;
        self.is_uncached = new_is_uncached;
        self.light_origin = update.light_origin;
        self.light_radius = update.light_radius;
    }

    /// Start a frame for a directional light's clipmap
    pub fn update_clipmap(&mut self, update: &ClipmapUpdate) {
        self.prev.rendered_frame_number = self.prev.rendered_frame_number.max(self.current.rendered_frame_number);
        self.current.rendered_frame_number = NEVER;

        if update.force_invalidate
            || update.light_direction != self.clipmap_key.light_direction
            || update.first_level != self.clipmap_key.first_level
        {
            self.prev.rendered_frame_number = NEVER;
        }
        self.clipmap_key = ClipmapCacheKey {
            light_direction: update.light_direction,
            first_level: update.first_level,
        };

        if update.use_receiver_mask != self.use_receiver_mask {
            self.prev.rendered_frame_number = NEVER;
            self.use_receiver_mask = update.use_receiver_mask;
        }

        // A light invalidated this frame renders uncached, which is cheaper for
        // lights that keep moving. One still frame switches it back.
        let new_is_uncached = !self.prev.has_rendered();
        if new_is_uncached != self.is_uncached {
            self.prev.rendered_frame_number = NEVER;
            self.is_uncached = new_is_uncached;
        }

        // Clipmaps cover everything
        self.light_origin = DVec3::ZERO;
        self.light_radius = -1.0;
    }

    /// Adopt this frame's id for shadow map `index`
    pub fn update_shadow_map(&mut self, index: usize, array: &mut ShadowMapArray, id: ShadowMapId) -> CacheValidity {
        let prev_rendered = self.prev.has_rendered();
        match self.shadow_maps.get_mut(index) {
            Some(shadow_map) => shadow_map.update(array, prev_rendered, id),
            None => CacheValidity::NoPrevious,
        }
    }

    /// Adopt this frame's id for clipmap level `index`
    pub fn update_clipmap_level(
        &mut self,
        index: usize,
        array: &mut ShadowMapArray,
        id: ShadowMapId,
        level: &ClipmapLevelUpdate,
        config: &CacheConfig,
    ) -> CacheValidity {
        let prev_rendered = self.prev.has_rendered();
        let Some(shadow_map) = self.shadow_maps.get_mut(index) else {
            return CacheValidity::NoPrevious;
        };
        let validity = shadow_map.update_clipmap_level(array, prev_rendered, id, level, config);
        // Every level trips on a threshold change; report it once
        if validity == CacheValidity::WpoThresholdChanged && index == 0 {
            log::info!(
                "Invalidated clipmap due to WPO threshold change. This can occur due to resolution or FOV changes."
            );
        }
        validity
    }

    /// The render stage finished rendering this light
    pub fn mark_rendered(&mut self, frame: FrameNumber) {
        self.current.rendered_frame_number = i64::from(frame);
    }

    /// The light was picked for a forced refresh
    pub fn mark_scheduled(&mut self, frame: FrameNumber) {
        self.current.scheduled_frame_number = i64::from(frame);
    }

    /// Render without trusting cached pages
    pub fn is_uncached(&self) -> bool {
        self.is_uncached
    }

    /// Cached and last frame's pages are valid
    pub fn is_fully_cached(&self) -> bool {
        !self.is_uncached && self.prev.has_rendered()
    }

    pub fn is_distant(&self) -> bool {
        self.is_distant
    }

    pub fn uses_receiver_mask(&self) -> bool {
        self.use_receiver_mask
    }

    /// Latest forced-refresh frame, or [`NEVER`]
    pub fn last_scheduled_frame(&self) -> i64 {
        self.prev.scheduled_frame_number.max(self.current.scheduled_frame_number)
    }

    pub fn prev(&self) -> &FrameCounterPair {
        &self.prev
    }

    pub fn current(&self) -> &FrameCounterPair {
        &self.current
    }

    pub fn light_origin(&self) -> DVec3 {
        self.light_origin
    }

    /// Influence radius; non-positive means unbounded
    pub fn light_radius(&self) -> f64 {
        self.light_radius
    }

    /// Whether geometry inside `bounds` can affect this light's shadows
    pub fn affects_bounds(&self, bounds: &BoundingSphere) -> bool {
        if self.light_radius <= 0.0 {
            return true;
        }
        BoundingSphere::new(self.light_origin, self.light_radius).intersects(bounds)
    }

    /// Queue invalidations for a primitive the render stage just drew
    pub fn on_primitive_rendered(&mut self, primitive: &PrimitiveInfo, revealed: bool, config: &CacheConfig) {
        let Some(instances) = primitive.instances else {
            return;
        };

        // Animating deformable meshes need invalidation even when they did not move.
        // Other behaviours either invalidate elsewhere or must not invalidate.
        let mark_as_dynamic = if config.deformable_meshes_invalidate
            && primitive.flags.has_deformable_mesh
            && primitive.flags.invalidation_behavior == InvalidationBehavior::Auto
        {
            true
        } else if revealed && !config.skip_revealed_primitives_invalidate {
            // Revealing is not movement
            false
        } else {
            return;
        };

        self.pending_invalidations.push(InstanceInvalidation {
            persistent_index: primitive.persistent_index,
            instances,
            mark_as_dynamic,
        });
    }

    /// Invalidations queued on this light
    pub fn pending_invalidations(&self) -> &[InstanceInvalidation] {
        &self.pending_invalidations
    }

    pub(crate) fn take_pending_invalidations(&mut self) -> Vec<InstanceInvalidation> {
        std::mem::take(&mut self.pending_invalidations)
    }

    pub(crate) fn clear_pending_invalidations(&mut self) {
        self.pending_invalidations.clear();
    }

    pub fn shadow_maps(&self) -> &[ShadowMapCacheEntry] {
        &self.shadow_maps
    }

    pub fn shadow_map_mut(&mut self, index: usize) -> Option<&mut ShadowMapCacheEntry> {
        self.shadow_maps.get_mut(index)
    }

    pub fn num_shadow_maps(&self) -> usize {
        self.shadow_maps.len()
    }

    pub fn referenced_this_render(&self) -> bool {
        self.referenced_this_render
    }

    pub fn last_referenced_frame(&self) -> FrameNumber {
        self.last_referenced_frame
    }

    pub(crate) fn mark_referenced(&mut self, frame: FrameNumber) {
        self.referenced_this_render = true;
        self.last_referenced_frame = frame;
    }

    pub(crate) fn clear_referenced(&mut self) {
        self.referenced_this_render = false;
    }

    /// Re-home an unreferenced light onto fresh ids so its pages stay alive
    pub(crate) fn reallocate(&mut self, array: &mut ShadowMapArray) -> crate::error::Result<()> {
        let Some(first) = self.shadow_maps.first() else {
            return Ok(());
        };
        let single_page = first.current_id().is_single_page();
        let base = array.allocate(single_page, self.shadow_maps.len() as u32)?;
        let prev_rendered = self.prev.has_rendered();
        for (offset, shadow_map) in self.shadow_maps.iter_mut().enumerate() {
            shadow_map.update(array, prev_rendered, base.offset(offset as u32));
            shadow_map.mark_unreferenced();
        }
        Ok(())
    }
}
