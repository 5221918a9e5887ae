//! Shadow Cache Configuration
//!
//! Tunables for the page cache with serde support for hot-reload.

use serde::{Deserialize, Serialize};

/// Upper bound for the dynamic resolution LOD bias
pub const MAX_DYNAMIC_RES_LOD_BIAS: f32 = 16.0;

/// Shadow cache configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse shadow pages across frames
    pub enabled: bool,

    /// Frames an unreferenced light keeps its cache entry
    pub max_light_age: u32,

    /// Frames without invalidation before a dynamic primitive is cached as static
    pub frames_static_threshold: u32,

    /// Skip invalidations for primitives outside a light's radius
    pub light_radius_culling: bool,

    /// Test invalidated instances against the previous frame's HZB
    pub invalidate_use_hzb: bool,

    /// Reuse clipmap pages when the clipmap pans instead of invalidating
    pub clipmap_panning: bool,

    /// Deformable meshes invalidate every frame they render
    pub deformable_meshes_invalidate: bool,

    /// Debug: do not invalidate for primitives that stopped being culled
    pub skip_revealed_primitives_invalidate: bool,

    /// Invalidate clipmaps when the WPO disable distance changes
    pub clipmap_wpo_threshold_invalidate: bool,

    /// Fully cached distant lights refreshed per frame (0 = never refresh)
    pub max_distant_lights_to_update: u32,

    /// Frames a moved light's mobility factor takes to decay to zero
    pub light_active_frame_count: u32,

    /// Largest resolution LOD bias applied when the page pool runs full
    pub dynamic_res_max_lod_bias: f32,

    /// Page pool load above which resolution is reduced (0 = disabled)
    pub dynamic_res_max_page_pool_load_factor: f32,

    /// Ask for the page pool as a reserved (sparse-committed) resource
    pub allocate_pool_as_reserved_resource: bool,

    /// Log capacity overflow messages
    pub allow_overflow_messages: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_light_age: 10,
            frames_static_threshold: 100,
            light_radius_culling: true,
            invalidate_use_hzb: true,
            clipmap_panning: true,
            deformable_meshes_invalidate: true,
            skip_revealed_primitives_invalidate: false,
            clipmap_wpo_threshold_invalidate: false,
            max_distant_lights_to_update: 1,
            light_active_frame_count: 10,
            dynamic_res_max_lod_bias: 2.0,
            dynamic_res_max_page_pool_load_factor: 0.85,
            allocate_pool_as_reserved_resource: true,
            allow_overflow_messages: true,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with caching disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.light_active_frame_count = self.light_active_frame_count.max(1);
        self.dynamic_res_max_lod_bias = if self.dynamic_res_max_lod_bias.is_finite() {
            self.dynamic_res_max_lod_bias.clamp(0.0, MAX_DYNAMIC_RES_LOD_BIAS)
        } else {
            0.0
        };
        self.dynamic_res_max_page_pool_load_factor = if self.dynamic_res_max_page_pool_load_factor.is_finite() {
            self.dynamic_res_max_page_pool_load_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    /// Builder-style validation
    pub fn validated(mut self) -> Self {
        self.validate();
        self
    }
}
