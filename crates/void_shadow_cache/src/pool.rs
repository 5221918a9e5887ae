//! Physical page pool and HZB pool tracking
//!
//! The GPU resources themselves belong to the render backend. This module
//! only remembers what was last allocated so a request for something
//! different can be detected; cached pages are not portable across a
//! reallocated pool.

use crate::error::{CacheError, Result};
use crate::frame::{FrameNumber, NEVER};
use glam::UVec2;
use serde::{Deserialize, Serialize};

/// Physical page pool allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPoolDesc {
    /// Texel extent of one array layer
    pub extent: UVec2,
    pub array_size: u32,
    pub max_physical_pages: u32,
    /// Backed by a reserved (sparse) resource
    pub reserved_resource: bool,
}

/// Texel format of the HZB pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HzbFormat {
    R16Float,
    R32Float,
}

/// Hierarchical depth pool allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HzbPoolDesc {
    pub extent: UVec2,
    pub array_size: u32,
    pub format: HzbFormat,
}

/// Descriptor that can be checked before allocation
pub trait PoolDesc: Copy + PartialEq + core::fmt::Debug {
    fn validate(&self) -> Result<()>;
}

impl PoolDesc for PhysicalPoolDesc {
    fn validate(&self) -> Result<()> {
        if self.extent.x == 0 || self.extent.y == 0 || self.array_size == 0 || self.max_physical_pages == 0 {
            return Err(CacheError::InvalidPoolDesc(format!("physical pool {:?}", self)));
        }
        Ok(())
    }
}

impl PoolDesc for HzbPoolDesc {
    fn validate(&self) -> Result<()> {
        if self.extent.x == 0 || self.extent.y == 0 || self.array_size == 0 {
            return Err(CacheError::InvalidPoolDesc(format!("HZB pool {:?}", self)));
        }
        Ok(())
    }
}

/// Outcome of a pool size request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolChange {
    Unchanged,
    /// No pool existed before
    Created,
    /// An existing pool was replaced
    Recreated,
}

impl PoolChange {
    pub fn is_changed(self) -> bool {
        self != PoolChange::Unchanged
    }
}

/// Currently allocated pool, if any
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolState<D> {
    desc: Option<D>,
}

impl<D> Default for PoolState<D> {
    fn default() -> Self {
        Self { desc: None }
    }
}

impl<D: PoolDesc> PoolState<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `desc` the allocated pool. Invalid descriptors leave the pool unchanged.
    pub fn request(&mut self, desc: D) -> Result<PoolChange> {
        desc.validate()?;
        let change = match self.desc {
            Some(current) if current == desc => PoolChange::Unchanged,
            Some(_) => PoolChange::Recreated,
            None => PoolChange::Created,
        };
        self.desc = Some(desc);
        Ok(change)
    }

    /// Drop the pool. Returns true if one existed.
    pub fn free(&mut self) -> bool {
        self.desc.take().is_some()
    }

    pub fn desc(&self) -> Option<&D> {
        self.desc.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.desc.is_some()
    }
}

/// Lerp factor when pages are over budget
const LOD_BIAS_DOWN_RATE: f32 = 0.5;
/// Lerp factor when pages have been under budget for a while
const LOD_BIAS_UP_RATE: f32 = 0.1;
/// Frames under budget before resolution is allowed to go back up
const FRAMES_BEFORE_RESOLUTION_UP: i64 = 10;

/// GPU page management readback
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageManagementFeedback {
    /// Free physical pages after allocation; negative means the pool ran out
    pub free_pages: i32,
    /// Resolution LOD bias the readback frame was rendered with
    pub resolution_lod_bias: f32,
}

/// Global resolution LOD bias driven by page pool pressure
#[derive(Clone, Debug)]
pub struct DynamicResolution {
    lod_bias: f32,
    last_over_budget_frame: i64,
    page_pool_overflowed: bool,
}

impl Default for DynamicResolution {
    fn default() -> Self {
        Self {
            lod_bias: 0.0,
            last_over_budget_frame: NEVER,
            page_pool_overflowed: false,
        }
    }
}

impl DynamicResolution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current bias; 0 means full resolution
    pub fn lod_bias(&self) -> f32 {
        self.lod_bias
    }

    /// Whether the last feedback reported an exhausted pool
    pub fn page_pool_overflowed(&self) -> bool {
        self.page_pool_overflowed
    }

    /// Fold one readback into the bias. Returns the new bias.
    ///
    /// `max_page_pool_load` of 0 disables the adjustment.
    pub fn on_feedback(
        &mut self,
        feedback: PageManagementFeedback,
        max_physical_pages: u32,
        frame: FrameNumber,
        max_page_pool_load: f32,
        max_lod_bias: f32,
    ) -> f32 {
        if feedback.free_pages < 0 {
            if !self.page_pool_overflowed {
                log::warn!(
                    "Shadow page pool overflow: {} pages short, shadows will be missing",
                    -i64::from(feedback.free_pages)
                );
            }
            self.page_pool_overflowed = true;
        } else {
            self.page_pool_overflowed = false;
        }

        if max_page_pool_load > 0.0 && max_physical_pages > 0 {
            let allocation = 1.0 - feedback.free_pages as f32 / max_physical_pages as f32;
            let target = (feedback.resolution_lod_bias + (allocation / max_page_pool_load).log2()).max(0.0);
            let frame = i64::from(frame);

            if allocation <= max_page_pool_load && frame - self.last_over_budget_frame > FRAMES_BEFORE_RESOLUTION_UP {
                self.lod_bias = lerp(self.lod_bias, target, LOD_BIAS_UP_RATE);
            } else if allocation > max_page_pool_load {
                self.last_over_budget_frame = frame;
                self.lod_bias = lerp(self.lod_bias, target, LOD_BIAS_DOWN_RATE);
            }
        }

        self.lod_bias = self.lod_bias.clamp(0.0, max_lod_bias.max(0.0));
        self.lod_bias
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn physical(pages: u32) -> PhysicalPoolDesc {
        PhysicalPoolDesc {
            extent: UVec2::new(2048, 2048),
            array_size: 1,
            max_physical_pages: pages,
            reserved_resource: false,
        }
    }

    #[test]
    fn test_pool_change_detection() {
        let mut pool = PoolState::new();
        assert_eq!(pool.request(physical(1024)).unwrap(), PoolChange::Created);
        assert_eq!(pool.request(physical(1024)).unwrap(), PoolChange::Unchanged);
        assert_eq!(pool.request(physical(2048)).unwrap(), PoolChange::Recreated);

        let mut reserved = physical(2048);
        reserved.reserved_resource = true;
        assert_eq!(pool.request(reserved).unwrap(), PoolChange::Recreated);

        assert!(pool.free());
        assert!(!pool.free());
    }

    #[test]
    fn test_invalid_desc_keeps_pool() {
        let mut pool = PoolState::new();
        pool.request(physical(1024)).unwrap();
        assert!(matches!(pool.request(physical(0)), Err(CacheError::InvalidPoolDesc(_))));
        assert_eq!(pool.desc().map(|d| d.max_physical_pages), Some(1024));
    }

    #[test]
    fn test_hzb_format_change() {
        let mut pool = PoolState::new();
        let mut desc = HzbPoolDesc {
            extent: UVec2::new(1024, 512),
            array_size: 2,
            format: HzbFormat::R32Float,
        };
        pool.request(desc).unwrap();
        desc.format = HzbFormat::R16Float;
        assert_eq!(pool.request(desc).unwrap(), PoolChange::Recreated);
    }

    #[test]
    fn test_over_budget_raises_bias() {
        let mut res = DynamicResolution::new();
        // Fully allocated pool at 50% budget: target = log2(2) = 1
        let feedback = PageManagementFeedback {
            free_pages: 0,
            resolution_lod_bias: 0.0,
        };
        let bias = res.on_feedback(feedback, 1000, 1, 0.5, 4.0);
        assert_relative_eq!(bias, 0.5);
        let bias = res.on_feedback(feedback, 1000, 2, 0.5, 4.0);
        assert_relative_eq!(bias, 0.75);
    }

    #[test]
    fn test_under_budget_waits_before_lowering() {
        let mut res = DynamicResolution::new();
        let over = PageManagementFeedback {
            free_pages: 0,
            resolution_lod_bias: 1.0,
        };
        res.on_feedback(over, 1000, 5, 0.5, 4.0);
        let raised = res.lod_bias();
        assert!(raised > 0.0);

        // 25% allocation with bias 1: target = max(0, 1 + log2(0.5)) = 0
        let under = PageManagementFeedback {
            free_pages: 750,
            resolution_lod_bias: raised,
        };
        for frame in 6..=15 {
            assert_relative_eq!(res.on_feedback(under, 1000, frame, 0.5, 4.0), raised);
        }
        assert!(res.on_feedback(under, 1000, 16, 0.5, 4.0) < raised);
    }

    #[test]
    fn test_bias_clamped() {
        let mut res = DynamicResolution::new();
        let feedback = PageManagementFeedback {
            free_pages: 0,
            resolution_lod_bias: 10.0,
        };
        for frame in 0..20 {
            res.on_feedback(feedback, 100, frame, 0.1, 2.0);
        }
        assert_relative_eq!(res.lod_bias(), 2.0);
    }

    #[test]
    fn test_disabled_load_factor() {
        let mut res = DynamicResolution::new();
        let feedback = PageManagementFeedback {
            free_pages: 0,
            resolution_lod_bias: 3.0,
        };
        assert_eq!(res.on_feedback(feedback, 100, 1, 0.0, 4.0), 0.0);
    }

    #[test]
    fn test_overflow_flag_clears() {
        let mut res = DynamicResolution::new();
        let mut feedback = PageManagementFeedback {
            free_pages: -5,
            resolution_lod_bias: 0.0,
        };
        res.on_feedback(feedback, 100, 1, 0.85, 2.0);
        assert!(res.page_pool_overflowed());
        feedback.free_pages = 10;
        res.on_feedback(feedback, 100, 2, 0.85, 2.0);
        assert!(!res.page_pool_overflowed());
    }
}
