//! Per-frame shadow map array
//!
//! Shadow map ids are handed out fresh every frame. The first
//! [`MAX_SINGLE_PAGE_SHADOW_MAPS`] ids are reserved for single-page maps
//! (distant lights); full maps are numbered after them. Cache entries
//! register a remap from last frame's id to this frame's id so the renderer
//! can carry page contents forward.

use crate::error::{CacheError, Result};
use glam::IVec2;
use std::collections::BTreeMap;

/// Ids below this are single-page shadow maps
pub const MAX_SINGLE_PAGE_SHADOW_MAPS: u32 = 8192;

/// Ids must fit in the 30 id bits of an invalidation payload
pub const MAX_SHADOW_MAP_SLOTS: u32 = 1 << 30;

/// Shadow map slot id within one frame's array
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowMapId(u32);

impl ShadowMapId {
    /// No slot
    pub const NONE: Self = Self(u32::MAX);

    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == u32::MAX
    }

    /// Whether the id lies in the single-page range
    #[inline]
    pub const fn is_single_page(&self) -> bool {
        self.0 < MAX_SINGLE_PAGE_SHADOW_MAPS
    }

    /// Id `offset` slots after this one
    #[inline]
    pub const fn offset(&self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl Default for ShadowMapId {
    fn default() -> Self {
        Self::NONE
    }
}

/// Where last frame's shadow map lives this frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextShadowMapData {
    pub next_id: ShadowMapId,
    /// Page-space offset from the current to the previous location (clipmap panning)
    pub page_offset: IVec2,
}

/// This frame's shadow map allocation
#[derive(Clone, Debug)]
pub struct ShadowMapArray {
    allocated: bool,
    num_single_page: u32,
    num_slots: u32,
    next_data: BTreeMap<ShadowMapId, NextShadowMapData>,
}

impl ShadowMapArray {
    /// An allocated array with the single-page range reserved
    pub fn new() -> Self {
        Self {
            allocated: true,
            num_single_page: 0,
            num_slots: MAX_SINGLE_PAGE_SHADOW_MAPS,
            next_data: BTreeMap::new(),
        }
    }

    /// A frame that produced no shadow data
    pub fn unallocated() -> Self {
        Self {
            allocated: false,
            num_single_page: 0,
            num_slots: 0,
            next_data: BTreeMap::new(),
        }
    }

    /// Whether this frame has shadow data at all
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Reserve `count` consecutive ids and return the first
    pub fn allocate(&mut self, single_page: bool, count: u32) -> Result<ShadowMapId> {
        if !self.allocated {
            return Err(CacheError::SlotCapacityExceeded {
                requested: count,
                available: 0,
            });
        }

        if single_page {
            let available = MAX_SINGLE_PAGE_SHADOW_MAPS - self.num_single_page;
            if count > available {
                return Err(CacheError::SlotCapacityExceeded { requested: count, available });
            }
            let id = ShadowMapId::new(self.num_single_page);
            self.num_single_page += count;
            Ok(id)
        } else {
            let available = MAX_SHADOW_MAP_SLOTS.saturating_sub(self.num_slots);
            if count > available {
                return Err(CacheError::SlotCapacityExceeded { requested: count, available });
            }
            let id = ShadowMapId::new(self.num_slots);
            self.num_slots += count;
            Ok(id)
        }
    }

    /// Record that `prev` (last frame) continues as `next` (this frame)
    pub fn update_next_data(&mut self, prev: ShadowMapId, next: ShadowMapId, page_offset: IVec2) {
        debug_assert!(!prev.is_none() && !next.is_none());
        self.next_data.insert(prev, NextShadowMapData { next_id: next, page_offset });
    }

    /// Remap for a previous-frame id, if its contents survive
    pub fn next_data(&self, prev: ShadowMapId) -> Option<&NextShadowMapData> {
        self.next_data.get(&prev)
    }

    /// All remaps, ordered by previous id
    pub fn iter_next_data(&self) -> impl Iterator<Item = (&ShadowMapId, &NextShadowMapData)> {
        self.next_data.iter()
    }

    pub fn num_single_page_shadow_maps(&self) -> u32 {
        self.num_single_page
    }

    pub fn num_full_shadow_maps(&self) -> u32 {
        self.num_slots.saturating_sub(MAX_SINGLE_PAGE_SHADOW_MAPS)
    }

    /// Total id range including the reserved single-page block
    pub fn num_shadow_map_slots(&self) -> u32 {
        self.num_slots
    }
}

impl Default for ShadowMapArray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_page_and_full_ranges() {
        let mut array = ShadowMapArray::new();
        let single = array.allocate(true, 2).unwrap();
        let full = array.allocate(false, 6).unwrap();
        let single2 = array.allocate(true, 1).unwrap();

        assert_eq!(single.index(), 0);
        assert_eq!(single2.index(), 2);
        assert!(single.is_single_page());
        assert_eq!(full.index(), MAX_SINGLE_PAGE_SHADOW_MAPS);
        assert!(!full.is_single_page());

        assert_eq!(array.num_single_page_shadow_maps(), 3);
        assert_eq!(array.num_full_shadow_maps(), 6);
        assert_eq!(array.num_shadow_map_slots(), MAX_SINGLE_PAGE_SHADOW_MAPS + 6);
    }

    #[test]
    fn test_single_page_capacity() {
        let mut array = ShadowMapArray::new();
        array.allocate(true, MAX_SINGLE_PAGE_SHADOW_MAPS - 1).unwrap();
        match array.allocate(true, 2) {
            Err(CacheError::SlotCapacityExceeded { requested, available }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected capacity error, got {:?}", other),
        }
    }

    #[test]
    fn test_full_ids_stay_within_payload_bits() {
        let mut array = ShadowMapArray::new();
        let remaining = MAX_SHADOW_MAP_SLOTS - MAX_SINGLE_PAGE_SHADOW_MAPS;
        let base = array.allocate(false, remaining - 1).unwrap();
        assert_eq!(base.offset(remaining - 2).index(), MAX_SHADOW_MAP_SLOTS - 2);
        assert_eq!(array.allocate(false, 1).unwrap().index(), MAX_SHADOW_MAP_SLOTS - 1);
        assert!(matches!(
            array.allocate(false, 1),
            Err(CacheError::SlotCapacityExceeded { available: 0, .. })
        ));
    }

    #[test]
    fn test_unallocated_array_rejects() {
        let mut array = ShadowMapArray::unallocated();
        assert!(!array.is_allocated());
        assert!(array.allocate(false, 1).is_err());
        assert_eq!(array.num_shadow_map_slots(), 0);
    }

    #[test]
    fn test_next_data() {
        let mut array = ShadowMapArray::new();
        let prev = ShadowMapId::new(9000);
        let next = array.allocate(false, 1).unwrap();
        array.update_next_data(prev, next, IVec2::new(1, -2));

        let data = array.next_data(prev).unwrap();
        assert_eq!(data.next_id, next);
        assert_eq!(data.page_offset, IVec2::new(1, -2));
        assert!(array.next_data(ShadowMapId::new(1)).is_none());
    }
}
