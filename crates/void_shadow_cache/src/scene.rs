//! Scene feed
//!
//! The narrow slice of the scene the cache consumes: primitive records keyed
//! by persistent index, light add/move notifications, and the per-frame set
//! of primitive changes.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Scene light id
pub type LightId = u32;

/// Stable primitive identity that survives across frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistentPrimitiveIndex(pub u32);

impl PersistentPrimitiveIndex {
    /// No persistent index
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this refers to a primitive slot
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    /// Index into primitive-indexed tables
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// World-space bounding sphere
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

impl BoundingSphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Sphere/sphere overlap, touching counts
    pub fn intersects(&self, other: &BoundingSphere) -> bool {
        let reach = self.radius + other.radius;
        self.center.distance_squared(other.center) <= reach * reach
    }
}

/// How a primitive's movement affects cached shadows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationBehavior {
    /// Invalidate when the primitive changes
    #[default]
    Auto,
    /// Invalidate every frame
    Always,
    /// Shape never deforms; only transform changes invalidate
    Rigid,
    /// Treat as static; movement never invalidates
    Static,
}

/// Proxy properties relevant to shadow caching
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyFlags {
    pub cast_dynamic_shadow: bool,
    /// Shape changes often enough that new instances start out dynamic
    pub mesh_shape_often_moving: bool,
    pub has_deformable_mesh: bool,
    pub invalidation_behavior: InvalidationBehavior,
}

impl ProxyFlags {
    /// An ordinary shadow caster
    pub fn caster() -> Self {
        Self {
            cast_dynamic_shadow: true,
            ..Default::default()
        }
    }
}

/// Contiguous run of instance scene data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceRange {
    pub offset: u32,
    pub count: u32,
}

impl InstanceRange {
    pub fn new(offset: u32, count: u32) -> Self {
        Self { offset, count }
    }

    /// One past the last instance
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.count
    }
}

/// Scene primitive as seen by the cache
#[derive(Clone, Debug, PartialEq)]
pub struct PrimitiveInfo {
    pub persistent_index: PersistentPrimitiveIndex,
    /// `None` until the scene has allocated instance data
    pub instances: Option<InstanceRange>,
    pub bounds: BoundingSphere,
    pub flags: ProxyFlags,
}

/// Light add/move notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LightUpdate {
    pub light_id: LightId,
    pub movable: bool,
}

/// Primitive changes of one scene update
#[derive(Clone, Debug, Default)]
pub struct SceneChanges {
    pub added: Vec<PrimitiveInfo>,
    /// New state of primitives whose transform or shape changed
    pub updated: Vec<PrimitiveInfo>,
    pub removed: Vec<PersistentPrimitiveIndex>,
    /// Primitives the scene keeps invalidating every frame
    pub always_invalidating: Vec<PersistentPrimitiveIndex>,
}

impl SceneChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.always_invalidating.is_empty()
    }
}

/// Arena of live primitives indexed by persistent index
#[derive(Clone, Debug, Default)]
pub struct PrimitiveTable {
    slots: Vec<Option<PrimitiveInfo>>,
    live: usize,
}

impl PrimitiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, returning the previous one
    pub fn insert(&mut self, info: PrimitiveInfo) -> Option<PrimitiveInfo> {
        if !info.persistent_index.is_valid() {
            return None;
        }
        let index = info.persistent_index.index();
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        let previous = self.slots[index].replace(info);
        if previous.is_none() {
            self.live += 1;
        }
        previous
    }

    pub fn remove(&mut self, index: PersistentPrimitiveIndex) -> Option<PrimitiveInfo> {
        let removed = self.slots.get_mut(index.index()).and_then(Option::take);
        if removed.is_some() {
            self.live -= 1;
        }
        removed
    }

    pub fn get(&self, index: PersistentPrimitiveIndex) -> Option<&PrimitiveInfo> {
        self.slots.get(index.index()).and_then(Option::as_ref)
    }

    /// One past the highest persistent index ever stored
    pub fn max_persistent_index(&self) -> usize {
        self.slots.len()
    }

    /// Number of live primitives
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
