//! Overflow diagnostics and cache statistics
//!
//! Overflows never fail a frame; they show up as missing or wrong shadows.
//! The GPU reports which capacity limits were hit and this module turns that
//! into one log line per episode plus short-lived on-screen messages.

use serde::{Deserialize, Serialize};

/// GPU capacity limits that were exceeded in a frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverflowFlags(u32);

impl OverflowFlags {
    pub const NONE: Self = Self(0);

    /// Non-Nanite page marking job queue
    pub const MARKING_JOB_QUEUE: Self = Self(1 << 0);

    /// Per-pixel light list
    pub const OPP_MAX_LIGHTS: Self = Self(1 << 1);

    /// Physical page pool
    pub const PAGE_POOL: Self = Self(1 << 2);

    /// Visible instance buffer
    pub const VISIBLE_INSTANCES: Self = Self(1 << 3);

    /// Instance invalidation queue
    pub const INVALIDATION_QUEUE: Self = Self(1 << 4);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if all specified flags are set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for OverflowFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for OverflowFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Seconds a message stays on screen after its last occurrence
pub const OVERFLOW_MESSAGE_DURATION: f64 = 10.0;

const OVERFLOW_KINDS: [(OverflowFlags, &str); 5] = [
    (
        OverflowFlags::MARKING_JOB_QUEUE,
        "Shadow page marking job queue overflow. Performance may be affected. \
         Lower the number of non-Nanite shadow casters or raise the queue size.",
    ),
    (
        OverflowFlags::OPP_MAX_LIGHTS,
        "Shadow per-pixel light list overflow. Some lights will be missing shadows.",
    ),
    (
        OverflowFlags::PAGE_POOL,
        "Shadow page pool overflow detected, this will produce visual artifacts (missing shadow). \
         Increase the page pool size or reduce resolution.",
    ),
    (
        OverflowFlags::VISIBLE_INSTANCES,
        "Shadow visible instance buffer overflow. Some shadow casters will be missing.",
    ),
    (
        OverflowFlags::INVALIDATION_QUEUE,
        "Shadow invalidation queue overflow. Stale cached shadows may be visible.",
    ),
];

/// Human readable description of one overflow kind
pub fn overflow_message(flag: OverflowFlags) -> Option<&'static str> {
    OVERFLOW_KINDS
        .iter()
        .find(|(kind, _)| *kind == flag)
        .map(|(_, message)| *message)
}

/// Rate limiter for overflow reports
#[derive(Clone, Debug, Default)]
pub struct OverflowTracker {
    last_seen: [Option<f64>; OVERFLOW_KINDS.len()],
    logged: OverflowFlags,
}

impl OverflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame's report at time `now` (seconds).
    ///
    /// Each kind is logged once until a frame reports it absent.
    pub fn on_feedback(&mut self, flags: OverflowFlags, now: f64) {
        for (slot, (kind, message)) in OVERFLOW_KINDS.iter().enumerate() {
            if flags.contains(*kind) {
                self.last_seen[slot] = Some(now);
                if !self.logged.contains(*kind) {
                    log::warn!("{}", message);
                    self.logged.insert(*kind);
                }
            } else {
                self.logged.remove(*kind);
            }
        }
    }

    /// Messages seen within the last [`OVERFLOW_MESSAGE_DURATION`] seconds
    pub fn active_messages(&self, now: f64) -> Vec<&'static str> {
        OVERFLOW_KINDS
            .iter()
            .zip(self.last_seen.iter())
            .filter_map(|((_, message), last)| match last {
                Some(last) if now - last < OVERFLOW_MESSAGE_DURATION => Some(*message),
                _ => None,
            })
            .collect()
    }

    /// Kinds currently inside a logged episode
    pub fn logged(&self) -> OverflowFlags {
        self.logged
    }
}

/// Snapshot of cache state for profiling overlays
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Cache entries alive
    pub entry_count: u32,

    /// Entries requested this render
    pub referenced_count: u32,

    /// Distant light entries
    pub distant_count: u32,

    /// Entries rendering without cached pages
    pub uncached_count: u32,

    /// Primitives currently cached as dynamic
    pub dynamic_primitive_count: u32,

    /// Invalidation ranges submitted by the last scene update
    pub invalidation_records: u32,

    /// Instances covered by those ranges
    pub invalidation_instances: u64,

    /// Dispatch batches submitted by the last scene update
    pub invalidation_batches: u32,

    /// Distant lights stamped for refresh by the last scheduling pass
    pub distant_lights_scheduled: u32,

    /// Global resolution LOD bias from dynamic resolution
    pub resolution_lod_bias: f32,
}
