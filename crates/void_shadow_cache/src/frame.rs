//! Frame counters
//!
//! Every cache decision compares frame stamps. Stamps are held as `i64` so
//! that `-1` can mean "never" next to the full range of scene frame numbers.

use serde::{Deserialize, Serialize};

/// Scene frame number (wraps like the scene's own counter)
pub type FrameNumber = u32;

/// Stamp value meaning "never happened"
pub const NEVER: i64 = -1;

/// Rendered/scheduled stamps of one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounterPair {
    /// Frame the cached pages were last rendered, or [`NEVER`]
    pub rendered_frame_number: i64,
    /// Frame the light was last picked for a forced refresh, or [`NEVER`]
    pub scheduled_frame_number: i64,
}

impl FrameCounterPair {
    /// Both stamps unset
    pub const NEVER: Self = Self {
        rendered_frame_number: NEVER,
        scheduled_frame_number: NEVER,
    };

    /// Whether the pages were ever rendered
    #[inline]
    pub fn has_rendered(&self) -> bool {
        self.rendered_frame_number >= 0
    }

    /// Keep the latest of both stamps
    pub fn fold_max(&mut self, other: &FrameCounterPair) {
        self.rendered_frame_number = self.rendered_frame_number.max(other.rendered_frame_number);
        self.scheduled_frame_number = self.scheduled_frame_number.max(other.scheduled_frame_number);
    }
}

impl Default for FrameCounterPair {
    fn default() -> Self {
        Self::NEVER
    }
}
