//! Light mobility tracking
//!
//! A light that was added or moved this frame gets a mobility factor of 1.0,
//! which then decays linearly to zero over `active_frame_count` frames. The
//! aging step runs on a background [`FrameTask`]; readers must join it first.

use crate::scene::{LightId, LightUpdate};
use crate::task::FrameTask;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug)]
struct ActiveLight {
    last_active_frame: u64,
    factor: f32,
}

/// Only lights with a non-zero factor are stored
#[derive(Clone, Debug, Default)]
struct MobilityState {
    frame: u64,
    active: BTreeMap<LightId, ActiveLight>,
}

impl MobilityState {
    fn mark_active(&mut self, light_id: LightId) {
        self.active.insert(
            light_id,
            ActiveLight {
                last_active_frame: self.frame,
                factor: 1.0,
            },
        );
    }

    fn remove(&mut self, light_id: LightId) {
        self.active.remove(&light_id);
    }

    fn advanced(mut self, active_frame_count: u32) -> Self {
        self.frame += 1;
        let frame = self.frame;
        let span = u64::from(active_frame_count.max(1));

        self.active.retain(|_, light| {
            let age = frame - light.last_active_frame;
            if age >= span {
                return false;
            }
            light.factor = 1.0 - age as f32 / span as f32;
            true
        });
        self
    }

    fn factor(&self, light_id: LightId) -> f32 {
        self.active.get(&light_id).map_or(0.0, |light| light.factor)
    }
}

/// Per-light "moved recently" signal
#[derive(Debug)]
pub struct LightMobilityTracker {
    active_frame_count: u32,
    state: Option<MobilityState>,
    pending: Option<FrameTask<MobilityState>>,
}

impl LightMobilityTracker {
    /// Create a tracker decaying over `active_frame_count` frames
    pub fn new(active_frame_count: u32) -> Self {
        Self {
            active_frame_count: active_frame_count.max(1),
            state: Some(MobilityState::default()),
            pending: None,
        }
    }

    /// Frames a factor takes to reach zero
    pub fn active_frame_count(&self) -> u32 {
        self.active_frame_count
    }

    /// Change the decay span. Affects decay steps from the next frame on.
    pub fn set_active_frame_count(&mut self, active_frame_count: u32) {
        self.wait();
        self.active_frame_count = active_frame_count.max(1);
    }

    /// Mark movable lights that were added or moved this frame as active
    pub fn update(&mut self, added: &[LightUpdate], moved: &[LightUpdate]) {
        self.wait();
        let state = self.state_mut();
        for light in added.iter().chain(moved).filter(|l| l.movable) {
            state.mark_active(light.light_id);
        }
    }

    /// Start this frame's decay step in the background
    pub fn advance_frame(&mut self) {
        self.wait();
        let state = self.state.take().unwrap_or_default();
        let span = self.active_frame_count;
        self.pending = Some(FrameTask::spawn("light-mobility", move || state.advanced(span)));
    }

    /// Join the in-flight decay step, if any
    pub fn wait(&mut self) {
        let Some(task) = self.pending.take() else {
            return;
        };
        match task.wait() {
            Ok(state) => self.state = Some(state),
            Err(err) => {
                log::error!("{}; light mobility reset", err);
                self.state = Some(MobilityState::default());
            }
        }
    }

    /// Whether a decay step is still in flight
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Mobility factor in `[0, 1]`; 0 for unknown or inactive lights.
    ///
    /// Must not be called while a decay step is in flight.
    pub fn mobility_factor(&self, light_id: LightId) -> f32 {
        debug_assert!(
            self.pending.is_none(),
            "light mobility read before joining the in-flight update"
        );
        self.state.as_ref().map_or(0.0, |s| s.factor(light_id))
    }

    /// Forget a removed light
    pub fn remove_light(&mut self, light_id: LightId) {
        self.wait();
        self.state_mut().remove(light_id);
    }

    /// Number of lights with a non-zero factor
    pub fn active_light_count(&self) -> usize {
        debug_assert!(self.pending.is_none());
        self.state.as_ref().map_or(0, |s| s.active.len())
    }

    fn state_mut(&mut self) -> &mut MobilityState {
        self.state.get_or_insert_with(MobilityState::default)
    }
}

impl Default for LightMobilityTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Blend between a static and a moving resolution bias by mobility factor
pub fn interpolate_resolution_bias(non_moving_bias: f32, moving_bias: f32, mobility_factor: f32) -> f32 {
    let moving_bias = moving_bias.max(non_moving_bias);
    non_moving_bias + (moving_bias - non_moving_bias) * mobility_factor.clamp(0.0, 1.0)
}
