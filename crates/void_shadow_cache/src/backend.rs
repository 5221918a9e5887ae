//! GPU boundary
//!
//! The cache never touches GPU resources directly. Everything that crosses
//! into the invalidation kernels or the page pools goes through
//! [`ShadowBackend`], so the cache runs the same against a real renderer or
//! against [`RecordingBackend`] in tests.

use crate::invalidation::{InvalidationBatch, InvalidationDispatchBatch, InvalidationRecord};
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-dispatch parameters of the invalidation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidationParams {
    /// Cull invalidated instances against last frame's HZB
    pub use_hzb: bool,
}

/// Render backend operations used by the cache
pub trait ShadowBackend: Send {
    /// Upload a finalized batch and dispatch the invalidation kernels
    fn submit_invalidations(&mut self, batch: &InvalidationBatch, params: &InvalidationParams);

    /// Reset per-page metadata of the physical pool after a full invalidation
    fn clear_physical_page_metadata(&mut self);

    /// Whether the physical pool may be a reserved (sparse) resource
    fn supports_reserved_resources(&self) -> bool {
        false
    }
}

/// Backend that drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBackend;

impl ShadowBackend for NullBackend {
    fn submit_invalidations(&mut self, batch: &InvalidationBatch, _params: &InvalidationParams) {
        debug_assert!(batch.is_finalized(), "invalidation batch submitted before finalize");
    }

    fn clear_physical_page_metadata(&mut self) {}
}

/// One recorded dispatch
#[derive(Clone, Debug, PartialEq)]
pub struct SubmittedInvalidations {
    pub items: Vec<InvalidationRecord>,
    pub batches: Vec<InvalidationDispatchBatch>,
    pub params: InvalidationParams,
}

/// Everything a [`RecordingBackend`] has seen
#[derive(Clone, Debug, Default)]
pub struct BackendLog {
    pub submissions: Vec<SubmittedInvalidations>,
    pub metadata_clears: u32,
}

impl BackendLog {
    /// Items across all submissions
    pub fn all_items(&self) -> impl Iterator<Item = &InvalidationRecord> {
        self.submissions.iter().flat_map(|s| s.items.iter())
    }
}

/// Backend that records calls into a shared log
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    log: Arc<Mutex<BackendLog>>,
    supports_reserved: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report reserved resource support
    pub fn with_reserved_resources(mut self, supported: bool) -> Self {
        self.supports_reserved = supported;
        self
    }

    /// Handle to the log, usable after the backend is boxed into the cache
    pub fn log(&self) -> Arc<Mutex<BackendLog>> {
        Arc::clone(&self.log)
    }

    /// Take and reset the log
    pub fn take_log(&self) -> BackendLog {
        std::mem::take(&mut *self.log.lock())
    }
}

impl ShadowBackend for RecordingBackend {
    fn submit_invalidations(&mut self, batch: &InvalidationBatch, params: &InvalidationParams) {
        debug_assert!(batch.is_finalized(), "invalidation batch submitted before finalize");
        self.log.lock().submissions.push(SubmittedInvalidations {
            items: batch.items().to_vec(),
            batches: batch.batches().to_vec(),
            params: *params,
        });
    }

    fn clear_physical_page_metadata(&mut self) {
        self.log.lock().metadata_clears += 1;
    }

    fn supports_reserved_resources(&self) -> bool {
        self.supports_reserved
    }
}
