//! Void Shadow Cache - Temporal page cache for virtual shadow maps
//!
//! Lets the renderer reuse shadow pages rendered in earlier frames and
//! invalidates exactly the pages that scene changes made stale.
//!
//! # Features
//!
//! - Per-light cache entries with frame-to-frame shadow map id remapping
//! - Dynamic/static primitive classification with hysteresis
//! - CPU-side invalidation collection, batched for the GPU kernels
//! - Time-sliced refresh of fully cached distant lights
//! - Light mobility tracking for resolution biasing
//! - Pool change detection, dynamic resolution and overflow diagnostics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               ShadowCacheManager                 │
//! │  ┌──────────────┐ ┌────────────┐ ┌────────────┐  │
//! │  │ CacheEntries │ │ Classifier │ │  Mobility  │  │
//! │  └──────────────┘ └────────────┘ └────────────┘  │
//! │  ┌──────────────┐ ┌────────────┐ ┌────────────┐  │
//! │  │  Scheduler   │ │   Pools    │ │ Diagnostics│  │
//! │  └──────────────┘ └────────────┘ └────────────┘  │
//! └──────────────────────────────────────────────────┘
//!                          │
//!                 InvalidationBatch
//!                          ▼
//!                   ShadowBackend (GPU)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use void_shadow_cache::prelude::*;
//!
//! let mut cache = ShadowCacheManager::new(CacheConfig::default(), Box::new(NullBackend));
//! cache.set_physical_pool_size(UVec2::new(8192, 8192), 1, 4096);
//!
//! // Each frame
//! cache.begin_frame(frame);
//! cache.process_scene_changes(&changes);
//! let mut array = ShadowMapArray::new();
//! let entry = cache.find_create_entry(LightCacheKey::new(view, light, 0), 1);
//! entry.update_local(&light_update);
//! let id = array.allocate(false, 1)?;
//! entry.update_shadow_map(0, &mut array, id);
//! cache.update_unreferenced_entries(&mut array);
//! cache.kick_distant_light_scheduling();
//! // ... render ...
//! cache.extract_frame_data(&array, true);
//! ```

pub mod backend;
pub mod classifier;
pub mod config;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod frame;
pub mod invalidation;
pub mod manager;
pub mod mobility;
pub mod pool;
pub mod scene;
pub mod scheduler;
pub mod slots;
pub mod task;

pub use backend::{NullBackend, RecordingBackend, ShadowBackend};
pub use config::CacheConfig;
pub use entry::{LightCacheKey, PerLightCacheEntry};
pub use error::{CacheError, Result};
pub use manager::ShadowCacheManager;

pub mod prelude {
    //! Common imports for driving the cache
    pub use crate::backend::{InvalidationParams, NullBackend, RecordingBackend, ShadowBackend};
    pub use crate::config::CacheConfig;
    pub use crate::diagnostics::{CacheStats, OverflowFlags};
    pub use crate::entry::{
        CacheValidity, ClipmapLevelUpdate, ClipmapUpdate, LightCacheKey, LocalLightUpdate, PerLightCacheEntry,
    };
    pub use crate::error::{CacheError, Result};
    pub use crate::frame::{FrameNumber, NEVER};
    pub use crate::invalidation::{InvalidationBatch, InvalidationPayload};
    pub use crate::manager::ShadowCacheManager;
    pub use crate::pool::{HzbFormat, PageManagementFeedback, PoolChange};
    pub use crate::scene::{
        BoundingSphere, InstanceRange, InvalidationBehavior, LightId, LightUpdate, PersistentPrimitiveIndex,
        PrimitiveInfo, ProxyFlags, SceneChanges,
    };
    pub use crate::slots::{ShadowMapArray, ShadowMapId};
    pub use glam::{DMat4, DVec3, UVec2};
}
