//! Error types for the shadow cache
//!
//! Errors never leave the per-frame entry points of the manager; they are
//! logged there and the frame degrades instead.

use thiserror::Error;

/// Shadow cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Not enough shadow map ids left in the frame's array
    #[error("Shadow map slot capacity exceeded: requested {requested}, available {available}")]
    SlotCapacityExceeded {
        /// Ids asked for
        requested: u32,
        /// Ids still free
        available: u32,
    },

    /// Pool request that cannot be allocated
    #[error("Invalid pool description: {0}")]
    InvalidPoolDesc(String),

    /// Background thread could not be started
    #[error("Failed to spawn task '{name}': {source}")]
    TaskSpawn {
        /// Task name
        name: &'static str,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Background task panicked before delivering a result
    #[error("Task '{0}' panicked")]
    TaskPanicked(&'static str),
}

/// Result type for shadow cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
