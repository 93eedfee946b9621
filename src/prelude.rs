//! Recommended imports grouped by how much of the engine a caller drives.
//!
//! `engine` covers running passes against a catalog. `evaluation` is for
//! callers that only want the pure decisions without a runner.

pub mod engine {
    //! Running aging passes.
    pub use crate::{
        AgingCatalog, AgingRunner, CancelToken, CopyOutcome, EngineConfig, InMemoryCatalog,
        PassReport, PassStatus, PolicyStore, PropagationStatus, StorageUsage, spawn_schedule,
    };
}

pub mod evaluation {
    //! Pure retention and eviction decisions.
    pub use crate::{
        AgingDecision, CheckpointTracker, RetentionPolicy, StorageCopy, WatermarkConfig,
        WatermarkEvictor, assign_cycles, evaluate, evaluate_with_holds,
    };
    pub use crate::watermark::{CacheTier, EvictionCandidate};
}
