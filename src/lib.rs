// ============================================================================
// dataaging: retention and data aging for multi-copy storage policies
// ============================================================================

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod cycle;
pub mod policy;
pub mod prelude;
pub mod retention;
pub mod runner;
pub mod storage;
pub mod watermark;

// Re-export main types for convenience
pub use checkpoint::CheckpointTracker;
pub use config::{EngineConfig, RetryPolicy};
pub use crate::core::{
    AgingError, BackupType, Checkpoint, CheckpointId, CopyId, CycleId, CycleRange, ErrorClass,
    Generation, IndexDbId, Job, JobId, JobState, PolicyId, Result,
};
pub use cycle::{Cycle, CycleMap, assign_cycles};
pub use policy::{
    ExtendedRule, FullFrequency, PolicySnapshot, PolicyStore, RetentionPolicy, StorageCopy,
    StoragePolicy, WatermarkConfig,
};
pub use retention::{AgingDecision, evaluate, evaluate_with_holds};
pub use runner::{
    AgingRunner, CancelToken, CopyOutcome, CopyReport, DeferReason, PassReport, PassStatus,
    spawn_schedule,
};
pub use storage::{AgingCatalog, InMemoryCatalog, PropagationStatus, StorageUsage};
pub use watermark::{EvictionTarget, EvictorState, WatermarkEvictor};
