pub mod error;
pub mod types;

pub use error::{AgingError, ErrorClass, Result};
pub use types::{
    BackupType, Checkpoint, CheckpointId, CopyId, CycleId, CycleRange, Generation, IndexDbId, Job,
    JobId, JobState, PolicyId,
};
