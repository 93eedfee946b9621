//! Collaborator interfaces the engine consumes, plus an in-memory catalog
//! that implements all of them.

mod file;
mod memory;

pub use file::{CATALOG_FORMAT_VERSION, read_catalog, write_catalog};
pub use memory::{CacheUsage, CatalogState, CopyRecord, InMemoryCatalog};

use crate::core::{Checkpoint, CopyId, IndexDbId, Job, JobId, PolicyId, Result};
use crate::policy::StoragePolicy;
use crate::retention::AgingDecision;
use crate::watermark::EvictorState;
use async_trait::async_trait;

/// Persistent job, checkpoint and policy metadata.
#[async_trait]
pub trait AgingCatalog: Send + Sync {
    /// Jobs recorded on `copy_id`, ordered by start time.
    async fn load_jobs(&self, copy_id: CopyId) -> Result<Vec<Job>>;

    /// Checkpoints of `index_db` with their `aged` flag as seen by `copy_id`.
    async fn load_checkpoints(&self, copy_id: CopyId, index_db: IndexDbId) -> Result<Vec<Checkpoint>>;

    async fn load_policy(&self, policy_id: PolicyId) -> Result<StoragePolicy>;

    /// Apply `decision` to `copy_id`: every listed job and checkpoint is marked
    /// aged and every retained job marked retained, or nothing changes.
    /// Re-applying an already committed decision must succeed.
    async fn commit_aged(&self, copy_id: CopyId, decision: &AgingDecision) -> Result<()>;
}

/// Replication progress between copies.
#[async_trait]
pub trait PropagationStatus: Send + Sync {
    async fn is_job_replicated(&self, job_id: JobId, copy_id: CopyId) -> Result<bool>;
}

/// Physical space used by cache-tier copies.
#[async_trait]
pub trait StorageUsage: Send + Sync {
    /// Used space as a percentage of capacity.
    async fn usage_pct(&self, cache_id: CopyId) -> Result<f64>;

    /// Last eviction state recorded for `cache_id`. `None` when the backend
    /// does not keep one; the runner then relies on its own memory.
    async fn load_evictor_state(&self, _cache_id: CopyId) -> Result<Option<EvictorState>> {
        Ok(None)
    }

    async fn save_evictor_state(&self, _cache_id: CopyId, _state: EvictorState) -> Result<()> {
        Ok(())
    }
}
