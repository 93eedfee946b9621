use super::file::{CATALOG_FORMAT_VERSION, read_catalog, write_catalog};
use super::{AgingCatalog, PropagationStatus, StorageUsage};
use crate::checkpoint::CheckpointTracker;
use crate::core::{
    AgingError, Checkpoint, CheckpointId, CopyId, CycleId, CycleRange, Generation, IndexDbId, Job,
    JobId, JobState, PolicyId, Result,
};
use crate::cycle::assign_cycles;
use crate::policy::StoragePolicy;
use crate::retention::AgingDecision;
use crate::watermark::EvictorState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// Everything recorded for one copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyRecord {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Jobs whose data is fully present on this copy.
    #[serde(default)]
    pub replicated: BTreeSet<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_pct: Option<f64>,
    /// Eviction state of a cache tier, carried across processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evictor_state: Option<EvictorState>,
}

/// Serializable catalog contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogState {
    #[serde(default = "default_format_version")]
    pub version: u32,
    #[serde(default)]
    pub policies: Vec<StoragePolicy>,
    #[serde(default)]
    pub copies: BTreeMap<CopyId, CopyRecord>,
}

fn default_format_version() -> u32 {
    CATALOG_FORMAT_VERSION
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            version: CATALOG_FORMAT_VERSION,
            policies: Vec::new(),
            copies: BTreeMap::new(),
        }
    }
}

/// Capacity view of one cache-tier copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheUsage {
    pub policy_id: PolicyId,
    pub copy_id: CopyId,
    pub usage_pct: Option<f64>,
    pub high_watermark_pct: f64,
    pub low_watermark_pct: f64,
    pub evictor_state: EvictorState,
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: HashMap<CopyId, u32>,
    propagation_delay: Option<Duration>,
}

/// Catalog kept entirely in memory, optionally loaded from and saved to a
/// JSON catalog file.
///
/// Commits are validated against a private copy of the affected record and
/// swapped in only when every change is legal, so a failing commit leaves the
/// copy untouched.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    faults: Mutex<Faults>,
    commits: Mutex<HashMap<CopyId, u32>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: CatalogState) -> Self {
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = run_blocking(move || read_catalog(&path)).await?;
        Ok(Self::from_state(state))
    }

    /// Write the whole catalog to `path`, replacing it atomically.
    ///
    /// ```no_run
    /// # use dataaging::InMemoryCatalog;
    /// # tokio_test::block_on(async {
    /// let catalog = InMemoryCatalog::open("catalog.json").await.unwrap();
    /// catalog.save("catalog.json").await.unwrap();
    /// # });
    /// ```
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        // Writers only wait for the clone, never for the disk.
        let state = self.snapshot().await;
        let path: PathBuf = path.as_ref().to_path_buf();
        run_blocking(move || write_catalog(&path, &state)).await
    }

    pub async fn snapshot(&self) -> CatalogState {
        self.state.read().await.clone()
    }

    /// Usage sample and eviction state of every cache-tier copy, in policy order.
    pub async fn cache_usage(&self) -> Vec<CacheUsage> {
        let state = self.state.read().await;
        let mut rows = Vec::new();
        for policy in &state.policies {
            for copy in &policy.copies {
                let Some(watermark) = &copy.cache else {
                    continue;
                };
                let record = state.copies.get(&copy.copy_id);
                rows.push(CacheUsage {
                    policy_id: policy.policy_id,
                    copy_id: copy.copy_id,
                    usage_pct: record.and_then(|record| record.usage_pct),
                    high_watermark_pct: watermark.high_watermark_pct,
                    low_watermark_pct: watermark.low_watermark_pct,
                    evictor_state: record
                        .and_then(|record| record.evictor_state)
                        .unwrap_or_default(),
                });
            }
        }
        rows
    }

    /// Install or replace a policy definition.
    pub async fn add_policy(&self, policy: StoragePolicy) -> Result<()> {
        policy.validate()?;
        let mut state = self.state.write().await;
        state.policies.retain(|existing| existing.policy_id != policy.policy_id);
        state.policies.push(policy);
        Ok(())
    }

    /// Append a job to a copy's stream. Returns the cycle it landed in.
    pub async fn record_job(&self, copy_id: CopyId, job: Job) -> Result<CycleId> {
        let mut state = self.state.write().await;
        let record = state.copies.entry(copy_id).or_default();

        let mut jobs = record.jobs.clone();
        let job_id = job.job_id;
        jobs.push(job);
        let cycles = assign_cycles(&jobs)?;
        let cycle_id = cycles.cycle_of(job_id).ok_or_else(|| {
            AgingError::MalformedJobStream(format!("{} was not assigned a cycle", job_id))
        })?;

        record.jobs = jobs;
        Ok(cycle_id)
    }

    /// Record the next checkpoint generation of `index_db` on a copy.
    pub async fn record_checkpoint(
        &self,
        copy_id: CopyId,
        index_db: IndexDbId,
        checkpoint_id: CheckpointId,
        covered: CycleRange,
    ) -> Result<Generation> {
        let mut state = self.state.write().await;
        let record = state.copies.entry(copy_id).or_default();

        let mut tracker = CheckpointTracker::from_checkpoints(index_db, &record.checkpoints)?;
        let generation = tracker.record_checkpoint(checkpoint_id, covered)?;
        if let Some(checkpoint) = tracker.get(checkpoint_id) {
            record.checkpoints.push(checkpoint.clone());
        }
        Ok(generation)
    }

    pub async fn mark_replicated(&self, copy_id: CopyId, job_id: JobId) {
        let mut state = self.state.write().await;
        state
            .copies
            .entry(copy_id)
            .or_default()
            .replicated
            .insert(job_id);
    }

    pub async fn set_usage(&self, cache_id: CopyId, usage_pct: f64) {
        let mut state = self.state.write().await;
        state.copies.entry(cache_id).or_default().usage_pct = Some(usage_pct);
    }

    /// Make the next `count` commits to `copy_id` fail with a persistence error.
    pub fn fail_next_commits(&self, copy_id: CopyId, count: u32) -> Result<()> {
        self.faults.lock()?.failing_commits.insert(copy_id, count);
        Ok(())
    }

    /// Delay every propagation status answer.
    pub fn set_propagation_delay(&self, delay: Option<Duration>) -> Result<()> {
        self.faults.lock()?.propagation_delay = delay;
        Ok(())
    }

    /// Number of successful commits to `copy_id`.
    pub fn commit_count(&self, copy_id: CopyId) -> Result<u32> {
        Ok(self.commits.lock()?.get(&copy_id).copied().unwrap_or(0))
    }

    fn take_injected_failure(&self, copy_id: CopyId) -> Result<()> {
        let mut faults = self.faults.lock()?;
        match faults.failing_commits.get_mut(&copy_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AgingError::Persistence(format!(
                    "injected commit failure for {}",
                    copy_id
                )))
            }
            _ => Ok(()),
        }
    }

    fn propagation_delay(&self) -> Result<Option<Duration>> {
        Ok(self.faults.lock()?.propagation_delay)
    }

    fn count_commit(&self, copy_id: CopyId) -> Result<()> {
        *self.commits.lock()?.entry(copy_id).or_default() += 1;
        Ok(())
    }
}

fn apply_decision(copy_id: CopyId, record: &CopyRecord, decision: &AgingDecision) -> Result<CopyRecord> {
    let mut next = record.clone();

    let mut missing_jobs: BTreeSet<JobId> = decision
        .age_jobs
        .union(&decision.retained_jobs)
        .copied()
        .collect();
    for job in next.jobs.iter_mut() {
        let target = if decision.age_jobs.contains(&job.job_id) {
            JobState::Aged
        } else if decision.retained_jobs.contains(&job.job_id) {
            JobState::Retained
        } else {
            continue;
        };
        job.state = job.state.transition(job.job_id, target)?;
        missing_jobs.remove(&job.job_id);
    }
    if let Some(job_id) = missing_jobs.first() {
        return Err(AgingError::InvalidInput(format!(
            "{} is not recorded on {}",
            job_id, copy_id
        )));
    }

    let mut missing_checkpoints = decision.age_checkpoints.clone();
    for checkpoint in next.checkpoints.iter_mut() {
        if missing_checkpoints.remove(&checkpoint.checkpoint_id) {
            checkpoint.aged = true;
        }
    }
    if let Some(checkpoint_id) = missing_checkpoints.first() {
        return Err(AgingError::InvalidInput(format!(
            "{} is not recorded on {}",
            checkpoint_id, copy_id
        )));
    }

    Ok(next)
}

#[async_trait]
impl AgingCatalog for InMemoryCatalog {
    async fn load_jobs(&self, copy_id: CopyId) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .copies
            .get(&copy_id)
            .map(|record| record.jobs.clone())
            .unwrap_or_default())
    }

    async fn load_checkpoints(&self, copy_id: CopyId, index_db: IndexDbId) -> Result<Vec<Checkpoint>> {
        let state = self.state.read().await;
        Ok(state
            .copies
            .get(&copy_id)
            .map(|record| {
                record
                    .checkpoints
                    .iter()
                    .filter(|cp| cp.index_db == index_db)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_policy(&self, policy_id: PolicyId) -> Result<StoragePolicy> {
        let state = self.state.read().await;
        state
            .policies
            .iter()
            .find(|policy| policy.policy_id == policy_id)
            .cloned()
            .ok_or(AgingError::PolicyNotFound(policy_id))
    }

    async fn commit_aged(&self, copy_id: CopyId, decision: &AgingDecision) -> Result<()> {
        self.take_injected_failure(copy_id)?;

        let mut state = self.state.write().await;
        let record = state
            .copies
            .get(&copy_id)
            .ok_or(AgingError::CopyNotFound(copy_id))?;
        let next = apply_decision(copy_id, record, decision)?;
        state.copies.insert(copy_id, next);
        drop(state);

        self.count_commit(copy_id)?;
        log::debug!(
            "committed {} aged jobs and {} aged checkpoints on {}",
            decision.age_jobs.len(),
            decision.age_checkpoints.len(),
            copy_id
        );
        Ok(())
    }
}

#[async_trait]
impl PropagationStatus for InMemoryCatalog {
    async fn is_job_replicated(&self, job_id: JobId, copy_id: CopyId) -> Result<bool> {
        if let Some(delay) = self.propagation_delay()? {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.read().await;
        Ok(state
            .copies
            .get(&copy_id)
            .is_some_and(|record| record.replicated.contains(&job_id)))
    }
}

#[async_trait]
impl StorageUsage for InMemoryCatalog {
    async fn usage_pct(&self, cache_id: CopyId) -> Result<f64> {
        let state = self.state.read().await;
        state
            .copies
            .get(&cache_id)
            .and_then(|record| record.usage_pct)
            .ok_or_else(|| AgingError::Persistence(format!("no usage sample for {}", cache_id)))
    }

    async fn load_evictor_state(&self, cache_id: CopyId) -> Result<Option<EvictorState>> {
        let state = self.state.read().await;
        Ok(state
            .copies
            .get(&cache_id)
            .and_then(|record| record.evictor_state))
    }

    async fn save_evictor_state(&self, cache_id: CopyId, evictor_state: EvictorState) -> Result<()> {
        let mut state = self.state.write().await;
        state.copies.entry(cache_id).or_default().evictor_state = Some(evictor_state);
        Ok(())
    }
}

/// Catalog files are read and written off the async worker threads.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| AgingError::Persistence(format!("catalog file task failed: {}", err)))?
}
