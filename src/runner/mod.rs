//! Aging passes.
//!
//! A pass takes a snapshot of one storage policy, evaluates every copy (in
//! parallel, reads only), then commits the copies one at a time from the
//! primary outward. Copy-local problems end up in the copy's report and never
//! abort the pass.

mod cancel;
mod report;
mod schedule;

pub use cancel::CancelToken;
pub use report::{CopyOutcome, CopyReport, DeferReason, PassReport, PassStatus};
pub use schedule::spawn_schedule;

use crate::config::EngineConfig;
use crate::core::{AgingError, CopyId, ErrorClass, Job, JobId, PolicyId, Result};
use crate::policy::{PolicySnapshot, PolicyStore, StorageCopy, WatermarkConfig};
use crate::retention::{AgingDecision, evaluate, evaluate_with_holds};
use crate::storage::{AgingCatalog, PropagationStatus, StorageUsage};
use crate::watermark::{CacheTier, EvictionCandidate, EvictionTarget, EvictorState, WatermarkEvictor};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

type PassLock = Arc<tokio::sync::Mutex<()>>;

pub struct AgingRunner {
    policies: Arc<PolicyStore>,
    catalog: Arc<dyn AgingCatalog>,
    propagation: Arc<dyn PropagationStatus>,
    usage: Arc<dyn StorageUsage>,
    config: EngineConfig,
    evictor: Mutex<WatermarkEvictor>,
    pass_locks: Mutex<HashMap<PolicyId, PassLock>>,
}

/// A copy after the read-only phase of a pass.
struct PreparedCopy {
    report: CopyReport,
    /// The decision still has to be committed.
    pending: bool,
    /// The cache could not be brought under its low watermark. Retention is
    /// still committed, then the copy is reported as failed.
    exhausted: Option<AgingError>,
}

impl PreparedCopy {
    fn settled(copy: &StorageCopy, outcome: CopyOutcome) -> Self {
        Self {
            report: CopyReport::new(copy.copy_id, copy.precedence, outcome),
            pending: false,
            exhausted: None,
        }
    }
}

fn outcome_for(err: &AgingError) -> CopyOutcome {
    match (err.class(), err) {
        (ErrorClass::Transient, AgingError::PropagationTimeout(_)) => {
            CopyOutcome::Deferred(DeferReason::PropagationTimeout)
        }
        (ErrorClass::Transient, _) => CopyOutcome::Deferred(DeferReason::Transient(err.to_string())),
        (ErrorClass::Input | ErrorClass::Resource, _) => CopyOutcome::Failed(err.to_string()),
    }
}

impl AgingRunner {
    pub fn new(
        policies: Arc<PolicyStore>,
        catalog: Arc<dyn AgingCatalog>,
        propagation: Arc<dyn PropagationStatus>,
        usage: Arc<dyn StorageUsage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            policies,
            catalog,
            propagation,
            usage,
            config,
            evictor: Mutex::new(WatermarkEvictor::new()),
            pass_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runner over a single backend that answers every collaborator question.
    pub fn with_backend<B>(policies: Arc<PolicyStore>, backend: Arc<B>, config: EngineConfig) -> Self
    where
        B: AgingCatalog + PropagationStatus + StorageUsage + 'static,
    {
        Self::new(policies, backend.clone(), backend.clone(), backend, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn evictor_state(&self, cache_id: CopyId) -> Result<EvictorState> {
        Ok(self.evictor.lock()?.state(cache_id))
    }

    pub async fn run_pass(&self, policy_id: PolicyId) -> Result<PassReport> {
        self.run_pass_at(policy_id, Utc::now()).await
    }

    /// Run a pass evaluating retention as of `now`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use dataaging::{
    ///     AgingRunner, CopyId, EngineConfig, InMemoryCatalog, Job, PassStatus, PolicyId,
    ///     PolicyStore, RetentionPolicy, StorageCopy, StoragePolicy,
    /// };
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let catalog = Arc::new(InMemoryCatalog::new());
    /// let now = Utc::now();
    /// for (id, days) in [(1, 3), (2, 2), (3, 1)] {
    ///     catalog.record_job(CopyId(1), Job::full(id, now - Duration::days(days))).await.unwrap();
    /// }
    ///
    /// let store = Arc::new(PolicyStore::new());
    /// store
    ///     .define(StoragePolicy::new(1, "gold").with_copy(StorageCopy::new(
    ///         1,
    ///         "primary",
    ///         0,
    ///         RetentionPolicy::cycles_only(1),
    ///     )))
    ///     .unwrap();
    ///
    /// let runner = AgingRunner::with_backend(store, catalog, EngineConfig::default());
    /// let report = runner.run_pass_at(PolicyId(1), now).await.unwrap();
    /// assert_eq!(report.status, PassStatus::Completed);
    /// assert_eq!(report.aged_job_count(), 2);
    /// # });
    /// ```
    pub async fn run_pass_at(&self, policy_id: PolicyId, now: DateTime<Utc>) -> Result<PassReport> {
        self.run_pass_cancellable(policy_id, now, &CancelToken::new())
            .await
    }

    /// Run a pass that stops before the next copy commit once `cancel` fires.
    ///
    /// Fails only when the pass cannot start at all: another pass of the same
    /// policy holds the lock past `pass_lock_timeout`, or the policy is unknown
    /// to both the store and the catalog.
    pub async fn run_pass_cancellable(
        &self,
        policy_id: PolicyId,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PassReport> {
        let lock = self.pass_lock(policy_id)?;
        let _pass_guard = timeout(self.config.pass_lock_timeout_duration(), lock.lock_owned())
            .await
            .map_err(|_| AgingError::PassInProgress(policy_id))?;

        let snapshot = match self.policies.snapshot(policy_id) {
            Ok(snapshot) => snapshot,
            Err(AgingError::PolicyNotFound(_)) => {
                self.policies
                    .sync_from(self.catalog.as_ref(), policy_id)
                    .await?;
                self.policies.snapshot(policy_id)?
            }
            Err(err) => return Err(err),
        };

        let pass_id = Uuid::new_v4();
        let span = info_span!(
            "aging.pass",
            pass_id = %pass_id,
            policy_id = %policy_id,
            policy_version = snapshot.version()
        );
        self.execute_pass(pass_id, snapshot, now, cancel)
            .instrument(span)
            .await
    }

    /// Run one pass per policy, concurrently. Results keep the input order.
    pub async fn run_policies(
        &self,
        policy_ids: &[PolicyId],
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Vec<(PolicyId, Result<PassReport>)> {
        let passes = policy_ids.iter().map(|policy_id| async move {
            (
                *policy_id,
                self.run_pass_cancellable(*policy_id, now, cancel).await,
            )
        });
        join_all(passes).await
    }

    fn pass_lock(&self, policy_id: PolicyId) -> Result<PassLock> {
        let mut locks = self.pass_locks.lock()?;
        Ok(locks.entry(policy_id).or_default().clone())
    }

    async fn execute_pass(
        &self,
        pass_id: Uuid,
        snapshot: PolicySnapshot,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PassReport> {
        let started_at = Utc::now();
        let copies = snapshot.policy().copies_by_precedence();
        event!(Level::INFO, copies = copies.len(), "aging pass started");

        let prepared: Vec<PreparedCopy> = if self.config.parallel_evaluation {
            join_all(copies.iter().map(|copy| self.prepare_copy(copy, now))).await
        } else {
            let mut prepared = Vec::with_capacity(copies.len());
            for copy in &copies {
                prepared.push(self.prepare_copy(copy, now).await);
            }
            prepared
        };

        let mut per_copy = BTreeMap::new();
        for copy in prepared {
            let report = if copy.pending && cancel.is_cancelled() {
                let mut report = copy.report;
                report.outcome = CopyOutcome::Cancelled;
                report
            } else {
                self.commit_copy(copy).await
            };

            event!(
                Level::INFO,
                copy_id = %report.copy_id,
                outcome = %report.outcome,
                aged_jobs = report.decision.age_jobs.len(),
                aged_checkpoints = report.decision.age_checkpoints.len(),
                deferred_jobs = report.deferred_jobs.len(),
                "copy processed"
            );
            per_copy.insert(report.copy_id, report);
        }

        let status = PassStatus::from_copies(per_copy.values().map(|report| &report.outcome));
        event!(Level::INFO, status = %status, "aging pass finished");

        Ok(PassReport {
            pass_id,
            policy_id: snapshot.policy_id(),
            policy_version: snapshot.version(),
            started_at,
            finished_at: Utc::now(),
            status,
            per_copy,
        })
    }

    async fn prepare_copy(&self, copy: &StorageCopy, now: DateTime<Utc>) -> PreparedCopy {
        match self.try_prepare_copy(copy, now).await {
            Ok(prepared) => prepared,
            Err(err) => {
                if !err.is_transient() {
                    event!(Level::ERROR, copy_id = %copy.copy_id, error = %err, "copy evaluation failed");
                } else {
                    event!(Level::WARN, copy_id = %copy.copy_id, error = %err, "copy deferred");
                }
                PreparedCopy::settled(copy, outcome_for(&err))
            }
        }
    }

    async fn try_prepare_copy(&self, copy: &StorageCopy, now: DateTime<Utc>) -> Result<PreparedCopy> {
        let jobs = self.catalog.load_jobs(copy.copy_id).await?;
        if jobs.is_empty() {
            return Ok(PreparedCopy::settled(copy, CopyOutcome::Skipped));
        }
        let checkpoints = self
            .catalog
            .load_checkpoints(copy.copy_id, copy.index_db)
            .await?;

        let mut decision = evaluate(copy, &copy.retention, &jobs, &checkpoints, now)?;
        let mut holds = BTreeSet::new();
        let mut deferred_jobs = BTreeSet::new();

        if !copy.is_primary() && (!decision.age_jobs.is_empty() || copy.is_cache_tier()) {
            holds = self.unreplicated_jobs(copy.copy_id, &jobs).await?;
            if !holds.is_empty() {
                deferred_jobs = decision.age_jobs.intersection(&holds).copied().collect();
                decision =
                    evaluate_with_holds(copy, &copy.retention, &jobs, &checkpoints, now, &holds)?;
            }
        }

        let mut report = CopyReport::new(copy.copy_id, copy.precedence, CopyOutcome::Committed);
        let mut exhausted = None;
        if let Some(watermark) = &copy.cache {
            match self
                .check_capacity(copy.copy_id, watermark, &jobs, &decision, &holds)
                .await
            {
                Ok(Some(target)) => {
                    decision.absorb_evicted(target.victims.iter().copied());
                    report.eviction = Some(target);
                }
                Ok(None) => {}
                Err(err) if err.class() == ErrorClass::Resource => {
                    event!(Level::ERROR, copy_id = %copy.copy_id, error = %err, "cache capacity exhausted");
                    exhausted = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        report.decision = decision;
        report.deferred_jobs = deferred_jobs;
        Ok(PreparedCopy {
            report,
            pending: true,
            exhausted,
        })
    }

    /// Live jobs not yet fully present on `copy_id`. All questions share one
    /// timeout; running out of time defers the copy.
    async fn unreplicated_jobs(&self, copy_id: CopyId, jobs: &[Job]) -> Result<BTreeSet<JobId>> {
        let queries = jobs.iter().filter(|job| !job.is_aged()).map(|job| async move {
            let replicated = self.propagation.is_job_replicated(job.job_id, copy_id).await;
            (job.job_id, replicated)
        });

        let answers = timeout(self.config.propagation_timeout_duration(), join_all(queries))
            .await
            .map_err(|_| AgingError::PropagationTimeout(copy_id))?;

        let mut holds = BTreeSet::new();
        for (job_id, replicated) in answers {
            if !replicated? {
                holds.insert(job_id);
            }
        }
        if !holds.is_empty() {
            event!(Level::DEBUG, copy_id = %copy_id, held = holds.len(), "jobs awaiting propagation");
        }
        Ok(holds)
    }

    async fn check_capacity(
        &self,
        cache_id: CopyId,
        watermark: &WatermarkConfig,
        jobs: &[Job],
        decision: &AgingDecision,
        holds: &BTreeSet<JobId>,
    ) -> Result<Option<EvictionTarget>> {
        let usage_pct = self.usage.usage_pct(cache_id).await?;

        let candidates: Vec<EvictionCandidate> = jobs
            .iter()
            .filter(|job| {
                !job.is_aged()
                    && !holds.contains(&job.job_id)
                    && !decision.age_jobs.contains(&job.job_id)
            })
            .map(|job| EvictionCandidate {
                job_id: job.job_id,
                written_at: job.end_time,
                size_bytes: job.size_bytes,
            })
            .collect();

        let cache = CacheTier {
            cache_id,
            watermark,
            candidates: &candidates,
        };
        // The catalog's record wins over this runner's memory, so hysteresis
        // carries over between processes.
        let recorded = self.usage.load_evictor_state(cache_id).await?;
        let (checked, state) = {
            let mut evictor = self.evictor.lock()?;
            if let Some(recorded) = recorded {
                evictor.restore(cache_id, recorded);
            }
            let checked = evictor.check(&cache, usage_pct);
            (checked, evictor.state(cache_id))
        };
        if recorded != Some(state) {
            self.usage.save_evictor_state(cache_id, state).await?;
        }

        let target = checked?;
        if let Some(target) = &target {
            event!(
                Level::INFO,
                cache_id = %cache_id,
                usage_pct,
                target_bytes = target.target_bytes,
                victims = target.victims.len(),
                "cache above watermark, evicting"
            );
        }
        Ok(target)
    }

    async fn commit_copy(&self, prepared: PreparedCopy) -> CopyReport {
        let PreparedCopy {
            mut report,
            pending,
            exhausted,
        } = prepared;
        if !pending {
            return report;
        }

        let committed = if report.decision.is_empty() {
            Ok(())
        } else {
            self.commit_with_retry(report.copy_id, &report.decision)
                .await
        };

        report.outcome = match committed {
            Ok(()) => {
                report.committed = true;
                match exhausted {
                    Some(err) => CopyOutcome::Failed(err.to_string()),
                    None if !report.deferred_jobs.is_empty() => CopyOutcome::CommittedWithDeferrals,
                    None => CopyOutcome::Committed,
                }
            }
            Err(err) if err.is_transient() => {
                event!(Level::WARN, copy_id = %report.copy_id, error = %err, "commit deferred");
                CopyOutcome::Deferred(DeferReason::CommitFailed(err.to_string()))
            }
            Err(err) => {
                event!(Level::ERROR, copy_id = %report.copy_id, error = %err, "commit rejected");
                CopyOutcome::Failed(err.to_string())
            }
        };
        report
    }

    async fn commit_with_retry(&self, copy_id: CopyId, decision: &AgingDecision) -> Result<()> {
        let retry = &self.config.commit_retry;
        let mut attempt = 1;
        loop {
            match self.catalog.commit_aged(copy_id, decision).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    event!(
                        Level::WARN,
                        copy_id = %copy_id,
                        attempt,
                        error = %err,
                        "commit failed, retrying"
                    );
                    tokio::time::sleep(retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
