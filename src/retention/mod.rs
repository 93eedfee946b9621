//! Retention evaluation: which jobs and checkpoints of one copy may be aged.
//!
//! Evaluation is a pure function of its inputs. It never touches the catalog
//! and returns identical decisions for identical inputs, so callers may retry
//! it freely.

mod window;

pub use window::{RetainedWindow, WindowRule, pinned_jobs, retained_window};

use crate::checkpoint::CheckpointTracker;
use crate::core::{AgingError, Checkpoint, CheckpointId, CycleId, Job, JobId, Result};
use crate::cycle::{CycleMap, assign_cycles};
use crate::policy::{RetentionPolicy, StorageCopy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Outcome of evaluating one copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingDecision {
    pub age_jobs: BTreeSet<JobId>,
    pub age_checkpoints: BTreeSet<CheckpointId>,
    /// Live jobs that were looked at and kept.
    #[serde(default)]
    pub retained_jobs: BTreeSet<JobId>,
}

impl AgingDecision {
    /// True when committing this decision would change nothing.
    pub fn is_empty(&self) -> bool {
        self.age_jobs.is_empty() && self.age_checkpoints.is_empty() && self.retained_jobs.is_empty()
    }

    pub fn ages_anything(&self) -> bool {
        !self.age_jobs.is_empty() || !self.age_checkpoints.is_empty()
    }

    /// Move capacity-evicted jobs into the aged set.
    pub fn absorb_evicted<I>(&mut self, evicted: I)
    where
        I: IntoIterator<Item = JobId>,
    {
        for job in evicted {
            self.retained_jobs.remove(&job);
            self.age_jobs.insert(job);
        }
    }
}

/// Evaluate `copy` under `policy` at `now`.
pub fn evaluate(
    copy: &StorageCopy,
    policy: &RetentionPolicy,
    jobs: &[Job],
    checkpoints: &[Checkpoint],
    now: DateTime<Utc>,
) -> Result<AgingDecision> {
    evaluate_with_holds(copy, policy, jobs, checkpoints, now, &BTreeSet::new())
}

/// Like [`evaluate`], but jobs in `holds` are never aged in this pass (their
/// cycles then count as not fully aged).
pub fn evaluate_with_holds(
    copy: &StorageCopy,
    policy: &RetentionPolicy,
    jobs: &[Job],
    checkpoints: &[Checkpoint],
    now: DateTime<Utc>,
    holds: &BTreeSet<JobId>,
) -> Result<AgingDecision> {
    policy.validate()?;
    let cycles = assign_cycles(jobs)?;
    if cycles.is_empty() {
        return Err(AgingError::NoRecordedCycles(copy.copy_id));
    }
    let tracker = CheckpointTracker::from_checkpoints(copy.index_db, checkpoints)?;

    let window = retained_window(cycles.cycles(), policy, now);
    let pinned = pinned_jobs(jobs, policy, now);
    let evaluation = Evaluation {
        cycles: &cycles,
        jobs: jobs.iter().map(|job| (job.job_id, job)).collect(),
        pinned: &pinned,
        holds,
    };

    let mut eligible: BTreeSet<CycleId> = cycles
        .cycles()
        .iter()
        .map(|cycle| cycle.cycle_id)
        .filter(|id| window.is_older(*id) && !cycles.is_open(*id))
        .collect();

    // A cycle whose anchoring checkpoint stays must stay too. Withdrawing a
    // cycle can keep further checkpoints alive, so repeat until stable.
    loop {
        let withdrawn: Vec<CycleId> = eligible
            .iter()
            .copied()
            .filter(|cycle_id| {
                tracker
                    .latest_checkpoint_covering(*cycle_id)
                    .is_some_and(|anchor| !evaluation.checkpoint_ages(anchor, &eligible))
            })
            .collect();
        if withdrawn.is_empty() {
            break;
        }
        for cycle_id in withdrawn {
            eligible.remove(&cycle_id);
        }
    }

    let mut decision = AgingDecision::default();
    for cycle_id in &eligible {
        let Some(cycle) = cycles.get(*cycle_id) else {
            continue;
        };
        for job_id in &cycle.jobs {
            if evaluation.job_ages(*job_id) {
                decision.age_jobs.insert(*job_id);
            }
        }
    }

    // Checkpoints only after jobs: their eligibility depends on the final set.
    for checkpoint in tracker.iter() {
        if !checkpoint.aged && evaluation.checkpoint_ages(checkpoint, &eligible) {
            decision.age_checkpoints.insert(checkpoint.checkpoint_id);
        }
    }

    decision.retained_jobs = jobs
        .iter()
        .filter(|job| !job.is_aged() && !decision.age_jobs.contains(&job.job_id))
        .map(|job| job.job_id)
        .collect();

    Ok(decision)
}

struct Evaluation<'a> {
    cycles: &'a CycleMap,
    jobs: HashMap<JobId, &'a Job>,
    pinned: &'a BTreeSet<JobId>,
    holds: &'a BTreeSet<JobId>,
}

impl Evaluation<'_> {
    /// Whether a job in an eligible cycle is aged in this pass.
    fn job_ages(&self, job_id: JobId) -> bool {
        self.jobs.get(&job_id).is_some_and(|job| {
            !job.is_aged() && !self.pinned.contains(&job_id) && !self.holds.contains(&job_id)
        })
    }

    /// Every job of the cycle is aged once this pass commits.
    fn cycle_fully_aged(&self, cycle_id: CycleId, eligible: &BTreeSet<CycleId>) -> bool {
        let Some(cycle) = self.cycles.get(cycle_id) else {
            return false;
        };
        let in_window = eligible.contains(&cycle_id);
        cycle.jobs.iter().all(|job_id| {
            let already = self.jobs.get(job_id).is_some_and(|job| job.is_aged());
            already || (in_window && self.job_ages(*job_id))
        })
    }

    fn checkpoint_ages(&self, checkpoint: &Checkpoint, eligible: &BTreeSet<CycleId>) -> bool {
        checkpoint
            .covered
            .iter()
            .all(|cycle_id| self.cycle_fully_aged(cycle_id, eligible))
    }
}
