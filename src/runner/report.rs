use crate::core::{CopyId, JobId, PolicyId};
use crate::retention::AgingDecision;
use crate::watermark::EvictionTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Why a copy was left for the next pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferReason {
    /// Propagation status did not answer within the configured timeout.
    PropagationTimeout,
    /// Every commit attempt failed.
    CommitFailed(String),
    /// A collaborator failed transiently before anything was decided.
    Transient(String),
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::PropagationTimeout => write!(f, "propagation status timed out"),
            DeferReason::CommitFailed(err) => write!(f, "commit failed: {}", err),
            DeferReason::Transient(err) => write!(f, "transient failure: {}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyOutcome {
    /// Decision committed, nothing held back.
    Committed,
    /// Decision committed, but jobs still waiting for propagation were held.
    CommittedWithDeferrals,
    /// Nothing committed; retried next pass.
    Deferred(DeferReason),
    /// Input or resource error. Needs attention.
    Failed(String),
    /// The pass was cancelled before this copy was committed.
    Cancelled,
    /// Nothing recorded on the copy yet.
    Skipped,
}

impl CopyOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CopyOutcome::Failed(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            CopyOutcome::Deferred(_) | CopyOutcome::CommittedWithDeferrals
        )
    }
}

impl fmt::Display for CopyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyOutcome::Committed => write!(f, "COMMITTED"),
            CopyOutcome::CommittedWithDeferrals => write!(f, "COMMITTED_WITH_DEFERRALS"),
            CopyOutcome::Deferred(reason) => write!(f, "DEFERRED ({})", reason),
            CopyOutcome::Failed(err) => write!(f, "FAILED ({})", err),
            CopyOutcome::Cancelled => write!(f, "CANCELLED"),
            CopyOutcome::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// What happened to one copy during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyReport {
    pub copy_id: CopyId,
    pub precedence: u32,
    pub outcome: CopyOutcome,
    /// True once `decision` is durably in the catalog.
    pub committed: bool,
    pub decision: AgingDecision,
    /// Jobs held back because they are not yet replicated to this copy.
    pub deferred_jobs: BTreeSet<JobId>,
    pub eviction: Option<EvictionTarget>,
}

impl CopyReport {
    pub(crate) fn new(copy_id: CopyId, precedence: u32, outcome: CopyOutcome) -> Self {
        Self {
            copy_id,
            precedence,
            outcome,
            committed: false,
            decision: AgingDecision::default(),
            deferred_jobs: BTreeSet::new(),
            eviction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassStatus {
    Completed,
    CompletedWithDeferrals,
    Failed,
    Cancelled,
}

impl PassStatus {
    /// Failed beats cancelled beats deferred.
    pub(crate) fn from_copies<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a CopyOutcome>,
    {
        let mut status = PassStatus::Completed;
        for outcome in outcomes {
            let next = match outcome {
                CopyOutcome::Failed(_) => PassStatus::Failed,
                CopyOutcome::Cancelled => PassStatus::Cancelled,
                CopyOutcome::Deferred(_) | CopyOutcome::CommittedWithDeferrals => {
                    PassStatus::CompletedWithDeferrals
                }
                CopyOutcome::Committed | CopyOutcome::Skipped => PassStatus::Completed,
            };
            if next.rank() > status.rank() {
                status = next;
            }
        }
        status
    }

    fn rank(&self) -> u8 {
        match self {
            PassStatus::Completed => 0,
            PassStatus::CompletedWithDeferrals => 1,
            PassStatus::Cancelled => 2,
            PassStatus::Failed => 3,
        }
    }
}

impl fmt::Display for PassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassStatus::Completed => write!(f, "COMPLETED"),
            PassStatus::CompletedWithDeferrals => write!(f, "COMPLETED_WITH_DEFERRALS"),
            PassStatus::Failed => write!(f, "FAILED"),
            PassStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Result of one aging pass over every copy of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub policy_id: PolicyId,
    /// Policy version the pass evaluated against.
    pub policy_version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: PassStatus,
    pub per_copy: BTreeMap<CopyId, CopyReport>,
}

impl PassReport {
    /// Decisions of the copies that were evaluated, committed or not.
    pub fn decisions(&self) -> BTreeMap<CopyId, &AgingDecision> {
        self.per_copy
            .iter()
            .map(|(copy_id, report)| (*copy_id, &report.decision))
            .collect()
    }

    pub fn copy(&self, copy_id: CopyId) -> Option<&CopyReport> {
        self.per_copy.get(&copy_id)
    }

    pub fn aged_job_count(&self) -> usize {
        self.per_copy
            .values()
            .filter(|report| report.committed)
            .map(|report| report.decision.age_jobs.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_status_precedence() {
        let outcomes = [
            CopyOutcome::Committed,
            CopyOutcome::Deferred(DeferReason::PropagationTimeout),
            CopyOutcome::Skipped,
        ];
        assert_eq!(
            PassStatus::from_copies(&outcomes),
            PassStatus::CompletedWithDeferrals
        );

        let outcomes = [
            CopyOutcome::Cancelled,
            CopyOutcome::Failed("bad stream".into()),
            CopyOutcome::CommittedWithDeferrals,
        ];
        assert_eq!(PassStatus::from_copies(&outcomes), PassStatus::Failed);

        assert_eq!(PassStatus::from_copies(std::iter::empty()), PassStatus::Completed);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(CopyOutcome::Committed.to_string(), "COMMITTED");
        assert_eq!(
            CopyOutcome::Deferred(DeferReason::PropagationTimeout).to_string(),
            "DEFERRED (propagation status timed out)"
        );
        assert_eq!(PassStatus::CompletedWithDeferrals.to_string(), "COMPLETED_WITH_DEFERRALS");
    }
}
