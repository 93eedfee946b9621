use chrono::{DateTime, Duration, TimeZone, Utc};
use dataaging::{
    AgingDecision, BackupType, Checkpoint, CheckpointId, CheckpointTracker, CycleRange,
    ExtendedRule, FullFrequency, IndexDbId, Job, JobState, RetentionPolicy, StorageCopy,
    assign_cycles, evaluate,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// (opens a cycle, hours after the previous job)
fn stream_strategy() -> impl Strategy<Value = Vec<Job>> {
    prop::collection::vec((any::<bool>(), 1i64..48), 1..40).prop_map(|steps| {
        let mut at = base();
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (full, gap))| {
                at += Duration::hours(gap);
                let backup_type = if i == 0 || full {
                    BackupType::Full
                } else {
                    BackupType::Incremental
                };
                Job::new(i as u64 + 1, backup_type, at).with_size(100)
            })
            .collect()
    })
}

fn retention_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (0u32..10, 1i32..6, any::<bool>()).prop_map(|(days, cycles, weekly)| {
        let retention = RetentionPolicy::new(days, cycles);
        if weekly {
            retention.with_extended(ExtendedRule::Fulls {
                frequency: FullFrequency::Weekly,
                days: 30,
            })
        } else {
            retention
        }
    })
}

/// Checkpoints whose coverage grows from cycle 1 to each sorted endpoint.
fn checkpoints_for(jobs: &[Job], endpoints: &[u64]) -> Vec<Checkpoint> {
    let cycle_count = assign_cycles(jobs).map(|map| map.len() as u64).unwrap_or(0);
    if cycle_count == 0 {
        return Vec::new();
    }
    let mut endpoints: Vec<u64> = endpoints.iter().map(|e| (*e).clamp(1, cycle_count)).collect();
    endpoints.sort_unstable();

    let mut tracker = CheckpointTracker::new(IndexDbId(1));
    for (i, last) in endpoints.into_iter().enumerate() {
        tracker
            .record_checkpoint(CheckpointId(i as u64 + 1), CycleRange::new(1, last).unwrap())
            .unwrap();
    }
    tracker.iter().cloned().collect()
}

fn apply(jobs: &[Job], checkpoints: &[Checkpoint], decision: &AgingDecision) -> (Vec<Job>, Vec<Checkpoint>) {
    let jobs = jobs
        .iter()
        .cloned()
        .map(|job| {
            if decision.age_jobs.contains(&job.job_id) {
                job.with_state(JobState::Aged)
            } else {
                job
            }
        })
        .collect();
    let checkpoints = checkpoints
        .iter()
        .cloned()
        .map(|mut cp| {
            cp.aged |= decision.age_checkpoints.contains(&cp.checkpoint_id);
            cp
        })
        .collect();
    (jobs, checkpoints)
}

proptest! {
    #[test]
    fn prop_decision_partitions_live_jobs(
        jobs in stream_strategy(),
        retention in retention_strategy(),
        endpoints in prop::collection::vec(1u64..20, 0..4),
        later in 0i64..200,
    ) {
        let checkpoints = checkpoints_for(&jobs, &endpoints);
        let now = jobs.last().unwrap().start_time + Duration::hours(later);
        let copy = StorageCopy::new(1, "primary", 0, retention.clone());

        let decision = evaluate(&copy, &retention, &jobs, &checkpoints, now).unwrap();

        prop_assert!(decision.age_jobs.is_disjoint(&decision.retained_jobs));
        let live: BTreeSet<_> = jobs.iter().map(|job| job.job_id).collect();
        let seen: BTreeSet<_> = decision.age_jobs.union(&decision.retained_jobs).copied().collect();
        prop_assert_eq!(seen, live);

        // The open cycle is never aged.
        let cycles = assign_cycles(&jobs).unwrap();
        let open = cycles.open_cycle().unwrap();
        for job_id in &open.jobs {
            prop_assert!(!decision.age_jobs.contains(job_id));
        }

        // A checkpoint ages only with every cycle it covers.
        for cp in checkpoints.iter().filter(|cp| decision.age_checkpoints.contains(&cp.checkpoint_id)) {
            for cycle_id in cp.covered.iter() {
                let cycle = cycles.get(cycle_id).unwrap();
                for job_id in &cycle.jobs {
                    prop_assert!(decision.age_jobs.contains(job_id));
                }
            }
        }
    }

    #[test]
    fn prop_evaluation_is_idempotent(
        jobs in stream_strategy(),
        retention in retention_strategy(),
        endpoints in prop::collection::vec(1u64..20, 0..4),
        later in 0i64..200,
    ) {
        let checkpoints = checkpoints_for(&jobs, &endpoints);
        let now = jobs.last().unwrap().start_time + Duration::hours(later);
        let copy = StorageCopy::new(1, "primary", 0, retention.clone());

        let first = evaluate(&copy, &retention, &jobs, &checkpoints, now).unwrap();
        prop_assert_eq!(&first, &evaluate(&copy, &retention, &jobs, &checkpoints, now).unwrap());

        // After committing, the same evaluation has nothing left to age.
        let (jobs, checkpoints) = apply(&jobs, &checkpoints, &first);
        let second = evaluate(&copy, &retention, &jobs, &checkpoints, now).unwrap();
        prop_assert!(second.age_jobs.is_empty());
        prop_assert!(second.age_checkpoints.is_empty());
        for job in jobs.iter().filter(|job| job.is_aged()) {
            prop_assert!(!second.retained_jobs.contains(&job.job_id));
        }
    }

    #[test]
    fn prop_cycle_ids_survive_stream_growth(jobs in stream_strategy(), cut in 0usize..40) {
        let cut = cut.min(jobs.len());
        let prefix = assign_cycles(&jobs[..cut]).unwrap();
        let full = assign_cycles(&jobs).unwrap();
        for (job_id, cycle_id) in prefix.assignments() {
            prop_assert_eq!(full.cycle_of(*job_id), Some(*cycle_id));
        }
        prop_assert_eq!(prefix.extend(&jobs).unwrap(), full);
    }

    #[test]
    fn prop_aged_is_terminal(next in prop_oneof![
        Just(JobState::Active),
        Just(JobState::Retained),
        Just(JobState::Aged),
    ]) {
        let result = JobState::Aged.transition(dataaging::JobId(1), next);
        prop_assert_eq!(result.is_ok(), next == JobState::Aged);
    }
}
