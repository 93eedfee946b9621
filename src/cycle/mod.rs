//! Cycle assignment.
//!
//! A cycle is a Full or SyntheticFull job followed by every incremental and
//! differential job up to (not including) the next full. Assignment is a pure
//! function of the ordered job stream; the resulting [`CycleMap`] is immutable
//! and can only be extended, never renumbered.

use crate::core::{AgingError, CycleId, Job, JobId, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub cycle_id: CycleId,
    pub opened_by: JobId,
    pub opened_at: DateTime<Utc>,
    /// Member jobs in stream order, the opening full first.
    pub jobs: Vec<JobId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleMap {
    assignments: BTreeMap<JobId, CycleId>,
    cycles: Vec<Cycle>,
    last_start: Option<DateTime<Utc>>,
}

/// Group `jobs` (ordered by start time) into cycles numbered from 1.
pub fn assign_cycles(jobs: &[Job]) -> Result<CycleMap> {
    CycleMap::default().extend(jobs)
}

impl CycleMap {
    /// Returns a new map that additionally covers `jobs`.
    ///
    /// Jobs that already have a cycle keep it, so the same stream (or a longer
    /// one) can be fed again after a restart.
    pub fn extend(&self, jobs: &[Job]) -> Result<CycleMap> {
        let mut next = self.clone();
        let mut seen = BTreeSet::new();
        for job in jobs {
            if !seen.insert(job.job_id) {
                return Err(AgingError::MalformedJobStream(format!(
                    "{} appears twice in the stream",
                    job.job_id
                )));
            }
            if next.assignments.contains_key(&job.job_id) {
                continue;
            }
            next.push(job)?;
        }
        Ok(next)
    }

    fn push(&mut self, job: &Job) -> Result<()> {
        if let Some(last_start) = self.last_start {
            if job.start_time < last_start {
                return Err(AgingError::MalformedJobStream(format!(
                    "{} starts at {} before the previous job ({})",
                    job.job_id, job.start_time, last_start
                )));
            }
        }

        if job.backup_type.opens_cycle() {
            let cycle_id = self
                .cycles
                .last()
                .map_or(CycleId(1), |last| last.cycle_id.next());
            self.cycles.push(Cycle {
                cycle_id,
                opened_by: job.job_id,
                opened_at: job.start_time,
                jobs: vec![job.job_id],
            });
            self.assignments.insert(job.job_id, cycle_id);
        } else {
            let cycle = self.cycles.last_mut().ok_or_else(|| {
                AgingError::MalformedJobStream(format!(
                    "stream starts with {} job {}; the first job must be a full",
                    job.backup_type, job.job_id
                ))
            })?;
            cycle.jobs.push(job.job_id);
            self.assignments.insert(job.job_id, cycle.cycle_id);
        }

        self.last_start = Some(job.start_time);
        Ok(())
    }

    pub fn cycle_of(&self, job_id: JobId) -> Option<CycleId> {
        self.assignments.get(&job_id).copied()
    }

    pub fn assignments(&self) -> &BTreeMap<JobId, CycleId> {
        &self.assignments
    }

    /// Cycles ordered oldest first.
    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    pub fn get(&self, cycle_id: CycleId) -> Option<&Cycle> {
        // Ids are dense and start at 1.
        let index = usize::try_from(cycle_id.0.checked_sub(1)?).ok()?;
        self.cycles.get(index)
    }

    /// The newest cycle is still open: it has no successor full yet.
    pub fn open_cycle(&self) -> Option<&Cycle> {
        self.cycles.last()
    }

    pub fn is_open(&self, cycle_id: CycleId) -> bool {
        self.open_cycle()
            .is_some_and(|cycle| cycle.cycle_id == cycle_id)
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackupType;
    use chrono::{Duration, TimeZone};

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn stream() -> Vec<Job> {
        vec![
            Job::full(1, at(0)),
            Job::incremental(2, at(1)),
            Job::new(3, BackupType::Differential, at(2)),
            Job::new(4, BackupType::SyntheticFull, at(3)),
            Job::incremental(5, at(4)),
            Job::full(6, at(5)),
        ]
    }

    #[test]
    fn test_assign_cycles() {
        let map = assign_cycles(&stream()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.cycle_of(JobId(1)), Some(CycleId(1)));
        assert_eq!(map.cycle_of(JobId(3)), Some(CycleId(1)));
        assert_eq!(map.cycle_of(JobId(4)), Some(CycleId(2)));
        assert_eq!(map.cycle_of(JobId(5)), Some(CycleId(2)));
        assert_eq!(map.cycle_of(JobId(6)), Some(CycleId(3)));

        let first = map.get(CycleId(1)).unwrap();
        assert_eq!(first.opened_by, JobId(1));
        assert_eq!(first.jobs, vec![JobId(1), JobId(2), JobId(3)]);
        assert!(map.is_open(CycleId(3)));
        assert!(!map.is_open(CycleId(2)));
    }

    #[test]
    fn test_empty_stream() {
        let map = assign_cycles(&[]).unwrap();
        assert!(map.is_empty());
        assert!(map.open_cycle().is_none());
    }

    #[test]
    fn test_first_job_must_open_cycle() {
        let err = assign_cycles(&[Job::incremental(1, at(0))]).unwrap_err();
        assert!(matches!(err, AgingError::MalformedJobStream(_)));
    }

    #[test]
    fn test_out_of_order_stream() {
        let jobs = vec![Job::full(1, at(5)), Job::incremental(2, at(1))];
        assert!(matches!(
            assign_cycles(&jobs),
            Err(AgingError::MalformedJobStream(_))
        ));
    }

    #[test]
    fn test_duplicate_job_id() {
        let jobs = vec![Job::full(1, at(0)), Job::incremental(1, at(1))];
        assert!(matches!(
            assign_cycles(&jobs),
            Err(AgingError::MalformedJobStream(_))
        ));
    }

    #[test]
    fn test_extend_keeps_previous_ids() {
        let jobs = stream();
        let partial = assign_cycles(&jobs[..4]).unwrap();
        let extended = partial.extend(&jobs).unwrap();
        let fresh = assign_cycles(&jobs).unwrap();

        for (job, cycle) in partial.assignments() {
            assert_eq!(extended.cycle_of(*job), Some(*cycle));
        }
        assert_eq!(extended.assignments(), fresh.assignments());
    }

    #[test]
    fn test_extend_joins_open_cycle() {
        let base = assign_cycles(&[Job::full(1, at(0))]).unwrap();
        let extended = base.extend(&[Job::incremental(2, at(1))]).unwrap();
        assert_eq!(extended.cycle_of(JobId(2)), Some(CycleId(1)));
        assert_eq!(extended.len(), 1);
    }
}
