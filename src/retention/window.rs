use crate::core::{CycleId, Job, JobId};
use crate::cycle::Cycle;
use crate::policy::{ExtendedRule, RetentionPolicy};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};

/// Which rule produced the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRule {
    Basic,
    Extended(ExtendedRule),
}

/// The suffix of a copy's cycles that retention keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedWindow {
    /// Oldest retained cycle; `None` when no cycle falls inside the window.
    pub oldest_retained: Option<CycleId>,
    pub rule: WindowRule,
}

impl RetainedWindow {
    /// True when `cycle_id` is strictly older than the window.
    pub fn is_older(&self, cycle_id: CycleId) -> bool {
        match self.oldest_retained {
            Some(oldest) => cycle_id < oldest,
            None => true,
        }
    }
}

fn by_cycles(cycles: &[Cycle], count: u32) -> usize {
    cycles.len().saturating_sub(count as usize)
}

fn by_days(cycles: &[Cycle], days: u32, now: DateTime<Utc>) -> usize {
    let limit = Duration::days(i64::from(days));
    cycles
        .iter()
        .position(|cycle| now - cycle.opened_at <= limit)
        .unwrap_or(cycles.len())
}

/// Compute the retained window over `cycles` (oldest first).
///
/// The basic rules intersect: a cycle must be among the `retention_cycles`
/// newest *and* inside `retention_days`. Each days/cycles extended rule is an
/// alternative window, and the widest window wins.
pub fn retained_window(
    cycles: &[Cycle],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetainedWindow {
    let cycle_start = if policy.retention_cycles >= 0 {
        by_cycles(cycles, policy.retention_cycles as u32)
    } else {
        0
    };
    let day_start = if policy.retention_days > 0 {
        by_days(cycles, policy.retention_days, now)
    } else {
        0
    };

    let mut start = cycle_start.max(day_start);
    let mut rule = WindowRule::Basic;

    for extended in &policy.extended {
        let candidate = match *extended {
            ExtendedRule::Days { days } => by_days(cycles, days, now),
            ExtendedRule::Cycles { cycles: count } => by_cycles(cycles, count),
            ExtendedRule::Fulls { .. } => continue,
        };
        if candidate < start {
            start = candidate;
            rule = WindowRule::Extended(*extended);
        }
    }

    RetainedWindow {
        oldest_retained: cycles.get(start).map(|cycle| cycle.cycle_id),
        rule,
    }
}

/// Jobs kept regardless of the window: manual pins, and fulls selected by
/// frequency-based extended rules.
pub fn pinned_jobs(
    jobs: &[Job],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> BTreeSet<JobId> {
    let mut pinned: BTreeSet<JobId> = jobs
        .iter()
        .filter(|job| job.is_pinned_at(now))
        .map(|job| job.job_id)
        .collect();

    for rule in &policy.extended {
        let ExtendedRule::Fulls { frequency, days } = *rule else {
            continue;
        };
        let limit = Duration::days(i64::from(days));
        let mut seen_periods = HashSet::new();

        for job in jobs.iter().filter(|job| job.backup_type.opens_cycle()) {
            // The first full of each period is the one that gets kept.
            let first_in_period = match frequency.period_key(job.start_time) {
                Some(key) => seen_periods.insert(key),
                None => true,
            };
            if first_in_period && now - job.start_time <= limit {
                pinned.insert(job.job_id);
            }
        }
    }

    pinned
}
