use super::{AgingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Identifier of one backup job.
    JobId(u64),
    "job"
);
id_type!(
    /// Identifier of a copy (primary, secondary, cache tier) of a storage policy.
    CopyId(u64),
    "copy"
);
id_type!(PolicyId(u64), "policy");
id_type!(
    /// Cycle number on one copy, assigned from 1 in stream order.
    CycleId(u64),
    "cycle"
);
id_type!(CheckpointId(u64), "cp");
id_type!(
    /// Index database whose recovery log the checkpoints bound.
    IndexDbId(u64),
    "idx"
);
id_type!(
    /// Checkpoint generation (CP1, CP2, ...) within one index database.
    Generation(u32),
    "gen"
);

impl CycleId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupType {
    Full,
    SyntheticFull,
    Incremental,
    Differential,
}

impl BackupType {
    /// Full and synthetic-full jobs start a new cycle.
    pub fn opens_cycle(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::SyntheticFull)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "FULL"),
            BackupType::SyntheticFull => write!(f, "SYNTHETIC_FULL"),
            BackupType::Incremental => write!(f, "INCREMENTAL"),
            BackupType::Differential => write!(f, "DIFFERENTIAL"),
        }
    }
}

/// Per-copy lifecycle of a job.
///
/// ```text
/// Active ──evaluate──> Retained
///   │                     │
///   └───────commit────────┴──> Aged (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Active,
    Retained,
    Aged,
}

impl JobState {
    pub fn is_aged(&self) -> bool {
        matches!(self, JobState::Aged)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_aged()
    }

    /// Aged -> Aged is accepted so that re-running a commit is a no-op.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Aged, JobState::Aged) => true,
            (JobState::Aged, _) => false,
            (JobState::Retained, JobState::Active) => false,
            _ => true,
        }
    }

    pub fn transition(self, job: JobId, next: JobState) -> Result<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AgingError::InvalidTransition {
                job,
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Active => write!(f, "ACTIVE"),
            JobState::Retained => write!(f, "RETAINED"),
            JobState::Aged => write!(f, "AGED"),
        }
    }
}

/// One backup execution as seen from a single copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub backup_type: BackupType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
    /// Manual retention pin; the job is kept until this instant.
    #[serde(default)]
    pub retain_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: JobState,
}

impl Job {
    pub fn new(job_id: u64, backup_type: BackupType, start_time: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId(job_id),
            backup_type,
            start_time,
            end_time: start_time,
            size_bytes: 0,
            retain_until: None,
            state: JobState::Active,
        }
    }

    pub fn full(job_id: u64, start_time: DateTime<Utc>) -> Self {
        Self::new(job_id, BackupType::Full, start_time)
    }

    pub fn incremental(job_id: u64, start_time: DateTime<Utc>) -> Self {
        Self::new(job_id, BackupType::Incremental, start_time)
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn retained_until(mut self, until: DateTime<Utc>) -> Self {
        self.retain_until = Some(until);
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn is_aged(&self) -> bool {
        self.state.is_aged()
    }

    pub fn is_pinned_at(&self, now: DateTime<Utc>) -> bool {
        self.retain_until.is_some_and(|until| until > now)
    }
}

/// Inclusive range of cycle ids. Deserialization goes through the same
/// checks as [`CycleRange::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCycleRange")]
pub struct CycleRange {
    pub first: CycleId,
    pub last: CycleId,
}

#[derive(Deserialize)]
struct RawCycleRange {
    first: CycleId,
    last: CycleId,
}

impl TryFrom<RawCycleRange> for CycleRange {
    type Error = AgingError;

    fn try_from(raw: RawCycleRange) -> Result<Self> {
        CycleRange::new(raw.first.0, raw.last.0)
    }
}

impl CycleRange {
    pub fn new(first: u64, last: u64) -> Result<Self> {
        let range = Self {
            first: CycleId(first),
            last: CycleId(last),
        };
        range.validate()?;
        Ok(range)
    }

    /// Cycle ids start at 1 and a range never runs backwards.
    pub fn validate(&self) -> Result<()> {
        if self.first.0 == 0 {
            return Err(AgingError::InvalidInput(format!(
                "cycle range {} starts before cycle 1",
                self
            )));
        }
        if self.first > self.last {
            return Err(AgingError::InvalidInput(format!(
                "cycle range starts at {} after it ends at {}",
                self.first, self.last
            )));
        }
        Ok(())
    }

    pub fn contains(&self, cycle: CycleId) -> bool {
        self.first <= cycle && cycle <= self.last
    }

    pub fn contains_range(&self, other: &CycleRange) -> bool {
        self.first <= other.first && other.last <= self.last
    }

    pub fn iter(&self) -> impl Iterator<Item = CycleId> + use<> {
        (self.first.0..=self.last.0).map(CycleId)
    }
}

impl fmt::Display for CycleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.first.0, self.last.0)
    }
}

/// Immutable snapshot of an index database. `aged` is copy-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub index_db: IndexDbId,
    pub generation: Generation,
    pub covered: CycleRange,
    #[serde(default)]
    pub aged: bool,
}
