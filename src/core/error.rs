use super::types::{CheckpointId, CopyId, CycleRange, JobId, JobState, PolicyId};
use thiserror::Error;

/// How the runner treats a failure: fatal for the copy, fatal for the
/// operator, or simply retried on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed job streams, bad coverage, bad policies. Fails the copy.
    Input,
    /// Capacity exhaustion. Surfaced to the operator, never retried silently.
    Resource,
    /// Collaborator timeouts and I/O. The copy is deferred to the next pass.
    Transient,
}

#[derive(Error, Debug)]
pub enum AgingError {
    #[error("Malformed job stream: {0}")]
    MalformedJobStream(String),

    #[error(
        "Checkpoint {checkpoint} covers {proposed} which does not contain the previous generation's {previous}"
    )]
    NonMonotonicCoverage {
        checkpoint: CheckpointId,
        previous: CycleRange,
        proposed: CycleRange,
    },

    #[error("Invalid retention policy: {0}")]
    InvalidPolicy(String),

    #[error("Copy {0} has no recorded cycles")]
    NoRecordedCycles(CopyId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job {job} cannot move from {from} to {to}")]
    InvalidTransition { job: JobId, from: JobState, to: JobState },

    #[error("Cache {cache} exhausted: usage {usage_pct:.1}% above low watermark {low_pct:.1}% with nothing left to evict")]
    CapacityExhausted {
        cache: CopyId,
        usage_pct: f64,
        low_pct: f64,
    },

    #[error("Propagation status for copy {0} timed out")]
    PropagationTimeout(CopyId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Policy {0} not found")]
    PolicyNotFound(PolicyId),

    #[error("Copy {0} not found")]
    CopyNotFound(CopyId),

    #[error("An aging pass for policy {0} is already running")]
    PassInProgress(PolicyId),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl AgingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgingError::CapacityExhausted { .. } => ErrorClass::Resource,
            AgingError::PropagationTimeout(_)
            | AgingError::Persistence(_)
            | AgingError::PassInProgress(_)
            | AgingError::LockError(_) => ErrorClass::Transient,
            _ => ErrorClass::Input,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, AgingError>;

impl<T> From<std::sync::PoisonError<T>> for AgingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for AgingError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            AgingError::MalformedJobStream("x".into()).class(),
            ErrorClass::Input
        );
        assert_eq!(
            AgingError::CapacityExhausted {
                cache: CopyId(3),
                usage_pct: 95.0,
                low_pct: 70.0
            }
            .class(),
            ErrorClass::Resource
        );
        assert!(AgingError::PropagationTimeout(CopyId(2)).is_transient());
        assert!(AgingError::Persistence("disk".into()).is_transient());
        assert!(!AgingError::NoRecordedCycles(CopyId(1)).is_transient());
    }

    #[test]
    fn test_poison_maps_to_lock_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let poisoned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: AgingError = lock.lock().unwrap_err().into();
        assert!(matches!(err, AgingError::LockError(_)));
    }
}
