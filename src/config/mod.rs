use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry behaviour for catalog commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Attempt once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

/// Runtime settings of the aging engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on waiting for propagation answers for one copy.
    pub propagation_timeout_ms: u64,

    /// How long a pass waits for another pass of the same policy to finish.
    pub pass_lock_timeout_ms: u64,

    pub commit_retry: RetryPolicy,

    /// Interval of the scheduling loop.
    pub pass_interval_ms: u64,

    /// Evaluate copies of a policy concurrently.
    pub parallel_evaluation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            propagation_timeout_ms: 5_000,
            pass_lock_timeout_ms: 30_000,
            commit_retry: RetryPolicy::default(),
            pass_interval_ms: 15 * 60 * 1_000,
            parallel_evaluation: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn pass_lock_timeout(mut self, timeout: Duration) -> Self {
        self.pass_lock_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn commit_retry(mut self, retry: RetryPolicy) -> Self {
        self.commit_retry = retry;
        self
    }

    pub fn pass_interval(mut self, interval: Duration) -> Self {
        self.pass_interval_ms = duration_ms(interval);
        self
    }

    pub fn parallel_evaluation(mut self, enabled: bool) -> Self {
        self.parallel_evaluation = enabled;
        self
    }

    pub fn propagation_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.propagation_timeout_ms)
    }

    pub fn pass_lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.pass_lock_timeout_ms)
    }

    pub fn pass_interval_duration(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("read {}: {}", path.display(), err))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|err| format!("parse {}: {}", path.display(), err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.propagation_timeout_ms == 0 {
            return Err("propagation_timeout_ms must be > 0".to_string());
        }

        if self.pass_lock_timeout_ms == 0 {
            return Err("pass_lock_timeout_ms must be > 0".to_string());
        }

        if self.commit_retry.max_attempts == 0 {
            return Err("commit_retry.max_attempts must be > 0".to_string());
        }

        if self.commit_retry.initial_backoff_ms > self.commit_retry.max_backoff_ms {
            return Err("commit_retry.initial_backoff_ms cannot exceed max_backoff_ms".to_string());
        }

        if self.pass_interval_ms == 0 {
            return Err("pass_interval_ms must be > 0".to_string());
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
