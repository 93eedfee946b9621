//! Capacity eviction for cache-tier copies.
//!
//! Independent of retention: a cache that crosses its high watermark evicts
//! its oldest data until usage falls back to the low watermark.

use crate::core::{AgingError, CopyId, JobId, Result};
use crate::policy::WatermarkConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictorState {
    #[default]
    Normal,
    Evicting,
}

impl fmt::Display for EvictorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictorState::Normal => write!(f, "NORMAL"),
            EvictorState::Evicting => write!(f, "EVICTING"),
        }
    }
}

/// Data that capacity eviction may remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub job_id: JobId,
    /// Physical write time; eviction goes strictly oldest first.
    pub written_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A cache as the evictor sees it during one check.
#[derive(Debug, Clone, Copy)]
pub struct CacheTier<'a> {
    pub cache_id: CopyId,
    pub watermark: &'a WatermarkConfig,
    pub candidates: &'a [EvictionCandidate],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionTarget {
    pub cache_id: CopyId,
    /// Bytes that must go to reach the low watermark.
    pub target_bytes: u64,
    pub victims: Vec<JobId>,
    /// Sum of the victims' sizes; at least `target_bytes` unless the
    /// candidates ran out first.
    pub freed_bytes: u64,
}

/// Per-cache hysteresis state machine.
#[derive(Debug, Default)]
pub struct WatermarkEvictor {
    states: HashMap<CopyId, EvictorState>,
}

impl WatermarkEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one usage sample for `cache`.
    ///
    /// Returns `Ok(None)` while the cache is (or becomes) `Normal`, and an
    /// eviction target while it is `Evicting`. Fails with `CapacityExhausted`
    /// when the cache must evict but has nothing left to give; the state stays
    /// `Evicting` so the next sample reports it again.
    pub fn check(&mut self, cache: &CacheTier<'_>, usage_pct: f64) -> Result<Option<EvictionTarget>> {
        if !usage_pct.is_finite() || usage_pct < 0.0 {
            return Err(AgingError::InvalidInput(format!(
                "usage of {} must be a non-negative percentage, got {}",
                cache.cache_id, usage_pct
            )));
        }
        let watermark = cache.watermark;
        let state = self.states.entry(cache.cache_id).or_default();

        let next = match *state {
            EvictorState::Normal if usage_pct >= watermark.high_watermark_pct => {
                EvictorState::Evicting
            }
            EvictorState::Evicting if usage_pct <= watermark.low_watermark_pct => {
                EvictorState::Normal
            }
            current => current,
        };
        *state = next;

        if next == EvictorState::Normal {
            return Ok(None);
        }

        let target_bytes = watermark.bytes_above_low(usage_pct);
        let target = select_victims(cache.cache_id, cache.candidates, target_bytes);
        if target.victims.is_empty() {
            return Err(AgingError::CapacityExhausted {
                cache: cache.cache_id,
                usage_pct,
                low_pct: watermark.low_watermark_pct,
            });
        }
        Ok(Some(target))
    }

    pub fn state(&self, cache_id: CopyId) -> EvictorState {
        self.states.get(&cache_id).copied().unwrap_or_default()
    }

    /// Resume from a state recorded by an earlier process.
    pub fn restore(&mut self, cache_id: CopyId, state: EvictorState) {
        self.states.insert(cache_id, state);
    }

    /// Forget a cache, e.g. after its watermark configuration was removed.
    pub fn reset(&mut self, cache_id: CopyId) {
        self.states.remove(&cache_id);
    }
}

fn select_victims(cache_id: CopyId, candidates: &[EvictionCandidate], target_bytes: u64) -> EvictionTarget {
    let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
    ordered.sort_by_key(|candidate| (candidate.written_at, candidate.job_id));

    let mut victims = Vec::new();
    let mut freed_bytes = 0u64;
    for candidate in ordered {
        if freed_bytes >= target_bytes && !victims.is_empty() {
            break;
        }
        victims.push(candidate.job_id);
        freed_bytes = freed_bytes.saturating_add(candidate.size_bytes);
    }

    EvictionTarget {
        cache_id,
        target_bytes,
        victims,
        freed_bytes,
    }
}
