//! Retention policies, watermark configuration and the copies that own them.
//!
//! A storage policy owns an ordered set of copies. Each copy owns exactly one
//! [`RetentionPolicy`]; cache-tier copies additionally own a
//! [`WatermarkConfig`]. The [`PolicyStore`] hands out immutable snapshots of
//! these definitions so that one aging pass always sees one consistent view.

mod store;

pub use store::{PolicySnapshot, PolicyStore};

use crate::core::{AgingError, CopyId, IndexDbId, PolicyId, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Upper bound on extended rules per copy.
pub const MAX_EXTENDED_RULES: usize = 3;

/// Calendar period used by [`ExtendedRule::Fulls`] to select which full jobs
/// are kept beyond basic retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullFrequency {
    AllFulls,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
}

impl FullFrequency {
    /// Bucket a full job falls into. `None` means every full is its own bucket.
    pub fn period_key(&self, at: DateTime<Utc>) -> Option<(i32, u32)> {
        match self {
            FullFrequency::AllFulls => None,
            FullFrequency::Hourly => Some((at.year(), at.ordinal() * 24 + at.hour())),
            FullFrequency::Daily => Some((at.year(), at.ordinal())),
            FullFrequency::Weekly => {
                let week = at.iso_week();
                Some((week.year(), week.week()))
            }
            FullFrequency::Monthly => Some((at.year(), at.month())),
            FullFrequency::Quarterly => Some((at.year(), (at.month() - 1) / 3)),
            FullFrequency::HalfYearly => Some((at.year(), (at.month() - 1) / 6)),
            FullFrequency::Yearly => Some((at.year(), 0)),
        }
    }
}

/// Longer-lived rule layered over the basic days/cycles retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtendedRule {
    /// Keep cycles whose opening full started within `days`.
    Days { days: u32 },
    /// Keep the `cycles` most recent cycles.
    Cycles { cycles: u32 },
    /// Keep the first full job of every `frequency` period for `days`.
    Fulls { frequency: FullFrequency, days: u32 },
}

impl ExtendedRule {
    fn validate(&self) -> Result<()> {
        let zero = match self {
            ExtendedRule::Days { days } => *days == 0,
            ExtendedRule::Cycles { cycles } => *cycles == 0,
            ExtendedRule::Fulls { days, .. } => *days == 0,
        };
        if zero {
            return Err(AgingError::InvalidPolicy(format!(
                "extended rule {:?} has a zero period",
                self
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// 0 disables the days rule.
    pub retention_days: u32,
    /// -1 means unlimited cycles, governed by days only.
    pub retention_cycles: i32,
    #[serde(default)]
    pub extended: Vec<ExtendedRule>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            retention_cycles: 1,
            extended: Vec::new(),
        }
    }
}

impl RetentionPolicy {
    pub fn new(retention_days: u32, retention_cycles: i32) -> Self {
        Self {
            retention_days,
            retention_cycles,
            extended: Vec::new(),
        }
    }

    pub fn days_only(retention_days: u32) -> Self {
        Self::new(retention_days, -1)
    }

    pub fn cycles_only(retention_cycles: i32) -> Self {
        Self::new(0, retention_cycles)
    }

    pub fn with_extended(mut self, rule: ExtendedRule) -> Self {
        self.extended.push(rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention_cycles < -1 {
            return Err(AgingError::InvalidPolicy(format!(
                "retention_cycles must be >= -1, got {}",
                self.retention_cycles
            )));
        }
        if self.retention_days == 0 && self.retention_cycles < 1 {
            return Err(AgingError::InvalidPolicy(format!(
                "retention_cycles must be >= 1 when retention_days is 0, got {}",
                self.retention_cycles
            )));
        }
        if self.extended.len() > MAX_EXTENDED_RULES {
            return Err(AgingError::InvalidPolicy(format!(
                "at most {} extended rules are allowed, got {}",
                MAX_EXTENDED_RULES,
                self.extended.len()
            )));
        }
        for rule in &self.extended {
            rule.validate()?;
        }
        Ok(())
    }
}

/// High/low capacity thresholds of a cache-tier copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    pub high_watermark_pct: f64,
    pub low_watermark_pct: f64,
    pub capacity_bytes: u64,
}

impl WatermarkConfig {
    pub fn new(high_watermark_pct: f64, low_watermark_pct: f64, capacity_bytes: u64) -> Self {
        Self {
            high_watermark_pct,
            low_watermark_pct,
            capacity_bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (high, low) = (self.high_watermark_pct, self.low_watermark_pct);
        if !high.is_finite() || !low.is_finite() || low < 0.0 || high > 100.0 {
            return Err(AgingError::InvalidPolicy(format!(
                "watermarks must lie within 0..=100, got high={} low={}",
                high, low
            )));
        }
        if low >= high {
            return Err(AgingError::InvalidPolicy(format!(
                "low watermark {} must be below high watermark {}",
                low, high
            )));
        }
        if self.capacity_bytes == 0 {
            return Err(AgingError::InvalidPolicy(
                "cache capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes that must be freed to bring `usage_pct` down to the low watermark.
    pub fn bytes_above_low(&self, usage_pct: f64) -> u64 {
        let excess_pct = (usage_pct - self.low_watermark_pct).max(0.0);
        (excess_pct * self.capacity_bytes as f64 / 100.0).ceil() as u64
    }
}

/// One destination of a storage policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCopy {
    pub copy_id: CopyId,
    pub name: String,
    /// 0 is the primary copy.
    pub precedence: u32,
    pub index_db: IndexDbId,
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub cache: Option<WatermarkConfig>,
}

impl StorageCopy {
    pub fn new(copy_id: u64, name: &str, precedence: u32, retention: RetentionPolicy) -> Self {
        Self {
            copy_id: CopyId(copy_id),
            name: name.to_string(),
            precedence,
            index_db: IndexDbId(1),
            retention,
            cache: None,
        }
    }

    pub fn with_index_db(mut self, index_db: u64) -> Self {
        self.index_db = IndexDbId(index_db);
        self
    }

    pub fn cache_tier(mut self, watermark: WatermarkConfig) -> Self {
        self.cache = Some(watermark);
        self
    }

    pub fn is_cache_tier(&self) -> bool {
        self.cache.is_some()
    }

    pub fn is_primary(&self) -> bool {
        self.precedence == 0
    }

    pub fn validate(&self) -> Result<()> {
        self.retention.validate().map_err(|err| match err {
            AgingError::InvalidPolicy(msg) => {
                AgingError::InvalidPolicy(format!("{}: {}", self.copy_id, msg))
            }
            other => other,
        })?;
        if let Some(watermark) = &self.cache {
            watermark.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub policy_id: PolicyId,
    pub name: String,
    pub copies: Vec<StorageCopy>,
}

impl StoragePolicy {
    pub fn new(policy_id: u64, name: &str) -> Self {
        Self {
            policy_id: PolicyId(policy_id),
            name: name.to_string(),
            copies: Vec::new(),
        }
    }

    pub fn with_copy(mut self, copy: StorageCopy) -> Self {
        self.copies.push(copy);
        self
    }

    pub fn copy(&self, copy_id: CopyId) -> Result<&StorageCopy> {
        self.copies
            .iter()
            .find(|copy| copy.copy_id == copy_id)
            .ok_or(AgingError::CopyNotFound(copy_id))
    }

    /// Copies from the primary outward.
    pub fn copies_by_precedence(&self) -> Vec<&StorageCopy> {
        let mut copies: Vec<&StorageCopy> = self.copies.iter().collect();
        copies.sort_by_key(|copy| copy.precedence);
        copies
    }

    pub fn validate(&self) -> Result<()> {
        if self.copies.is_empty() {
            return Err(AgingError::InvalidPolicy(format!(
                "{} has no copies",
                self.policy_id
            )));
        }

        let mut ids = HashSet::new();
        let mut precedences = HashSet::new();
        for copy in &self.copies {
            if !ids.insert(copy.copy_id) {
                return Err(AgingError::InvalidPolicy(format!(
                    "{} appears twice in {}",
                    copy.copy_id, self.policy_id
                )));
            }
            if !precedences.insert(copy.precedence) {
                return Err(AgingError::InvalidPolicy(format!(
                    "precedence {} is used twice in {}",
                    copy.precedence, self.policy_id
                )));
            }
            copy.validate()?;
        }

        if !precedences.contains(&0) {
            return Err(AgingError::InvalidPolicy(format!(
                "{} has no primary copy",
                self.policy_id
            )));
        }
        Ok(())
    }
}
