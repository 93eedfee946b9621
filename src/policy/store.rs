use super::{RetentionPolicy, StorageCopy, StoragePolicy, WatermarkConfig};
use crate::core::{AgingError, CopyId, PolicyId, Result};
use crate::storage::AgingCatalog;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Versioned, immutable view of a storage policy taken at pass start.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    version: u64,
    policy: Arc<StoragePolicy>,
}

impl PolicySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    pub fn policy_id(&self) -> PolicyId {
        self.policy.policy_id
    }
}

/// Owner of every storage policy definition.
///
/// Updates replace the stored `Arc` (copy-on-write), so snapshots handed out
/// earlier keep seeing the definition they started with. A change made while a
/// pass is running therefore only applies to the next pass.
#[derive(Debug, Default)]
pub struct PolicyStore {
    entries: RwLock<HashMap<PolicyId, PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a policy. Returns the new version.
    pub fn define(&self, policy: StoragePolicy) -> Result<u64> {
        policy.validate()?;
        let mut entries = self.entries.write()?;
        let version = entries
            .get(&policy.policy_id)
            .map_or(1, |current| current.version + 1);
        entries.insert(
            policy.policy_id,
            PolicySnapshot {
                version,
                policy: Arc::new(policy),
            },
        );
        Ok(version)
    }

    /// Load a policy from the catalog and install it.
    pub async fn sync_from(&self, catalog: &dyn AgingCatalog, policy_id: PolicyId) -> Result<u64> {
        let policy = catalog.load_policy(policy_id).await?;
        if policy.policy_id != policy_id {
            return Err(AgingError::InvalidInput(format!(
                "catalog returned {} when asked for {}",
                policy.policy_id, policy_id
            )));
        }
        self.define(policy)
    }

    pub fn update_retention(
        &self,
        policy_id: PolicyId,
        copy_id: CopyId,
        retention: RetentionPolicy,
    ) -> Result<u64> {
        retention.validate()?;
        self.modify_copy(policy_id, copy_id, |copy| copy.retention = retention)
    }

    pub fn update_watermark(
        &self,
        policy_id: PolicyId,
        copy_id: CopyId,
        watermark: Option<WatermarkConfig>,
    ) -> Result<u64> {
        if let Some(watermark) = &watermark {
            watermark.validate()?;
        }
        self.modify_copy(policy_id, copy_id, |copy| copy.cache = watermark)
    }

    pub fn snapshot(&self, policy_id: PolicyId) -> Result<PolicySnapshot> {
        self.entries
            .read()?
            .get(&policy_id)
            .cloned()
            .ok_or(AgingError::PolicyNotFound(policy_id))
    }

    pub fn retention(&self, policy_id: PolicyId, copy_id: CopyId) -> Result<RetentionPolicy> {
        let snapshot = self.snapshot(policy_id)?;
        Ok(snapshot.policy().copy(copy_id)?.retention.clone())
    }

    pub fn policy_ids(&self) -> Result<Vec<PolicyId>> {
        let mut ids: Vec<PolicyId> = self.entries.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn modify_copy<F>(&self, policy_id: PolicyId, copy_id: CopyId, change: F) -> Result<u64>
    where
        F: FnOnce(&mut StorageCopy),
    {
        let mut entries = self.entries.write()?;
        let current = entries
            .get(&policy_id)
            .ok_or(AgingError::PolicyNotFound(policy_id))?;

        let mut policy = (*current.policy).clone();
        let copy = policy
            .copies
            .iter_mut()
            .find(|copy| copy.copy_id == copy_id)
            .ok_or(AgingError::CopyNotFound(copy_id))?;
        change(copy);
        policy.validate()?;

        let version = current.version + 1;
        entries.insert(
            policy_id,
            PolicySnapshot {
                version,
                policy: Arc::new(policy),
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExtendedRule;

    fn gold() -> StoragePolicy {
        StoragePolicy::new(1, "gold")
            .with_copy(StorageCopy::new(1, "primary", 0, RetentionPolicy::new(30, 2)))
            .with_copy(StorageCopy::new(2, "dr", 1, RetentionPolicy::new(90, 4)))
    }

    #[test]
    fn test_define_and_snapshot() {
        let store = PolicyStore::new();
        assert_eq!(store.define(gold()).unwrap(), 1);

        let snapshot = store.snapshot(PolicyId(1)).unwrap();
        assert_eq!(snapshot.version(), 1);
        assert_eq!(snapshot.policy().copies.len(), 2);
        assert_eq!(store.policy_ids().unwrap(), vec![PolicyId(1)]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = PolicyStore::new();
        store.define(gold()).unwrap();
        let before = store.snapshot(PolicyId(1)).unwrap();

        let version = store
            .update_retention(
                PolicyId(1),
                CopyId(2),
                RetentionPolicy::new(180, 8).with_extended(ExtendedRule::Cycles { cycles: 12 }),
            )
            .unwrap();
        assert_eq!(version, 2);

        assert_eq!(
            before.policy().copy(CopyId(2)).unwrap().retention,
            RetentionPolicy::new(90, 4)
        );
        assert_eq!(
            store.retention(PolicyId(1), CopyId(2)).unwrap().retention_days,
            180
        );
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let store = PolicyStore::new();
        store.define(gold()).unwrap();

        let err = store
            .update_retention(PolicyId(1), CopyId(1), RetentionPolicy::cycles_only(0))
            .unwrap_err();
        assert!(matches!(err, AgingError::InvalidPolicy(_)));
        assert_eq!(store.snapshot(PolicyId(1)).unwrap().version(), 1);

        let err = store
            .update_watermark(
                PolicyId(1),
                CopyId(9),
                Some(WatermarkConfig::new(90.0, 70.0, 100)),
            )
            .unwrap_err();
        assert!(matches!(err, AgingError::CopyNotFound(CopyId(9))));
    }

    #[test]
    fn test_missing_policy() {
        let store = PolicyStore::new();
        assert!(matches!(
            store.snapshot(PolicyId(7)),
            Err(AgingError::PolicyNotFound(PolicyId(7)))
        ));
    }
}
