mod common;

use common::{daily_cycles, fast_config, now, record_checkpoint, record_jobs};
use dataaging::storage::CATALOG_FORMAT_VERSION;
use dataaging::{
    AgingCatalog, AgingRunner, CopyId, IndexDbId, InMemoryCatalog, JobState, PassStatus, PolicyId,
    PolicyStore, RetentionPolicy, StorageCopy, StoragePolicy,
};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_pass_survives_save_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");

    let catalog = InMemoryCatalog::new();
    catalog
        .add_policy(StoragePolicy::new(1, "gold").with_copy(StorageCopy::new(
            1,
            "primary",
            0,
            RetentionPolicy::cycles_only(2),
        )))
        .await
        .unwrap();
    record_jobs(&catalog, CopyId(1), &daily_cycles(4), true).await;
    record_checkpoint(&catalog, CopyId(1), 1, 1, 2).await;
    record_checkpoint(&catalog, CopyId(1), 2, 1, 4).await;
    catalog.save(&path).await.unwrap();

    // A fresh process: policies come from the file, not from code.
    let catalog = Arc::new(InMemoryCatalog::open(&path).await.unwrap());
    let runner = AgingRunner::with_backend(Arc::new(PolicyStore::new()), catalog.clone(), fast_config());
    let report = runner.run_pass_at(PolicyId(1), now()).await.unwrap();
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.aged_job_count(), 4);
    catalog.save(&path).await.unwrap();

    let reopened = InMemoryCatalog::open(&path).await.unwrap();
    let state = reopened.snapshot().await;
    assert_eq!(state.version, CATALOG_FORMAT_VERSION);
    assert_eq!(state.policies.len(), 1);

    let jobs = reopened.load_jobs(CopyId(1)).await.unwrap();
    let states: Vec<JobState> = jobs.iter().map(|job| job.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Aged,
            JobState::Aged,
            JobState::Aged,
            JobState::Aged,
            JobState::Retained,
            JobState::Retained,
            JobState::Retained,
            JobState::Retained,
        ]
    );
    let checkpoints = reopened
        .load_checkpoints(CopyId(1), IndexDbId(1))
        .await
        .unwrap();
    assert_eq!(
        checkpoints.iter().map(|cp| cp.aged).collect::<Vec<_>>(),
        vec![true, false]
    );

    // Re-running against the reopened catalog changes nothing further.
    let runner = AgingRunner::with_backend(Arc::new(PolicyStore::new()), Arc::new(reopened), fast_config());
    let report = runner.run_pass_at(PolicyId(1), now()).await.unwrap();
    assert_eq!(report.aged_job_count(), 0);
}

#[tokio::test]
async fn test_open_rejects_invalid_policy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");
    std::fs::write(
        &path,
        r#"{
            "version": 1,
            "policies": [{
                "policy_id": 1,
                "name": "broken",
                "copies": [{
                    "copy_id": 1,
                    "name": "primary",
                    "precedence": 0,
                    "index_db": 1,
                    "retention": { "retention_days": 0, "retention_cycles": -2 }
                }]
            }]
        }"#,
    )
    .unwrap();

    let err = InMemoryCatalog::open(&path).await.unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_open_rejects_inverted_checkpoint_range() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");
    std::fs::write(
        &path,
        r#"{
            "version": 1,
            "copies": {
                "1": {
                    "checkpoints": [{
                        "checkpoint_id": 1,
                        "index_db": 1,
                        "generation": 1,
                        "covered": { "first": 4, "last": 2 }
                    }]
                }
            }
        }"#,
    )
    .unwrap();

    let err = InMemoryCatalog::open(&path).await.unwrap_err();
    assert!(err.to_string().contains("cycle range"), "{}", err);
}
