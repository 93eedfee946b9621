#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use dataaging::{
    AgingRunner, CheckpointId, CopyId, CycleRange, EngineConfig, IndexDbId, InMemoryCatalog, Job,
    PolicyStore, RetryPolicy, StoragePolicy,
};
use std::sync::Arc;

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
}

/// `cycles` daily cycles of one full and one incremental. The last cycle was
/// opened one day before [`now`]. Cycle `c` holds full `2c-1` and
/// incremental `2c`, each 100 bytes.
pub fn daily_cycles(cycles: u64) -> Vec<Job> {
    let mut jobs = Vec::new();
    for c in 1..=cycles {
        let opened = now() - Duration::days((cycles - c + 1) as i64);
        jobs.push(
            Job::full(2 * c - 1, opened)
                .ending_at(opened + Duration::hours(1))
                .with_size(100),
        );
        jobs.push(
            Job::incremental(2 * c, opened + Duration::hours(6))
                .ending_at(opened + Duration::hours(7))
                .with_size(100),
        );
    }
    jobs
}

pub async fn record_jobs(catalog: &InMemoryCatalog, copy_id: CopyId, jobs: &[Job], replicated: bool) {
    for job in jobs {
        catalog.record_job(copy_id, job.clone()).await.unwrap();
        if replicated {
            catalog.mark_replicated(copy_id, job.job_id).await;
        }
    }
}

pub async fn record_checkpoint(catalog: &InMemoryCatalog, copy_id: CopyId, id: u64, first: u64, last: u64) {
    catalog
        .record_checkpoint(
            copy_id,
            IndexDbId(1),
            CheckpointId(id),
            CycleRange::new(first, last).unwrap(),
        )
        .await
        .unwrap();
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .propagation_timeout(std::time::Duration::from_millis(500))
        .pass_lock_timeout(std::time::Duration::from_millis(100))
        .commit_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        })
}

pub fn runner(
    policy: StoragePolicy,
    catalog: &Arc<InMemoryCatalog>,
    config: EngineConfig,
) -> AgingRunner {
    let store = Arc::new(PolicyStore::new());
    store.define(policy).unwrap();
    AgingRunner::with_backend(store, catalog.clone(), config)
}
