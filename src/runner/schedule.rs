use super::{AgingRunner, CancelToken, PassStatus};
use crate::core::PolicyId;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Level, event, info_span};

/// Run a pass for every policy in `policy_ids` each `interval`, until
/// `shutdown` is cancelled. The first tick fires immediately.
///
/// The same token is handed to the passes, so a shutdown during a tick stops
/// them at their next copy boundary.
pub fn spawn_schedule(
    runner: Arc<AgingRunner>,
    policy_ids: Vec<PolicyId>,
    interval: Duration,
    shutdown: CancelToken,
) -> JoinHandle<()> {
    let span = info_span!("aging.schedule", policies = policy_ids.len());
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let results = runner.run_policies(&policy_ids, Utc::now(), &shutdown).await;
                for (policy_id, result) in results {
                    match result {
                        Ok(report) if report.status == PassStatus::Failed => event!(
                            Level::ERROR,
                            policy_id = %policy_id,
                            pass_id = %report.pass_id,
                            "aging pass finished with failed copies"
                        ),
                        Ok(report) => event!(
                            Level::INFO,
                            policy_id = %policy_id,
                            pass_id = %report.pass_id,
                            status = %report.status,
                            aged_jobs = report.aged_job_count(),
                            "aging pass finished"
                        ),
                        Err(err) => event!(
                            Level::WARN,
                            policy_id = %policy_id,
                            error = %err,
                            "aging pass did not run"
                        ),
                    }
                }
            }

            event!(Level::INFO, "aging schedule stopped");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::{CopyId, Job, JobState};
    use crate::policy::{PolicyStore, RetentionPolicy, StorageCopy, StoragePolicy};
    use crate::storage::{AgingCatalog, InMemoryCatalog};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_schedule_runs_until_shutdown() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let start = Utc::now() - ChronoDuration::days(3);
        for day in 0..3u64 {
            catalog
                .record_job(CopyId(1), Job::full(day + 1, start + ChronoDuration::days(day as i64)))
                .await
                .unwrap();
        }
        let store = Arc::new(PolicyStore::new());
        store
            .define(
                StoragePolicy::new(1, "daily")
                    .with_copy(StorageCopy::new(1, "primary", 0, RetentionPolicy::cycles_only(1))),
            )
            .unwrap();

        let runner = Arc::new(AgingRunner::with_backend(store, catalog.clone(), EngineConfig::default()));
        let shutdown = CancelToken::new();
        let handle = spawn_schedule(
            runner,
            vec![PolicyId(1)],
            Duration::from_millis(20),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let jobs = catalog.load_jobs(CopyId(1)).await.unwrap();
        assert_eq!(jobs[0].state, JobState::Aged);
        assert_eq!(jobs[1].state, JobState::Aged);
        assert_eq!(jobs[2].state, JobState::Retained);
        assert!(catalog.commit_count(CopyId(1)).unwrap() >= 2);
    }
}
