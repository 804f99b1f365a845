//! Integration tests against a live Postgres.
//!
//! Set `LEDGERSYNC_TEST_DATABASE_URL` to run; every test is a silent no-op
//! without it. Tests share one database and keep to their own rows via
//! per-test idempotency keys, so they are safe to run concurrently.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use ledgersync_queue::job::{JobStatus, JobUpdate, NewJob};
    use ledgersync_queue::store::{JobStore, JobStoreError, STUCK_JOB_ERROR};

    use crate::postgres::PostgresJobStore;

    async fn store() -> Option<PostgresJobStore> {
        let Ok(url) = std::env::var("LEDGERSYNC_TEST_DATABASE_URL") else {
            eprintln!("LEDGERSYNC_TEST_DATABASE_URL not set; skipping");
            return None;
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        Some(PostgresJobStore::connect(&url).await.expect("connect to test database"))
    }

    fn key(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::now_v7())
    }

    fn job(idempotency_key: String) -> NewJob {
        NewJob::new(
            idempotency_key,
            "invoice.push",
            serde_json::json!({"path": "/invoices", "method": "POST"}),
            serde_json::json!({"amount": 125.50}),
        )
    }

    #[tokio::test]
    async fn insert_enforces_idempotency_key() {
        let Some(store) = store().await else { return };
        let k = key("dup");

        let first = store.insert(job(k.clone())).await.unwrap();
        let err = store.insert(job(k.clone())).await.unwrap_err();
        assert!(matches!(err, JobStoreError::DuplicateKey(ref got) if *got == k));

        let found = store.find_by_idempotency_key(&k).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.payload, serde_json::json!({"amount": 125.50}));
    }

    #[tokio::test]
    async fn conditional_update_round_trips_the_lifecycle() {
        let Some(store) = store().await else { return };
        let inserted = store.insert(job(key("lifecycle"))).await.unwrap();
        let now = Utc::now();

        // Claim applies exactly once.
        assert!(store
            .conditional_update(inserted.id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap());
        assert!(!store
            .conditional_update(inserted.id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap());

        let claimed = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        assert!(store
            .conditional_update(
                inserted.id,
                &[JobStatus::Processing],
                JobUpdate::complete(Utc::now(), serde_json::json!({"remote_id": "INV-1"})),
            )
            .await
            .unwrap());

        let done = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.response, Some(serde_json::json!({"remote_id": "INV-1"})));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn illegal_status_edges_are_refused() {
        let Some(store) = store().await else { return };
        let inserted = store.insert(job(key("edges"))).await.unwrap();
        let now = Utc::now();

        // pending -> completed is not a legal edge, even though the status
        // predicate matches.
        assert!(!store
            .conditional_update(
                inserted.id,
                &[JobStatus::Pending],
                JobUpdate::complete(now, serde_json::json!({})),
            )
            .await
            .unwrap());
        let row = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.response.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_yield_one_winner() {
        let Some(store) = store().await else { return };
        let store = Arc::new(store);
        let inserted = store.insert(job(key("contended"))).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = inserted.id;
            handles.push(tokio::spawn(async move {
                store
                    .conditional_update(
                        id,
                        &[JobStatus::Pending, JobStatus::Failed],
                        JobUpdate::claim(Utc::now()),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.find(inserted.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn retry_gate_controls_eligibility() {
        let Some(store) = store().await else { return };
        let inserted = store.insert(job(key("parked"))).await.unwrap();
        let now = Utc::now();

        store
            .conditional_update(inserted.id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap();
        store
            .conditional_update(
                inserted.id,
                &[JobStatus::Processing],
                JobUpdate::retry(now + chrono::Duration::hours(1), "503"),
            )
            .await
            .unwrap();

        // Parked an hour out: not eligible.
        let eligible = store.select_eligible(100).await.unwrap();
        assert!(!eligible.iter().any(|j| j.id == inserted.id));

        // Window elapsed: eligible again, still failed.
        store
            .conditional_update(
                inserted.id,
                &[JobStatus::Failed],
                JobUpdate::retry(now - chrono::Duration::seconds(1), "503"),
            )
            .await
            .unwrap();
        let eligible = store.select_eligible(100).await.unwrap();
        assert!(eligible.iter().any(|j| j.id == inserted.id));
    }

    #[tokio::test]
    async fn recovery_sweep_repairs_stale_processing_rows() {
        let Some(store) = store().await else { return };
        let inserted = store.insert(job(key("orphan"))).await.unwrap();

        // Claim with a started_at far in the past.
        store
            .conditional_update(
                inserted.id,
                &[JobStatus::Pending],
                JobUpdate::claim(Utc::now() - chrono::Duration::hours(2)),
            )
            .await
            .unwrap();

        let repaired = store.recover_stuck(Duration::from_secs(300)).await.unwrap();
        assert!(repaired >= 1);

        let job = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some(STUCK_JOB_ERROR));
    }

    #[tokio::test]
    async fn dead_letter_listing_and_reset() {
        let Some(store) = store().await else { return };
        let inserted = store.insert(job(key("dead"))).await.unwrap();
        let now = Utc::now();

        store
            .conditional_update(inserted.id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap();
        store
            .conditional_update(
                inserted.id,
                &[JobStatus::Processing],
                JobUpdate::dead("422", Some(serde_json::json!({"status": 422}))),
            )
            .await
            .unwrap();

        let dead = store.list_dead_letters(1000).await.unwrap();
        assert!(dead.iter().any(|j| j.id == inserted.id));

        // Single-row reset through the same conditional write the admin uses.
        assert!(store
            .conditional_update(inserted.id, &[JobStatus::Dead], JobUpdate::reset())
            .await
            .unwrap());
        let reset = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn group_counts_track_terminal_transitions() {
        let Some(store) = store().await else { return };
        let group = key("grp");
        let now = Utc::now();

        let a = store.insert(job(key("ga")).with_group(group.clone())).await.unwrap();
        let _b = store.insert(job(key("gb")).with_group(group.clone())).await.unwrap();

        assert_eq!(store.count_non_terminal_in_group(&group).await.unwrap(), 2);

        store
            .conditional_update(a.id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap();
        store
            .conditional_update(
                a.id,
                &[JobStatus::Processing],
                JobUpdate::complete(now, serde_json::json!({})),
            )
            .await
            .unwrap();

        assert_eq!(store.count_non_terminal_in_group(&group).await.unwrap(), 1);
    }
}
