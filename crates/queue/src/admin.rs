//! Operator surface: queue inspection and dead-letter management.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use ledgersync_core::JobId;

use crate::job::{Job, JobStatus};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Only dead-lettered jobs may be retried by hand; everything else is
    /// owned by the worker loop.
    #[error("job {id} is {status}, not dead")]
    NotDead { id: JobId, status: JobStatus },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Operator handle over a job store.
pub struct Admin<S> {
    store: Arc<S>,
}

impl<S: JobStore> Admin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Queue depth per status.
    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, u64>, AdminError> {
        Ok(self.store.count_by_status().await?)
    }

    pub async fn inspect(&self, id: JobId) -> Result<Job, AdminError> {
        self.store.find(id).await?.ok_or(AdminError::NotFound(id))
    }

    /// Dead-lettered jobs with their diagnostics, most recent first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, AdminError> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    /// Return one dead-lettered job to `pending` with a fresh attempt budget.
    ///
    /// The reset goes through the same conditional write as the worker's
    /// transitions, so a concurrent retry of the same job applies once.
    pub async fn retry_dead_letter(&self, id: JobId) -> Result<Job, AdminError> {
        let applied = self.store.reset_dead(id).await?;
        if !applied {
            let current = self.store.find(id).await?.ok_or(AdminError::NotFound(id))?;
            return Err(AdminError::NotDead { id, status: current.status });
        }
        info!(job_id = %id, "dead-lettered job requeued");
        self.store.find(id).await?.ok_or(AdminError::NotFound(id))
    }

    /// Requeue every dead-lettered job. Returns the number requeued.
    pub async fn retry_all_dead(&self) -> Result<u64, AdminError> {
        let affected = self.store.reset_all_dead().await?;
        if affected > 0 {
            info!(affected, "all dead-lettered jobs requeued");
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::job::{JobUpdate, NewJob};
    use crate::memory::InMemoryJobStore;

    fn job(key: &str) -> NewJob {
        NewJob::new(key, "invoice.push", serde_json::json!({}), serde_json::json!({}))
    }

    async fn kill(store: &InMemoryJobStore, id: JobId) {
        let now = Utc::now();
        store
            .conditional_update(id, &[JobStatus::Pending], JobUpdate::claim(now))
            .await
            .unwrap();
        store
            .conditional_update(id, &[JobStatus::Processing], JobUpdate::dead("422", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_resets_status_and_attempt_budget() {
        let store = Arc::new(InMemoryJobStore::new());
        let admin = Admin::new(store.clone());
        let inserted = store.insert(job("k1")).await.unwrap();
        kill(&store, inserted.id).await;

        let requeued = admin.retry_dead_letter(inserted.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert!(requeued.last_error.is_none());
        assert!(requeued.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn retry_rejects_jobs_that_are_not_dead() {
        let store = Arc::new(InMemoryJobStore::new());
        let admin = Admin::new(store.clone());
        let inserted = store.insert(job("k1")).await.unwrap();

        let err = admin.retry_dead_letter(inserted.id).await.unwrap_err();
        assert!(matches!(err, AdminError::NotDead { status: JobStatus::Pending, .. }));

        let missing = JobId::new();
        let err = admin.retry_dead_letter(missing).await.unwrap_err();
        assert!(matches!(err, AdminError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn bulk_retry_and_counts() {
        let store = Arc::new(InMemoryJobStore::new());
        let admin = Admin::new(store.clone());

        for key in ["a", "b"] {
            let inserted = store.insert(job(key)).await.unwrap();
            kill(&store, inserted.id).await;
        }
        store.insert(job("c")).await.unwrap();

        let counts = admin.status_counts().await.unwrap();
        assert_eq!(counts[&JobStatus::Dead], 2);
        assert_eq!(counts[&JobStatus::Pending], 1);
        assert_eq!(admin.list_dead_letters(10).await.unwrap().len(), 2);

        assert_eq!(admin.retry_all_dead().await.unwrap(), 2);
        let counts = admin.status_counts().await.unwrap();
        assert_eq!(counts[&JobStatus::Pending], 3);
        assert!(counts.get(&JobStatus::Dead).is_none());
    }
}
