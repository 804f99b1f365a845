//! Idempotent job submission.

use tracing::debug;

use ledgersync_core::DomainError;

use crate::job::{Job, NewJob};
use crate::store::{JobStore, JobStoreError};

/// Outcome of an enqueue call.
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// A new row was created.
    Created(Job),
    /// The idempotency key was already taken; this is the original row,
    /// unchanged. The duplicate submission's payload is discarded.
    Duplicate(Job),
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Enqueued::Created(job) | Enqueued::Duplicate(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Enqueued::Created(job) | Enqueued::Duplicate(job) => job,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Enqueued::Duplicate(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Submit a job, deduplicating on `idempotency_key`.
///
/// A key collision is not an error: the existing row is fetched and returned
/// as [`Enqueued::Duplicate`]. Exactly one row ever exists per key.
pub async fn enqueue<S: JobStore>(store: &S, new_job: NewJob) -> Result<Enqueued, EnqueueError> {
    new_job.validate()?;
    let key = new_job.idempotency_key.clone();

    match store.insert(new_job).await {
        Ok(job) => {
            debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
            Ok(Enqueued::Created(job))
        }
        Err(JobStoreError::DuplicateKey(_)) => {
            let existing = store.find_by_idempotency_key(&key).await?.ok_or_else(|| {
                // Insert collided but the row is gone: deleted between the
                // two statements. Surface as a storage anomaly.
                JobStoreError::Storage(format!("idempotency key '{key}' collided but row vanished"))
            })?;
            debug!(job_id = %existing.id, idempotency_key = %key, "duplicate submission resolved to existing job");
            Ok(Enqueued::Duplicate(existing))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobStore;

    #[tokio::test]
    async fn duplicate_submission_returns_original_row() {
        let store = InMemoryJobStore::new();

        let first = enqueue(
            &store,
            NewJob::new("k1", "invoice.push", serde_json::json!({}), serde_json::json!({"v": "A"})),
        )
        .await
        .unwrap();
        assert!(!first.is_duplicate());

        let second = enqueue(
            &store,
            NewJob::new("k1", "invoice.push", serde_json::json!({}), serde_json::json!({"v": "B"})),
        )
        .await
        .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.job().id, first.job().id);
        // Original payload untouched.
        assert_eq!(second.job().payload, serde_json::json!({"v": "A"}));

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.values().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_before_insert() {
        let store = InMemoryJobStore::new();
        let err = enqueue(
            &store,
            NewJob::new("", "invoice.push", serde_json::json!({}), serde_json::json!({})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnqueueError::Invalid(_)));
        assert!(store.count_by_status().await.unwrap().is_empty());
    }
}
