//! Job store abstraction.
//!
//! The whole design rests on one primitive: [`JobStore::conditional_update`],
//! a predicated single-row write that reports whether it applied. The claim
//! protocol is a compare-and-swap expressed through it, so no external lock
//! manager is needed even with many worker processes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use ledgersync_core::JobId;

use crate::job::{Job, JobStatus, JobUpdate, NewJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// `idempotency_key` collided with an existing row. Not a failure at the
    /// enqueue layer; the caller fetches the existing row instead.
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable persistence for jobs.
///
/// Implementations must guarantee:
/// - `insert` enforces `idempotency_key` uniqueness atomically;
/// - `conditional_update` is atomic per row: the status predicate and the
///   write are one indivisible operation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`JobStoreError::DuplicateKey`] when the
    /// idempotency key already exists; never creates a second row.
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobStoreError>;

    async fn find(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Jobs claimable right now: `status ∈ {pending, failed}`,
    /// `scheduled_for <= now`, `next_retry_at` null or `<= now`,
    /// ordered by `(priority asc, created_at asc)`.
    async fn select_eligible(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Apply `changes` to the row only if its current status is in
    /// `expected`. Returns whether the update applied. A `false` result is
    /// not an error; it means another actor won the race.
    async fn conditional_update(
        &self,
        id: JobId,
        expected: &[JobStatus],
        changes: JobUpdate,
    ) -> Result<bool, JobStoreError>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, JobStoreError>;

    /// Jobs in `group_id` not yet in a terminal state.
    async fn count_non_terminal_in_group(&self, group_id: &str) -> Result<u64, JobStoreError>;

    /// Dead-lettered jobs, most recently dead-lettered first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Reset one dead job back to `pending` (operator action). Returns
    /// whether the reset applied; `false` means the row is missing or not
    /// dead.
    async fn reset_dead(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.conditional_update(id, &[JobStatus::Dead], JobUpdate::reset())
            .await
    }

    /// Reset every dead job back to `pending` (operator action). Returns the
    /// number of rows affected.
    async fn reset_all_dead(&self) -> Result<u64, JobStoreError>;

    /// Startup recovery sweep: one bulk predicated update resetting
    /// `processing` rows whose `started_at` is older than `stuck_threshold`
    /// to `failed` with a diagnostic error. Fresher rows are untouched.
    async fn recover_stuck(&self, stuck_threshold: Duration) -> Result<u64, JobStoreError>;
}

/// Diagnostic recorded on rows repaired by the recovery sweep.
pub const STUCK_JOB_ERROR: &str = "worker crashed mid-execution; reset by recovery sweep";
