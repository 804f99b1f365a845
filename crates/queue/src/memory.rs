//! In-memory job store for tests and development.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use ledgersync_core::JobId;

use crate::job::{Job, JobStatus, JobUpdate, NewJob};
use crate::store::{JobStore, JobStoreError, STUCK_JOB_ERROR};

/// In-memory [`JobStore`].
///
/// Linear scans throughout; fine for tests and small dev queues. The
/// `RwLock` write path makes `conditional_update` atomic, matching the
/// single-row-write atomicity a relational store provides.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: rewind time-gate fields to make a row claimable or stuck.
    #[cfg(test)]
    pub(crate) fn with_job_mut(&self, id: JobId, f: impl FnOnce(&mut Job)) {
        let mut jobs = self.write();
        if let Some(job) = jobs.get_mut(&id) {
            f(job);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let mut jobs = self.write();
        if jobs.values().any(|j| j.idempotency_key == new_job.idempotency_key) {
            return Err(JobStoreError::DuplicateKey(new_job.idempotency_key));
        }
        let job = new_job.into_job();
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().values().find(|j| j.idempotency_key == key).cloned())
    }

    async fn select_eligible(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let jobs = self.read();
        let mut eligible: Vec<Job> = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed)
                    && j.scheduled_for <= now
                    && j.next_retry_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected: &[JobStatus],
        changes: JobUpdate,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !expected.contains(&job.status) {
            return Ok(false);
        }
        // Status changes must follow the state machine even when the
        // caller's predicate matches.
        if let Some(next) = changes.status
            && !job.status.can_transition_to(next)
        {
            return Ok(false);
        }
        changes.apply_to(job, Utc::now());
        Ok(true)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, JobStoreError> {
        let mut counts = HashMap::new();
        for job in self.read().values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_non_terminal_in_group(&self, group_id: &str) -> Result<u64, JobStoreError> {
        Ok(self
            .read()
            .values()
            .filter(|j| j.group_id.as_deref() == Some(group_id) && !j.status.is_terminal())
            .count() as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        let mut dead: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn reset_all_dead(&self) -> Result<u64, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.write();
        let mut affected = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Dead {
                JobUpdate::reset().apply_to(job, now);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn recover_stuck(&self, stuck_threshold: Duration) -> Result<u64, JobStoreError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(stuck_threshold)
                .map_err(|e| JobStoreError::Storage(format!("invalid stuck threshold: {e}")))?;
        let mut jobs = self.write();
        let mut affected = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.started_at.is_some_and(|at| at < cutoff)
            {
                JobUpdate::retry(now, STUCK_JOB_ERROR).apply_to(job, now);
                affected += 1;
            }
        }
        Ok(affected)
    }
}
