//! The job model: the unit of durable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgersync_core::{DomainError, JobId};

/// Default cap on claims before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Job execution status.
///
/// Transitions follow a fixed state machine; see [`JobStatus::can_transition_to`].
/// `Completed` and `Dead` are terminal: no further mutation once reached,
/// except the operator-only reset of `Dead` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed.
    Pending,
    /// Claimed by a worker; at most one worker holds this at any instant.
    Processing,
    /// Executed successfully.
    Completed,
    /// Failed retryably; reclaimable once `next_retry_at` passes.
    Failed,
    /// Dead-lettered: attempts exhausted or non-retryable failure.
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }

    /// Legal edges of the job state machine.
    ///
    /// `Dead -> Pending` is the operator reset; everything else is driven by
    /// the worker loop or the recovery sweep.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Failed, Dead)
                | (Dead, Pending)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable job row.
///
/// `target` and `payload` are opaque to the engine; only the executor
/// collaborator interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller-supplied, globally unique; enforces at-most-one-job-per-logical-operation.
    pub idempotency_key: String,
    /// Jobs sharing a group belong to one originating business event.
    pub group_id: Option<String>,
    /// Classification tag, meaningless to the engine.
    pub job_type: String,
    /// Description of the external operation (endpoint/method equivalent).
    pub target: serde_json::Value,
    pub payload: serde_json::Value,
    /// Lower value = served first.
    pub priority: i32,
    pub status: JobStatus,
    /// Count of claims ever made on this job; monotonically non-decreasing.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest time eligible for claiming.
    pub scheduled_for: DateTime<Utc>,
    /// Set after a retryable failure; gates re-eligibility.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Submission request for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub idempotency_key: String,
    pub group_id: Option<String>,
    pub job_type: String,
    pub target: serde_json::Value,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        idempotency_key: impl Into<String>,
        job_type: impl Into<String>,
        target: serde_json::Value,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            group_id: None,
            job_type: job_type.into(),
            target,
            payload,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency_key must not be empty"));
        }
        if self.max_attempts < 1 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Materialize the row for this submission.
    pub fn into_job(self) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            idempotency_key: self.idempotency_key,
            group_id: self.group_id,
            job_type: self.job_type,
            target: self.target,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            next_retry_at: None,
            last_error: None,
            response: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Change set for a conditional update.
///
/// `Option<Option<T>>` fields distinguish "leave untouched" (`None`) from
/// "set to NULL" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// Atomically increment `attempts` by one (claim).
    pub bump_attempts: bool,
    /// Overwrite `attempts` with a fixed value (operator reset).
    pub set_attempts: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub response: Option<Option<serde_json::Value>>,
}

impl JobUpdate {
    /// Claim a job: the atomic `(pending|failed) -> processing` transition.
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            bump_attempts: true,
            started_at: Some(now),
            ..Default::default()
        }
    }

    /// Successful execution.
    pub fn complete(now: DateTime<Utc>, response: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            response: Some(Some(response)),
            next_retry_at: Some(None),
            ..Default::default()
        }
    }

    /// Retryable failure: park the job until the backoff window elapses.
    pub fn retry(next_retry_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            next_retry_at: Some(Some(next_retry_at)),
            last_error: Some(Some(error.into())),
            ..Default::default()
        }
    }

    /// Dead-letter: terminal, no further retries.
    pub fn dead(error: impl Into<String>, response: Option<serde_json::Value>) -> Self {
        Self {
            status: Some(JobStatus::Dead),
            last_error: Some(Some(error.into())),
            response: response.map(Some),
            next_retry_at: Some(None),
            ..Default::default()
        }
    }

    /// Operator reset of a dead-lettered job back into the lifecycle.
    pub fn reset() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            set_attempts: Some(0),
            last_error: Some(None),
            next_retry_at: Some(None),
            ..Default::default()
        }
    }

    /// Apply the change set to an in-memory row.
    pub fn apply_to(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if self.bump_attempts {
            job.attempts += 1;
        }
        if let Some(attempts) = self.set_attempts {
            job.attempts = attempts;
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(ref next_retry_at) = self.next_retry_at {
            job.next_retry_at = *next_retry_at;
        }
        if let Some(ref last_error) = self.last_error {
            job.last_error = last_error.clone();
        }
        if let Some(ref response) = self.response {
            job.response = response.clone();
        }
        job.updated_at = now;
    }
}
