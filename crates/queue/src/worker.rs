//! The worker loop: claim, throttle, execute, settle.
//!
//! Safe to run many instances against one store. Exclusivity comes entirely
//! from the claim compare-and-swap in [`JobStore::conditional_update`]; a
//! worker that loses the race simply moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::{CredentialProvider, Execution, OperationExecutor, StatusClass};
use crate::group::GroupTracker;
use crate::job::{Job, JobStatus, JobUpdate};
use crate::policy::{BackoffSchedule, Disposition, dispose_retryable};
use crate::rate_limit::RateLimiter;
use crate::store::{JobStore, JobStoreError};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used in log output, useful when several workers share a process.
    pub name: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// A `processing` row older than this is presumed orphaned by a crash.
    /// Must comfortably exceed the slowest legitimate execution.
    pub stuck_threshold: Duration,
    pub backoff: BackoffSchedule,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(2),
            stuck_threshold: Duration::from_secs(300),
            backoff: BackoffSchedule::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Counters for observability; all loads/stores are relaxed.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub claimed: AtomicU64,
    pub completed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub lost_races: AtomicU64,
    pub recovered: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lost_races: u64,
    pub recovered: u64,
}

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing eligible.
    Idle,
    /// A job was claimed and settled (or the claim was lost to a peer).
    Worked,
}

/// One worker over a shared store.
pub struct Worker<S> {
    store: Arc<S>,
    executor: Arc<dyn OperationExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
    groups: GroupTracker<S>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<dyn OperationExecutor>,
        credentials: Arc<dyn CredentialProvider>,
        limiter: Arc<RateLimiter>,
        groups: GroupTracker<S>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            credentials,
            limiter,
            groups,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Startup recovery sweep: return orphaned `processing` rows to the
    /// retryable pool. Run once before polling begins.
    pub async fn recover(&self) -> Result<u64, JobStoreError> {
        let repaired = self.store.recover_stuck(self.config.stuck_threshold).await?;
        if repaired > 0 {
            warn!(worker = %self.config.name, repaired, "recovered orphaned jobs");
            self.stats.recovered.fetch_add(repaired, Ordering::Relaxed);
        }
        Ok(repaired)
    }

    /// One poll: claim the best eligible job and drive it to a settlement.
    pub async fn tick(&self) -> Result<Tick, JobStoreError> {
        let Some(candidate) = self.store.select_eligible(1).await?.into_iter().next() else {
            return Ok(Tick::Idle);
        };

        // The claim is the only synchronization point. A false here means a
        // peer got the row between our read and this write.
        let claimed = self
            .store
            .conditional_update(
                candidate.id,
                &[JobStatus::Pending, JobStatus::Failed],
                JobUpdate::claim(Utc::now()),
            )
            .await?;
        if !claimed {
            debug!(worker = %self.config.name, job_id = %candidate.id, "lost claim race");
            self.stats.lost_races.fetch_add(1, Ordering::Relaxed);
            return Ok(Tick::Worked);
        }
        self.stats.claimed.fetch_add(1, Ordering::Relaxed);

        // Re-read after the claim. The candidate snapshot can be stale: a
        // peer may have claimed and failed the row between our select and
        // our claim, so its attempt count undercounts and the disposition
        // would park an exhausted job instead of dead-lettering it.
        let Some(job) = self.store.find(candidate.id).await? else {
            warn!(worker = %self.config.name, job_id = %candidate.id, "claimed job vanished");
            return Ok(Tick::Worked);
        };

        self.limiter.acquire().await;
        let outcome = self.executor.execute(&job.target, &job.payload).await;
        self.settle(&job, outcome).await?;
        Ok(Tick::Worked)
    }

    async fn settle(
        &self,
        job: &Job,
        outcome: Result<Execution, crate::executor::TransportError>,
    ) -> Result<(), JobStoreError> {
        let update = match outcome {
            Ok(Execution { class: StatusClass::Success, body }) => {
                info!(worker = %self.config.name, job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job completed");
                JobUpdate::complete(Utc::now(), body)
            }
            Ok(Execution { class: StatusClass::AuthExpired, .. }) => {
                // Stale cached credential, not a fault of the job itself.
                // Drop the credential and retry like any transient failure.
                warn!(worker = %self.config.name, job_id = %job.id, "credential expired, invalidating");
                self.credentials.invalidate().await;
                self.retry_or_dead(job, "authentication expired", None)
            }
            Ok(Execution { class: StatusClass::Transient, body }) => {
                self.retry_or_dead(job, "transient downstream failure", Some(body))
            }
            Ok(Execution { class: StatusClass::Permanent, body }) => {
                error!(worker = %self.config.name, job_id = %job.id, attempts = job.attempts, "permanent rejection, dead-lettering");
                JobUpdate::dead("permanent downstream rejection", Some(body))
            }
            Err(transport) => self.retry_or_dead(job, transport.to_string(), None),
        };

        let settled = update.status;
        let applied = self
            .store
            .conditional_update(job.id, &[JobStatus::Processing], update)
            .await?;
        if !applied {
            // Only the recovery sweep moves a row out from under a live
            // claim; our settlement is stale, drop it.
            warn!(worker = %self.config.name, job_id = %job.id, "job no longer processing, settlement discarded");
            return Ok(());
        }

        // Counters only reflect settlements that actually landed.
        match settled {
            Some(JobStatus::Completed) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            Some(JobStatus::Failed) => self.stats.retried.fetch_add(1, Ordering::Relaxed),
            Some(JobStatus::Dead) => self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        if settled.is_some_and(|s| s.is_terminal())
            && let Some(group_id) = job.group_id.as_deref()
        {
            self.groups.job_resolved(group_id).await?;
        }
        Ok(())
    }

    /// Retryable failure: consult the policy for backoff or exhaustion.
    fn retry_or_dead(
        &self,
        job: &Job,
        error: impl Into<String>,
        response: Option<serde_json::Value>,
    ) -> JobUpdate {
        let error = error.into();
        match dispose_retryable(job.attempts, job.max_attempts, &self.config.backoff) {
            Disposition::Retry { backoff } => {
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %error,
                    "retryable failure, parking job"
                );
                JobUpdate::retry(next_retry_at, error)
            }
            Disposition::Exhausted => {
                error!(worker = %self.config.name, job_id = %job.id, attempts = job.attempts, error = %error, "attempts exhausted, dead-lettering");
                JobUpdate::dead(format!("attempts exhausted: {error}"), response)
            }
        }
    }

    /// Run until shutdown: one recovery sweep, then poll forever.
    ///
    /// Shutdown is cooperative. The stop signal interrupts the idle sleep but
    /// never a tick in flight, so a claimed job always reaches a settlement
    /// before the task exits.
    pub fn start(self) -> WorkerHandle {
        let stopping = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let stats = self.stats.clone();

        let task = {
            let stopping = stopping.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                info!(worker = %self.config.name, "worker starting");
                if let Err(e) = self.recover().await {
                    error!(worker = %self.config.name, error = %e, "recovery sweep failed");
                }
                while !stopping.load(Ordering::SeqCst) {
                    match self.tick().await {
                        Ok(Tick::Worked) => {}
                        Ok(Tick::Idle) => {
                            tokio::select! {
                                _ = notify.notified() => {}
                                _ = tokio::time::sleep(self.config.poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            error!(worker = %self.config.name, error = %e, "poll failed");
                            tokio::select! {
                                _ = notify.notified() => {}
                                _ = tokio::time::sleep(self.config.poll_interval) => {}
                            }
                        }
                    }
                }
                info!(worker = %self.config.name, "worker stopped");
            })
        };

        WorkerHandle { stopping, notify, stats, task }
    }
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    stopping: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stats: Arc<WorkerStats>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Request stop and wait for the loop to drain its current tick.
    pub async fn shutdown(self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        if let Err(e) = self.task.await {
            error!(error = %e, "worker task panicked");
        }
    }
}
