//! Durable task queue for syncing payment events into the accounting ledger.
//!
//! Jobs are rows in a shared store; the only synchronization primitive is a
//! predicated single-row write ([`store::JobStore::conditional_update`]), so
//! any number of worker processes can share one queue without a lock service.
//!
//! - [`enqueue`]: idempotent submission keyed on `idempotency_key`
//! - [`worker`]: claim/throttle/execute/settle loop with crash recovery
//! - [`policy`]: fixed-schedule backoff and dead-letter disposition
//! - [`rate_limit`]: token-bucket throttle toward the downstream system
//! - [`group`]: completion tracking for jobs sharing an originating event
//! - [`admin`]: operator inspection and dead-letter requeue

pub mod admin;
pub mod enqueue;
pub mod executor;
pub mod group;
pub mod job;
pub mod memory;
pub mod policy;
pub mod rate_limit;
pub mod store;
pub mod worker;

pub use admin::{Admin, AdminError};
pub use enqueue::{Enqueued, EnqueueError, enqueue};
pub use executor::{CredentialProvider, Execution, GroupNotifier, OperationExecutor, StatusClass, TransportError};
pub use group::GroupTracker;
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, JobUpdate, NewJob};
pub use memory::InMemoryJobStore;
pub use policy::{BackoffSchedule, DEFAULT_BACKOFF_SECS, Disposition, dispose_retryable};
pub use rate_limit::RateLimiter;
pub use store::{JobStore, JobStoreError, STUCK_JOB_ERROR};
pub use worker::{Tick, Worker, WorkerConfig, WorkerHandle, WorkerStats, WorkerStatsSnapshot};
