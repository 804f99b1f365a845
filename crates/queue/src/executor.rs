//! Collaborator seams: the external operation executor, credential provider,
//! and business-entity notifier.
//!
//! The engine never interprets `target` or `payload`; it only acts on the
//! coarse [`StatusClass`] the executor reports.

use async_trait::async_trait;

/// Coarse classification of a downstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx-equivalent.
    Success,
    /// 401-equivalent: cached credential is stale; invalidate and retry.
    AuthExpired,
    /// 429/5xx-equivalent: retryable.
    Transient,
    /// Other 4xx-equivalent: not retryable, dead-letter immediately.
    Permanent,
}

/// A downstream response: classification plus the raw body.
#[derive(Debug, Clone)]
pub struct Execution {
    pub class: StatusClass,
    pub body: serde_json::Value,
}

impl Execution {
    pub fn new(class: StatusClass, body: serde_json::Value) -> Self {
        Self { class, body }
    }
}

/// The call never produced a classifiable response (DNS, timeout, broken
/// connection, serialization failure, ...). Always retryable.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Executes one external operation on behalf of the worker.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &serde_json::Value,
        payload: &serde_json::Value,
    ) -> Result<Execution, TransportError>;
}

/// Narrow interface to credential/token management. The worker only ever
/// drops a cached credential; refresh happens elsewhere on next use.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn invalidate(&self);
}

/// Callback fired when every job in a group has reached a terminal state.
///
/// The zero-pending check is not transactional with the per-job terminal
/// write, so two grouped jobs finishing concurrently can both observe an
/// empty group. Implementations MUST be idempotent and guard against firing
/// when the owning entity already left its in-flight state; they handle and
/// log their own failures.
#[async_trait]
pub trait GroupNotifier: Send + Sync {
    async fn on_group_settled(&self, group_id: &str);
}
