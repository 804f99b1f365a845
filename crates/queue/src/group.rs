//! Group completion tracking.
//!
//! Jobs sharing a `group_id` derive from one originating business event; the
//! owning entity is settled only once every one of them is terminal.

use std::sync::Arc;

use tracing::{debug, info};

use crate::executor::GroupNotifier;
use crate::store::{JobStore, JobStoreError};

/// Detects the moment a group of jobs has fully resolved.
pub struct GroupTracker<S> {
    store: Arc<S>,
    notifier: Arc<dyn GroupNotifier>,
}

impl<S: JobStore> GroupTracker<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn GroupNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Called after any job in `group_id` reaches a terminal state. Fires the
    /// notifier when nothing non-terminal remains; returns whether it fired.
    ///
    /// The count and the terminal write are separate statements, so the
    /// notifier may fire more than once for a group under concurrency; its
    /// contract requires idempotency (see [`GroupNotifier`]).
    pub async fn job_resolved(&self, group_id: &str) -> Result<bool, JobStoreError> {
        let open = self.store.count_non_terminal_in_group(group_id).await?;
        if open > 0 {
            debug!(group_id, open, "group not yet settled");
            return Ok(false);
        }
        info!(group_id, "group settled, notifying owner");
        self.notifier.on_group_settled(group_id).await;
        Ok(true)
    }
}
