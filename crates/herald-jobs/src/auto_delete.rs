//! Follow-up delete jobs for messages published with an auto-delete delay.

use crate::job::{add_std, Destination, JobRecord, MessageHandle};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Builds the delete job that removes a delivered message after the
/// publish job's `auto_delete_after` delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeletePolicy;

impl AutoDeletePolicy {
    pub fn new() -> Self {
        Self
    }

    /// The delete job for one delivery, due at `delivered_at + delay`.
    ///
    /// Returns `None` when `parent` has no delay configured. The delete job
    /// inherits the parent's owner and attempt budget.
    pub fn follow_up(
        &self,
        parent: &JobRecord,
        destination: &Destination,
        handle: &MessageHandle,
        delivered_at: DateTime<Utc>,
    ) -> Option<JobRecord> {
        let delay = parent.auto_delete_after()?;

        let mut handles = BTreeMap::new();
        handles.insert(destination.clone(), handle.clone());

        match JobRecord::delete(
            Some(parent.id),
            handles,
            add_std(delivered_at, delay),
            parent.max_attempts,
            delivered_at,
        ) {
            Ok(job) => Some(job.with_owner(parent.owner.clone())),
            Err(e) => {
                tracing::error!(job_id = %parent.id, destination = %destination, error = %e, "could not build auto-delete job");
                None
            }
        }
    }
}
