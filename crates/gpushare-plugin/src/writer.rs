//! Persists device bindings into workload metadata.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::device::DeviceIndex;
use crate::error::StoreError;
use crate::store::{bounded, WorkloadStore};
use crate::workload::{Workload, WorkloadId};

/// Re-fetch-and-retry rounds allowed after a version conflict
pub const MAX_CONFLICT_RETRIES: usize = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workload {0} was bound by another writer")]
    AlreadyBound(WorkloadId),
}

pub struct AssignmentWriter {
    store: Arc<dyn WorkloadStore>,
    timeout: Duration,
}

impl AssignmentWriter {
    pub fn new(store: Arc<dyn WorkloadStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Writes the binding with a conditional update on the workload's
    /// captured version.
    ///
    /// On a conflict the workload is re-fetched and the same binding is
    /// reapplied, at most [`MAX_CONFLICT_RETRIES`] times. If the fresh copy is
    /// already bound, the commit fails instead of overwriting it.
    pub async fn commit(
        &self,
        workload: &Workload,
        indices: &[DeviceIndex],
    ) -> Result<Workload, CommitError> {
        let assign_time = Utc::now();
        let mut current = workload.clone();
        let mut retries = 0;

        loop {
            let desired = current.with_assignment(indices, assign_time);
            match bounded(self.timeout, self.store.update(&desired)).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() && retries < MAX_CONFLICT_RETRIES => {
                    retries += 1;
                    info!(
                        workload = %workload.id,
                        retry = retries,
                        "Version conflict while committing binding, re-fetching"
                    );

                    current = bounded(self.timeout, self.store.get(&workload.id)).await?;
                    if current.assignment().assigned {
                        return Err(CommitError::AlreadyBound(workload.id.clone()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
