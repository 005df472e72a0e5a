//! Cooperative priority gate.
//!
//! Before its first attempt, a job below the top priority looks for running
//! jobs of strictly higher priority and, if it finds one, yields once for a
//! fixed interval. The check and the sleep are not atomic with respect to
//! other processes: two jobs can both see a clear field and start together.
//! This delays lower-priority work; it does not serialize it.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::StoreError;
use crate::sleeper::Sleeper;
use crate::state_machine::JobRecord;
use crate::store::JobStore;

pub const DEFAULT_PRIORITY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct PriorityGate {
    wait: Duration,
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY_WAIT)
    }
}

impl PriorityGate {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    /// First running job, scanning high to low, that outranks `job`.
    pub fn blocking_job(
        &self,
        job: &JobRecord,
        store: &dyn JobStore,
    ) -> Result<Option<JobRecord>, StoreError> {
        if job.priority.is_highest() {
            return Ok(None);
        }
        Ok(store
            .running()?
            .into_iter()
            .filter(|other| other.id != job.id)
            .find(|other| other.priority > job.priority))
    }

    /// Yield at most once if a higher-priority job is running. Returns the
    /// number of deferrals taken.
    pub async fn wait_for_turn(
        &self,
        job: &JobRecord,
        store: &dyn JobStore,
        sleeper: &dyn Sleeper,
    ) -> Result<u32, StoreError> {
        match self.blocking_job(job, store)? {
            Some(blocker) => {
                info!(
                    target: "background_jobs",
                    job_id = %job.id,
                    priority = %job.priority,
                    blocking_job = %blocker.id,
                    blocking_priority = %blocker.priority,
                    wait_secs = self.wait.as_secs(),
                    "waiting for higher priority job"
                );
                sleeper.sleep(self.wait).await;
                Ok(1)
            }
            None => {
                debug!(job_id = %job.id, priority = %job.priority, "no higher priority job running");
                Ok(0)
            }
        }
    }
}
