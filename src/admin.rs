//! Read and cancel access to the durable records, for operators.

use std::sync::Arc;

use tracing::info;

use crate::error::BgrunError;
use crate::state_machine::{JobId, JobRecord, JobStatus};
use crate::store::JobStore;

pub const CANCELLED: &str = "cancelled";

pub struct AdminService {
    jobs: Arc<dyn JobStore>,
}

impl AdminService {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Jobs ordered by creation time, newest first.
    pub fn all_jobs(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, BgrunError> {
        Ok(self.jobs.list(limit)?)
    }

    pub fn find(&self, id: JobId) -> Result<JobRecord, BgrunError> {
        self.jobs
            .get(id)?
            .ok_or_else(|| BgrunError::JobNotFound(id.to_string()))
    }

    /// Mark `id` failed unless it already finished. Only jobs that have not
    /// started are actually prevented from running; a running attempt is not
    /// interrupted.
    pub fn cancel(&self, id: JobId) -> Result<bool, BgrunError> {
        let job = self.find(id)?;
        let changed = self.jobs.set_status(id, JobStatus::Failed, Some(CANCELLED))?;
        if changed {
            info!(target: "background_jobs", job_id = %id, previous = %job.status, "job cancelled");
        }
        Ok(changed)
    }
}
