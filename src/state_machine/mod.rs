mod job;
mod state;

pub use job::{
    AttemptRecord, JobId, JobOptions, JobRecord, JobStatus, Priority, RetryConfig, RunReport,
    snapshot_key,
};
pub use state::{AttemptOutcome, RetryController, Transition};
