use std::time::Duration;

use super::job::{JobRecord, JobStatus};

/// Result of one invocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

/// What the runner must do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Wait `delay`, then run attempt `next_attempt`.
    Retry {
        next_attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// The job reached a final status and must not run again.
    Complete(JobStatus),
}

/// Drives a [`JobRecord`] through `Running → {Completed | Failed}` with a hard
/// ceiling of `retry.attempts` attempts.
pub struct RetryController;

impl RetryController {
    /// Start the next attempt. Returns its 1-based number, or `None` when the
    /// job is not running or has no attempts left.
    pub fn begin_attempt(job: &mut JobRecord) -> Option<u32> {
        if job.status != JobStatus::Running || job.current_attempt >= job.retry.max_attempts() {
            return None;
        }
        job.current_attempt += 1;
        job.updated_at = chrono::Utc::now();
        Some(job.current_attempt)
    }

    /// Apply the outcome of the current attempt to the job.
    ///
    /// - Success completes the job.
    /// - Failure records the error and retries while attempts remain,
    ///   otherwise fails the job.
    /// - A job already in a final status is left untouched.
    pub fn next(job: &mut JobRecord, outcome: AttemptOutcome) -> Transition {
        if job.status.is_terminal() {
            return Transition::Complete(job.status);
        }

        match outcome {
            AttemptOutcome::Success => {
                job.advance(JobStatus::Completed);
                Transition::Complete(job.status)
            }
            AttemptOutcome::Failure(reason) => {
                job.error = Some(reason.clone());
                job.updated_at = chrono::Utc::now();
                if job.current_attempt < job.retry.max_attempts() {
                    Transition::Retry {
                        next_attempt: job.current_attempt + 1,
                        delay: job.retry.delay(),
                        reason,
                    }
                } else {
                    job.advance(JobStatus::Failed);
                    Transition::Complete(job.status)
                }
            }
        }
    }
}
