use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParamError;
use crate::params::Params;

/// Longest accepted start delay, one hundred years.
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a job. Transitions only move forward; `Completed` and
/// `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn stage(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Whether a record in this status may be rewritten with `next`.
    pub fn can_become(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Scheduling category. Compared by rank: `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank as persisted; larger runs first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            2 => Some(Priority::High),
            1 => Some(Priority::Normal),
            0 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn is_highest(&self) -> bool {
        *self == Priority::High
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        })
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first one.
    pub attempts: u32,
    /// Seconds to wait between attempts.
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_secs: 5,
        }
    }
}

impl RetryConfig {
    /// Attempts actually allowed; a job always gets at least one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Submission options shared by the in-process and detached entry points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Seconds to wait before the first attempt.
    pub delay_secs: u64,
    pub priority: Priority,
    pub retry: RetryConfig,
}

impl JobOptions {
    /// Reject options that cannot be scheduled.
    pub fn check(&self) -> Result<(), ParamError> {
        if self.delay_secs > MAX_DELAY_SECS {
            return Err(ParamError::DelayOutOfRange(self.delay_secs));
        }
        Ok(())
    }
}

/// The durable record kept for every submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub handler: String,
    pub method: String,
    pub params: Params,
    pub status: JobStatus,
    pub priority: Priority,
    pub retry: RetryConfig,
    pub current_attempt: u32,
    pub delay_until: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// New `pending` record. A delay beyond [`MAX_DELAY_SECS`] is clamped;
    /// callers are expected to have run [`JobOptions::check`] first.
    pub fn new(
        handler: impl Into<String>,
        method: impl Into<String>,
        params: Params,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let delay_until = (options.delay_secs > 0).then(|| {
            i64::try_from(options.delay_secs.min(MAX_DELAY_SECS))
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        Self {
            id: JobId::new(),
            handler: handler.into(),
            method: method.into(),
            params,
            status: JobStatus::Pending,
            priority: options.priority,
            retry: options.retry,
            current_attempt: 0,
            delay_until,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key of the ephemeral status snapshot for this job's handler/method pair.
    pub fn snapshot_key(&self) -> String {
        snapshot_key(&self.handler, &self.method)
    }

    /// Time left before the deferred start, if any.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.delay_until
            .and_then(|until| (until - now).to_std().ok())
            .filter(|d| !d.is_zero())
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

pub fn snapshot_key(handler: &str, method: &str) -> String {
    format!("{handler}_{method}")
}

/// One invocation attempt as observed by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Summary produced at the end of a synchronous run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub job_id: JobId,
    pub handler: String,
    pub method: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: Vec<AttemptRecord>,
    pub max_attempts: u32,
    pub priority_deferrals: u32,
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunReport {
    pub fn from_job(
        job: &JobRecord,
        attempts: Vec<AttemptRecord>,
        priority_deferrals: u32,
        output: Option<serde_json::Value>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id,
            handler: job.handler.clone(),
            method: job.method.clone(),
            status: job.status,
            priority: job.priority,
            attempts,
            max_attempts: job.retry.max_attempts(),
            priority_deferrals,
            output,
            started_at,
            completed_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }

    /// Number of retries that followed a failed attempt.
    pub fn retries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }
}
