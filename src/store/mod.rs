//! Job status persistence.
//!
//! Two independent sinks receive every status transition:
//!
//! - a durable [`JobStore`], the authoritative record of each job, and
//! - an ephemeral [`StatusCache`] holding the latest snapshot per
//!   `{handler}_{method}` pair with a fixed time-to-live.
//!
//! The writes are not transactional. The cache write is best-effort and may
//! lag or miss a durable write; readers that need the truth use the durable
//! store.

mod memory;
#[cfg(feature = "redis")]
mod redis_cache;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::params::Params;
use crate::state_machine::{JobId, JobRecord, JobStatus, Priority, snapshot_key};

pub use memory::{InMemoryJobStore, InMemoryStatusCache};
#[cfg(feature = "redis")]
pub use redis_cache::RedisStatusCache;
pub use sqlite::{SqliteJobStore, SqliteStatusCache};

/// Default lifetime of an ephemeral snapshot.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(30 * 60);

/// Durable job records.
pub trait JobStore: Send + Sync {
    /// Persist a new record.
    fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Write `status`, `current_attempt`, `error` and `updated_at` of `job`.
    /// Rows already in a final status are left untouched. Returns whether a
    /// row changed.
    fn update(&self, job: &JobRecord) -> Result<bool, StoreError>;

    /// Single-field status change used by the administrative surface, with
    /// the same final-status guard as [`JobStore::update`].
    fn set_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Jobs currently `running`, highest priority first.
    fn running(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Jobs ordered by creation time, newest first.
    fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError>;
}

/// Latest known state of a handler/method pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub priority: Priority,
    pub params: Params,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn of(job: &JobRecord) -> Self {
        Self {
            status: job.status,
            priority: job.priority,
            params: job.params.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Fast, expiring, last-writer-wins status cache.
pub trait StatusCache: Send + Sync {
    fn put(&self, key: &str, snapshot: &StatusSnapshot, ttl: Duration) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<StatusSnapshot>, StoreError>;
}

/// Dual writer over a durable store and an ephemeral cache.
#[derive(Clone)]
pub struct StatusStore {
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn StatusCache>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(jobs: Arc<dyn JobStore>, cache: Arc<dyn StatusCache>, ttl: Duration) -> Self {
        Self { jobs, cache, ttl }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryStatusCache::new()),
            SNAPSHOT_TTL,
        )
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Record a newly submitted job.
    pub fn create(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.jobs.insert(job)?;
        self.publish(job);
        Ok(())
    }

    /// Record a status transition. Returns `false` when the durable record
    /// was already final and kept its status; the cache is then left alone.
    pub fn record(&self, job: &JobRecord) -> Result<bool, StoreError> {
        let changed = self.jobs.update(job)?;
        if changed {
            self.publish(job);
        } else {
            debug!(job_id = %job.id, status = %job.status, "durable record is final, write skipped");
        }
        Ok(changed)
    }

    /// Re-read the durable record and publish it, so the cache catches up
    /// with a change made behind the runner's back.
    pub fn refresh(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let stored = self.jobs.get(id)?;
        if let Some(job) = &stored {
            self.publish(job);
        }
        Ok(stored)
    }

    /// Latest snapshot for a handler/method pair, if not expired.
    pub fn snapshot(&self, handler: &str, method: &str) -> Result<Option<StatusSnapshot>, StoreError> {
        self.cache.get(&snapshot_key(handler, method))
    }

    fn publish(&self, job: &JobRecord) {
        let key = job.snapshot_key();
        if let Err(e) = self.cache.put(&key, &StatusSnapshot::of(job), self.ttl) {
            warn!(job_id = %job.id, %key, error = %e, "status cache write failed");
        }
    }
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}
