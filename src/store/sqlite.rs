//! SQLite-backed stores shared by every process pointing at the same file.
//!
//! Each call opens its own connection, so the stores are cheap to clone into
//! detached processes and never hold a lock across an await point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{JobStore, StatusCache, StatusSnapshot};
use crate::error::StoreError;
use crate::params::Params;
use crate::state_machine::{JobId, JobRecord, JobStatus, Priority, RetryConfig};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS background_jobs (
  id TEXT PRIMARY KEY,
  class_name TEXT NOT NULL,
  method TEXT NOT NULL,
  params TEXT,
  retry_attempts INTEGER NOT NULL DEFAULT 3,
  current_attempt INTEGER NOT NULL DEFAULT 0,
  retry_delay INTEGER NOT NULL DEFAULT 5,
  priority INTEGER NOT NULL DEFAULT 1,
  delay_until TEXT,
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending', 'running', 'completed', 'failed')),
  error TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_background_jobs_status ON background_jobs(status);
CREATE INDEX IF NOT EXISTS idx_background_jobs_created ON background_jobs(created_at);

CREATE TABLE IF NOT EXISTS job_status_cache (
  key TEXT PRIMARY KEY,
  snapshot TEXT NOT NULL,
  expires_at TEXT NOT NULL
);
"#;

const JOB_COLUMNS: &str = "id,class_name,method,params,retry_attempts,current_attempt,\
     retry_delay,priority,delay_until,status,error,created_at,updated_at";

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width nanoseconds keep the text sortable and the round trip exact.
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Open `path`, switch it to WAL and create the schema if needed.
fn bootstrap(path: &Path) -> Result<(), StoreError> {
    let conn = connect(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Columns of one `background_jobs` row before validation.
struct JobRow {
    id: String,
    handler: String,
    method: String,
    params: Option<String>,
    retry_attempts: i64,
    current_attempt: i64,
    retry_delay: i64,
    priority: i64,
    delay_until: Option<String>,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            handler: row.get(1)?,
            method: row.get(2)?,
            params: row.get(3)?,
            retry_attempts: row.get(4)?,
            current_attempt: row.get(5)?,
            retry_delay: row.get(6)?,
            priority: row.get(7)?,
            delay_until: row.get(8)?,
            status: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        let id = self.id.clone();
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp `{s}`: {e}")))
        };
        let count = |n: i64, column: &str| {
            u32::try_from(n).map_err(|_| corrupt(format!("{column} out of range: {n}")))
        };

        Ok(JobRecord {
            id: self
                .id
                .parse::<JobId>()
                .map_err(|e| corrupt(e.to_string()))?,
            params: match self.params.as_deref() {
                Some(json) => serde_json::from_str(json)?,
                None => Params::new(),
            },
            status: self.status.parse::<JobStatus>().map_err(&corrupt)?,
            priority: Priority::from_rank(self.priority)
                .ok_or_else(|| corrupt(format!("unknown priority rank {}", self.priority)))?,
            retry: RetryConfig {
                attempts: count(self.retry_attempts, "retry_attempts")?,
                delay_secs: u64::try_from(self.retry_delay)
                    .map_err(|_| corrupt(format!("negative retry_delay {}", self.retry_delay)))?,
            },
            current_attempt: count(self.current_attempt, "current_attempt")?,
            delay_until: self.delay_until.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            handler: self.handler,
            method: self.method,
            error: self.error,
        })
    }
}

/// Durable job records in the `background_jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        bootstrap(&db_path)?;
        Ok(Self { db_path })
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<JobRecord>, StoreError> {
        let conn = connect(&self.db_path)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        let conn = connect(&self.db_path)?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO background_jobs({JOB_COLUMNS}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
            ),
            params![
                job.id.to_string(),
                job.handler,
                job.method,
                serde_json::to_string(&job.params)?,
                job.retry.attempts,
                job.current_attempt,
                i64::try_from(job.retry.delay_secs).unwrap_or(i64::MAX),
                job.priority.rank(),
                job.delay_until.map(timestamp),
                job.status.as_str(),
                job.error,
                timestamp(job.created_at),
                timestamp(job.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(job.id.to_string()));
        }
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let conn = connect(&self.db_path)?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id=?1"),
                [id.to_string()],
                JobRow::read,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    fn update(&self, job: &JobRecord) -> Result<bool, StoreError> {
        let conn = connect(&self.db_path)?;
        let n = conn.execute(
            "UPDATE background_jobs SET status=?1, current_attempt=?2, error=?3, updated_at=?4 \
             WHERE id=?5 AND status NOT IN ('completed','failed')",
            params![
                job.status.as_str(),
                job.current_attempt,
                job.error,
                timestamp(job.updated_at),
                job.id.to_string(),
            ],
        )?;
        Ok(n > 0)
    }

    fn set_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = connect(&self.db_path)?;
        let n = conn.execute(
            "UPDATE background_jobs SET status=?1, error=COALESCE(?2,error), updated_at=?3 \
             WHERE id=?4 AND status NOT IN ('completed','failed')",
            params![status.as_str(), error, timestamp(Utc::now()), id.to_string()],
        )?;
        Ok(n > 0)
    }

    fn running(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query(
            &format!(
                "SELECT {JOB_COLUMNS} FROM background_jobs WHERE status='running' \
                 ORDER BY priority DESC, created_at ASC, rowid ASC"
            ),
            params![],
        )
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError> {
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        self.query(
            &format!(
                "SELECT {JOB_COLUMNS} FROM background_jobs \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            [limit],
        )
    }
}

/// Expiring snapshots in the `job_status_cache` table.
#[derive(Debug, Clone)]
pub struct SqliteStatusCache {
    db_path: PathBuf,
}

impl SqliteStatusCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        bootstrap(&db_path)?;
        Ok(Self { db_path })
    }
}

impl StatusCache for SqliteStatusCache {
    fn put(&self, key: &str, snapshot: &StatusSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Storage(e.to_string()))?;
        let conn = connect(&self.db_path)?;
        conn.execute(
            "INSERT INTO job_status_cache(key, snapshot, expires_at) VALUES (?1,?2,?3) \
             ON CONFLICT(key) DO UPDATE SET snapshot=excluded.snapshot, expires_at=excluded.expires_at",
            params![key, serde_json::to_string(snapshot)?, timestamp(Utc::now() + ttl)],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StatusSnapshot>, StoreError> {
        let conn = connect(&self.db_path)?;
        let now = timestamp(Utc::now());
        conn.execute(
            "DELETE FROM job_status_cache WHERE key=?1 AND expires_at<=?2",
            params![key, now],
        )?;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM job_status_cache WHERE key=?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(snapshot.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}
