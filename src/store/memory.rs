//! In-process stores for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{JobStore, StatusCache, StatusSnapshot};
use crate::error::StoreError;
use crate::state_machine::{JobId, JobRecord, JobStatus};

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("lock poisoned".into())
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    // Insertion sequence breaks ties between equal `created_at` values.
    jobs: RwLock<HashMap<JobId, (u64, JobRecord)>>,
    seq: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.to_string()));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        jobs.insert(job.id, (seq, job.clone()));
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).map(|(_, job)| job.clone()))
    }

    fn update(&self, job: &JobRecord) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id) {
            Some((_, stored)) if !stored.status.is_terminal() => {
                stored.status = job.status;
                stored.current_attempt = job.current_attempt;
                stored.error = job.error.clone();
                stored.updated_at = job.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&id) {
            Some((_, stored)) if !stored.status.is_terminal() => {
                stored.status = status;
                if let Some(error) = error {
                    stored.error = Some(error.to_string());
                }
                stored.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn running(&self) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut running: Vec<_> = jobs
            .values()
            .filter(|(_, job)| job.status == JobStatus::Running)
            .collect();
        running.sort_by(|(sa, a), (sb, b)| b.priority.cmp(&a.priority).then(sa.cmp(sb)));
        Ok(running.into_iter().map(|(_, job)| job.clone()).collect())
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut all: Vec<_> = jobs.values().collect();
        all.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));
        Ok(all
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, job)| job.clone())
            .collect())
    }
}

/// Expiring snapshot map local to this process.
#[derive(Debug, Default)]
pub struct InMemoryStatusCache {
    entries: Mutex<HashMap<String, (StatusSnapshot, DateTime<Utc>)>>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusCache for InMemoryStatusCache {
    fn put(&self, key: &str, snapshot: &StatusSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Storage(e.to_string()))?;
        let expires_at = Utc::now() + ttl;
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), (snapshot.clone(), expires_at));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StatusSnapshot>, StoreError> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        match entries.get(key) {
            Some((snapshot, expires_at)) if *expires_at > Utc::now() => Ok(Some(snapshot.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use crate::state_machine::{JobOptions, Priority};

    fn job(priority: Priority) -> JobRecord {
        JobRecord::new(
            "Greeter",
            "sayHello",
            Params::new(),
            JobOptions {
                priority,
                ..Default::default()
            },
        )
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let job = job(Priority::Normal);
        store.insert(&job).unwrap();
        assert!(matches!(store.insert(&job), Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn running_is_ordered_by_priority() {
        let store = InMemoryJobStore::new();
        for priority in [Priority::Low, Priority::High, Priority::Normal] {
            let mut job = job(priority);
            store.insert(&job).unwrap();
            job.advance(JobStatus::Running);
            store.update(&job).unwrap();
        }
        store.insert(&job(Priority::High)).unwrap();

        let running: Vec<_> = store.running().unwrap().iter().map(|j| j.priority).collect();
        assert_eq!(running, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn list_is_newest_first() {
        let store = InMemoryJobStore::new();
        let first = job(Priority::Normal);
        let second = job(Priority::Normal);
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let ids: Vec<_> = store.list(None).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(store.list(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn set_status_leaves_final_rows_alone() {
        let store = InMemoryJobStore::new();
        let mut job = job(Priority::Normal);
        store.insert(&job).unwrap();
        job.advance(JobStatus::Running);
        job.advance(JobStatus::Completed);
        assert!(store.update(&job).unwrap());

        assert!(!store.set_status(job.id, JobStatus::Failed, Some("cancelled")).unwrap());
        assert_eq!(store.get(job.id).unwrap().unwrap().status, JobStatus::Completed);
        assert!(!store.set_status(JobId::new(), JobStatus::Failed, None).unwrap());
    }

    #[test]
    fn cache_entries_expire() {
        let cache = InMemoryStatusCache::new();
        let snapshot = StatusSnapshot::of(&job(Priority::Low));
        cache.put("a_b", &snapshot, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("a_b").unwrap(), Some(snapshot.clone()));

        cache.put("a_b", &snapshot, Duration::ZERO).unwrap();
        assert_eq!(cache.get("a_b").unwrap(), None);
    }

    #[test]
    fn cache_is_last_writer_wins() {
        let cache = InMemoryStatusCache::new();
        let mut first = StatusSnapshot::of(&job(Priority::Low));
        cache.put("k", &first, Duration::from_secs(60)).unwrap();
        first.status = JobStatus::Running;
        cache.put("k", &first, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").unwrap().unwrap().status, JobStatus::Running);
    }
}
