//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use searchsync_core::JobId;

use super::retry::effective_max_attempts;
use super::types::{Job, JobStatus};

/// Error text recorded on jobs returned to the pool by [`JobStore::reclaim_stale`].
pub const STALE_PROCESSING_ERROR: &str = "processing lease expired";

/// Durable job table.
///
/// Every method is a single atomic transition. Implementations must guarantee
/// that concurrent `claim_batch` callers never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `batch_size` claimable jobs, oldest `scheduled_at` first,
    /// moving them to `processing`.
    ///
    /// Returns the snapshot taken *before* the transition. Returns fewer jobs
    /// (possibly none) when fewer are due.
    async fn claim_batch(&self, batch_size: usize) -> Result<Vec<Job>, JobStoreError>;

    /// `processing → completed`, stamping `processed_at`.
    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// `→ failed`: bump `attempts`, record the error and the next schedule.
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        next_schedule_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// `→ dead`: bump `attempts` and record the final error.
    async fn mark_dead(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError>;

    /// Return jobs stuck in `processing` for longer than `stale_after` to the
    /// pool, counting the lost run as a failed attempt.
    ///
    /// Jobs whose attempts reach `min(job.max_attempts, max_attempts)` go to
    /// `dead`. Returns the number of rows touched.
    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// The job is unknown or already terminal; nothing was changed.
    #[error("job {0} not transitioned (unknown or terminal)")]
    NotTransitioned(JobId),
    #[error("failed to decode job row: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn claim_batch(&self, batch_size: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(batch_size).await
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).mark_completed(job_id).await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        next_schedule_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).mark_failed(job_id, error, next_schedule_at).await
    }

    async fn mark_dead(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        (**self).mark_dead(job_id, error).await
    }

    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<u64, JobStoreError> {
        (**self).reclaim_stale(stale_after, max_attempts).await
    }
}

/// In-memory job store for tests/dev.
///
/// A claim happens under a single write lock, so two callers can never
/// observe the same job as claimable.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a job as-is (the producer side lives outside this crate).
    pub fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    /// Current state of a job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs
            .read()
            .ok()
            .and_then(|jobs| jobs.get(&job_id).cloned())
    }

    /// All jobs currently in `status`.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        let Ok(jobs) = self.jobs.read() else {
            return Vec::new();
        };
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.scheduled_at);
        result
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    /// Apply `f` to a non-terminal job.
    fn transition<F>(&self, job_id: JobId, f: F) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                let now = Utc::now();
                f(job, now);
                job.updated_at = now;
                Ok(())
            }
            _ => Err(JobStoreError::NotTransitioned(job_id)),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_batch(&self, batch_size: usize) -> Result<Vec<Job>, JobStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write()?;
        let now = Utc::now();

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_claimable_at(now))
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                claimed.push(job.clone());
                job.status = JobStatus::Processing;
                job.updated_at = now;
            }
        }

        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.transition(job_id, |job, now| {
            job.status = JobStatus::Completed;
            job.processed_at = Some(now);
        })
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        next_schedule_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(job_id, |job, _| {
            job.status = JobStatus::Failed;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.scheduled_at = next_schedule_at;
        })
    }

    async fn mark_dead(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        self.transition(job_id, |job, _| {
            job.status = JobStatus::Dead;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
        })
    }

    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<u64, JobStoreError> {
        // A window too large to represent never expires.
        let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
            return Ok(0);
        };

        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut reclaimed = 0;

        for job in jobs.values_mut() {
            let expired = job
                .updated_at
                .checked_add_signed(stale_after)
                .is_some_and(|deadline| deadline <= now);
            if job.status != JobStatus::Processing || !expired {
                continue;
            }
            job.attempts += 1;
            job.last_error = Some(STALE_PROCESSING_ERROR.to_string());
            job.updated_at = now;
            if job.attempts >= effective_max_attempts(job.max_attempts, max_attempts) {
                job.status = JobStatus::Dead;
            } else {
                job.status = JobStatus::Failed;
                job.scheduled_at = now;
            }
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use chrono::Duration as ChronoDuration;
    use searchsync_core::SubjectId;

    use crate::jobs::types::JobAction;

    fn due_job() -> Job {
        Job::new(SubjectId::new(), JobAction::Index, 5)
    }

    fn seed(store: &InMemoryJobStore, n: usize) -> Vec<JobId> {
        let base = Utc::now() - ChronoDuration::minutes(10);
        (0..n)
            .map(|i| {
                let job = due_job().scheduled_at(base + ChronoDuration::seconds(i as i64));
                store.insert(job).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn claim_splits_fifteen_jobs_into_ten_then_five() {
        let store = InMemoryJobStore::new();
        seed(&store, 15);

        let first = store.claim_batch(10).await.unwrap();
        let second = store.claim_batch(10).await.unwrap();
        let third = store.claim_batch(10).await.unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 5);
        assert!(third.is_empty());

        let ids: HashSet<_> = first.iter().chain(second.iter()).map(|j| j.id).collect();
        assert_eq!(ids.len(), 15);
    }

    #[tokio::test]
    async fn claim_returns_oldest_due_first_and_pre_transition_snapshot() {
        let store = InMemoryJobStore::new();
        let ids = seed(&store, 3);

        let claimed = store.claim_batch(2).await.unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), ids[..2]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Pending));

        let stored = store.get(ids[0]).unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn claim_skips_future_and_non_claimable_jobs() {
        let store = InMemoryJobStore::new();
        store
            .insert(due_job().scheduled_at(Utc::now() + ChronoDuration::hours(1)))
            .unwrap();
        let mut done = due_job();
        done.status = JobStatus::Completed;
        store.insert(done).unwrap();
        let mut failed = due_job();
        failed.status = JobStatus::Failed;
        let failed_id = store.insert(failed).unwrap();

        let claimed = store.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, failed_id);
        assert!(store.claim_batch(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = InMemoryJobStore::arc();
        seed(&store, 37);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_batch(4).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for job in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        // 8 callers x 4 = 32 < 37 eligible
        assert_eq!(total, 32);
    }

    #[tokio::test]
    async fn failure_transitions_bump_attempts() {
        let store = InMemoryJobStore::new();
        let id = store.insert(due_job()).unwrap();
        store.claim_batch(1).await.unwrap();

        let next = Utc::now() + ChronoDuration::seconds(20);
        store.mark_failed(id, "boom", next).await.unwrap();
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.scheduled_at, next);

        store.mark_dead(id, "gave up").await.unwrap();
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_mutated() {
        let store = InMemoryJobStore::new();
        let id = store.insert(due_job()).unwrap();
        store.claim_batch(1).await.unwrap();
        store.mark_dead(id, "gave up").await.unwrap();
        let before = store.get(id).unwrap();

        assert_eq!(
            store.mark_completed(id).await,
            Err(JobStoreError::NotTransitioned(id))
        );
        assert_eq!(
            store.mark_failed(id, "again", Utc::now()).await,
            Err(JobStoreError::NotTransitioned(id))
        );
        assert_eq!(store.get(id).unwrap(), before);

        let done = store.insert(due_job()).unwrap();
        store.claim_batch(1).await.unwrap();
        store.mark_completed(done).await.unwrap();
        assert!(store.mark_dead(done, "late").await.is_err());
        let job = store.get(done).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_job_is_not_transitioned() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert_eq!(
            store.mark_completed(id).await,
            Err(JobStoreError::NotTransitioned(id))
        );
    }

    #[tokio::test]
    async fn reclaim_returns_stale_processing_jobs() {
        let store = InMemoryJobStore::new();
        let long_ago = Utc::now() - ChronoDuration::hours(1);

        let mut stale = due_job();
        stale.status = JobStatus::Processing;
        stale.updated_at = long_ago;
        let stale_id = store.insert(stale).unwrap();

        let mut exhausted = due_job();
        exhausted.status = JobStatus::Processing;
        exhausted.attempts = 4;
        exhausted.updated_at = long_ago;
        let exhausted_id = store.insert(exhausted).unwrap();

        let mut fresh = due_job();
        fresh.status = JobStatus::Processing;
        let fresh_id = store.insert(fresh).unwrap();

        let n = store.reclaim_stale(Duration::from_secs(600), 5).await.unwrap();
        assert_eq!(n, 2);

        let job = store.get(stale_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some(STALE_PROCESSING_ERROR));

        assert_eq!(store.get(exhausted_id).unwrap().status, JobStatus::Dead);
        assert_eq!(store.get(fresh_id).unwrap().status, JobStatus::Processing);

        // The reclaimed job is claimable again right away.
        let claimed = store.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, stale_id);
    }

    #[tokio::test]
    async fn huge_stale_window_never_expires() {
        let store = InMemoryJobStore::new();
        let mut job = due_job();
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now() - ChronoDuration::days(365);
        let id = store.insert(job).unwrap();

        // Representable as a chrono duration, but past the end of the calendar.
        let beyond_calendar = Duration::from_secs(1_000_000_000_000_000);
        assert_eq!(store.reclaim_stale(beyond_calendar, 5).await.unwrap(), 0);
        assert_eq!(store.reclaim_stale(Duration::MAX, 5).await.unwrap(), 0);
        assert_eq!(store.get(id).unwrap().status, JobStatus::Processing);
    }
}
