//! Poll loop driving a [`JobProcessor`] on a fixed interval.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::projector::RecordSource;
use crate::search::IndexClient;

use super::processor::{BatchReport, JobProcessor};
use super::store::JobStore;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Cumulative poller statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollerStats {
    pub ticks: u64,
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_unresolved: u64,
    pub jobs_reclaimed: u64,
}

impl PollerStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.ticks += 1;
        self.jobs_claimed += report.claimed as u64;
        self.jobs_completed += report.completed as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_dead_lettered += report.dead_lettered as u64;
        self.jobs_unresolved += report.unresolved as u64;
        self.jobs_reclaimed += report.reclaimed;
    }
}

fn lock(stats: &Mutex<PollerStats>) -> MutexGuard<'_, PollerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running poller.
#[derive(Debug)]
pub struct JobPollerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PollerStats>>,
}

impl JobPollerHandle {
    /// Stop polling and wait for the in-flight batch to finish.
    pub async fn shutdown(self) -> PollerStats {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job poller task failed");
        }
        lock(&self.stats).clone()
    }

    pub fn stats(&self) -> PollerStats {
        lock(&self.stats).clone()
    }
}

/// Fixed-interval scheduler: one `process_batch` per tick, never overlapping.
pub struct JobPoller<S, R, I> {
    processor: Arc<JobProcessor<S, R, I>>,
    poll_interval: Duration,
    name: String,
    stats: Arc<Mutex<PollerStats>>,
}

impl<S, R, I> JobPoller<S, R, I>
where
    S: JobStore + 'static,
    R: RecordSource + 'static,
    I: IndexClient + 'static,
{
    /// `poll_interval` is clamped to at least one millisecond.
    pub fn new(processor: Arc<JobProcessor<S, R, I>>, poll_interval: Duration) -> Self {
        Self {
            processor,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            name: "search-index-poller".to_string(),
            stats: Arc::new(Mutex::new(PollerStats::default())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run the loop on the tokio runtime.
    pub fn spawn(self) -> JobPollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(stop_rx));

        JobPollerHandle {
            stop: stop_tx,
            join,
            stats,
        }
    }

    /// Poll until `stop` turns true or its sender is dropped.
    ///
    /// Stop is checked before every tick; a batch that already started
    /// always runs to completion.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let config = self.processor.config();
        info!(
            poller = %self.name,
            index = %config.index_name,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = config.batch_size,
            max_concurrency = config.max_concurrency,
            max_attempts = self.processor.policy().max_attempts,
            "job poller started"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.processor.process_batch().await;
                    if report.claimed > 0 || report.reclaimed > 0 {
                        debug!(poller = %self.name, ?report, "batch finished");
                    }
                    lock(&self.stats).absorb(&report);
                }
            }
        }

        let stats = lock(&self.stats).clone();
        info!(
            poller = %self.name,
            ticks = stats.ticks,
            completed = stats.jobs_completed,
            retried = stats.jobs_retried,
            dead_lettered = stats.jobs_dead_lettered,
            "job poller stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use searchsync_core::SubjectId;

    use crate::jobs::processor::ProcessorConfig;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{IndexDocument, Job, JobAction, JobStatus};
    use crate::projector::{InMemoryRecordSource, ProjectionError};
    use crate::search::InMemoryIndex;

    fn poller<R: RecordSource + 'static>(
        store: Arc<InMemoryJobStore>,
        source: Arc<R>,
    ) -> JobPoller<InMemoryJobStore, R, InMemoryIndex> {
        let processor = Arc::new(JobProcessor::new(
            store,
            source,
            Arc::new(InMemoryIndex::new()),
            RetryPolicy::default(),
            ProcessorConfig::default().with_stale_after(None),
        ));
        JobPoller::new(processor, Duration::from_millis(10))
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn drains_due_jobs_and_reports_stats() {
        let store = InMemoryJobStore::arc();
        for _ in 0..3 {
            store
                .insert(Job::new(SubjectId::new(), JobAction::Delete, 5))
                .unwrap();
        }

        let handle = poller(store.clone(), Arc::new(InMemoryRecordSource::new())).spawn();
        wait_for(|| handle.stats().jobs_completed == 3).await;
        let stats = handle.shutdown().await;

        assert!(stats.ticks >= 1);
        assert_eq!(stats.jobs_claimed, 3);
        assert_eq!(store.list_by_status(JobStatus::Completed).len(), 3);
    }

    #[tokio::test]
    async fn stop_before_first_tick_processes_nothing() {
        let store = InMemoryJobStore::arc();
        store
            .insert(Job::new(SubjectId::new(), JobAction::Delete, 5))
            .unwrap();

        let handle = poller(store.clone(), Arc::new(InMemoryRecordSource::new())).spawn();
        let stats = handle.shutdown().await;

        assert_eq!(stats.ticks, 0);
        assert_eq!(store.list_by_status(JobStatus::Pending).len(), 1);
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let store = InMemoryJobStore::arc();
        store
            .insert(Job::new(SubjectId::new(), JobAction::Delete, 5))
            .unwrap();
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            Arc::new(InMemoryRecordSource::new()),
            Arc::new(InMemoryIndex::new()),
            RetryPolicy::default(),
            ProcessorConfig::default().with_stale_after(None),
        ));

        let handle = JobPoller::new(processor, Duration::ZERO).spawn();
        wait_for(|| handle.stats().jobs_completed == 1).await;
        let stats = handle.shutdown().await;

        assert!(stats.ticks >= 1);
        assert_eq!(store.list_by_status(JobStatus::Completed).len(), 1);
    }

    #[derive(Default)]
    struct SlowSource {
        started: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for SlowSource {
        async fn project(&self, subject_id: SubjectId) -> Result<IndexDocument, ProjectionError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(IndexDocument {
                id: subject_id,
                title: "Slow".to_string(),
                description: String::new(),
                program_type: "film".to_string(),
                status: "published".to_string(),
                duration: None,
                published_at: None,
                category: None,
                language: None,
                thumbnail: String::new(),
                video_url: String::new(),
                created_at: "2024-01-01T00:00:00Z".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_batch() {
        let store = InMemoryJobStore::arc();
        let job_id = store
            .insert(Job::new(SubjectId::new(), JobAction::Index, 5))
            .unwrap();
        let source = Arc::new(SlowSource::default());

        let handle = poller(store.clone(), source.clone()).spawn();
        wait_for(|| source.started.load(Ordering::SeqCst) == 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Completed);
    }
}
