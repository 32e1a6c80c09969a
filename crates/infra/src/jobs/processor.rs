//! Job processor: claims a batch, runs each job against the search index,
//! and records the outcome through the retry controller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::projector::{ProjectionError, RecordSource};
use crate::search::{IndexClient, IndexSettings, PRIMARY_KEY, SearchError};

use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;
use super::types::{Job, JobAction};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Search index uid
    pub index_name: String,
    /// Settings applied by [`JobProcessor::ensure_index`]
    pub index_settings: IndexSettings,
    /// Jobs claimed per batch
    pub batch_size: usize,
    /// Jobs of one batch running at the same time
    pub max_concurrency: usize,
    /// Reclaim `processing` jobs untouched for this long (`None` disables)
    pub stale_after: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            index_name: "programs".to_string(),
            index_settings: IndexSettings::programs(),
            batch_size: 10,
            max_concurrency: 4,
            stale_after: Some(Duration::from_secs(600)),
        }
    }
}

impl ProcessorConfig {
    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Why a single run of a job failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Final state of one processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Back in the pool after `backoff`.
    Retrying { attempt: u32, backoff: Duration },
    DeadLettered { attempt: u32 },
    /// The store write failed; the job was left as the store had it.
    Unresolved,
}

/// Counts for one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub unresolved: usize,
    pub reclaimed: u64,
}

impl BatchReport {
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            JobOutcome::Unresolved => self.unresolved += 1,
        }
    }
}

/// Runs claimed jobs against the record source and the search index.
pub struct JobProcessor<S, R, I> {
    store: Arc<S>,
    source: Arc<R>,
    index: Arc<I>,
    policy: RetryPolicy,
    config: ProcessorConfig,
}

impl<S, R, I> JobProcessor<S, R, I>
where
    S: JobStore + 'static,
    R: RecordSource + 'static,
    I: IndexClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        source: Arc<R>,
        index: Arc<I>,
        policy: RetryPolicy,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            source,
            index,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create/configure the target index.
    #[instrument(skip(self), fields(index = %self.config.index_name), err)]
    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        self.index
            .ensure_index(
                &self.config.index_name,
                PRIMARY_KEY,
                &self.config.index_settings,
            )
            .await
    }

    /// Reclaim stale jobs, claim one batch and run it to completion.
    ///
    /// Never fails: store errors are logged and reflected in the report.
    pub async fn process_batch(self: &Arc<Self>) -> BatchReport {
        let mut report = BatchReport::default();

        if let Some(stale_after) = self.config.stale_after.filter(|d| !d.is_zero()) {
            match self
                .store
                .reclaim_stale(stale_after, self.policy.max_attempts)
                .await
            {
                Ok(0) => {}
                Ok(n) => {
                    warn!(
                        reclaimed = n,
                        stale_after_secs = stale_after.as_secs(),
                        "reclaimed stale processing jobs"
                    );
                    report.reclaimed = n;
                }
                Err(e) => error!(error = %e, "failed to reclaim stale jobs"),
            }
        }

        let jobs = match self.store.claim_batch(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to claim jobs");
                return report;
            }
        };

        report.claimed = jobs.len();
        if jobs.is_empty() {
            return report;
        }
        debug!(claimed = jobs.len(), "claimed job batch");

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut running = JoinSet::new();

        for job in jobs {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            running.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                this.run_contained(job).await
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(error = %e, "job task aborted");
                    report.unresolved += 1;
                }
            }
        }

        report
    }

    async fn run_contained(&self, job: Job) -> JobOutcome {
        let snapshot = job.clone();
        match AssertUnwindSafe(self.process_job(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let error = JobError::Panicked(panic_message(panic.as_ref()));
                error!(
                    job_id = %snapshot.id,
                    subject_id = %snapshot.subject_id,
                    error = %error,
                    "job panicked"
                );
                self.handle_failure(&snapshot, &error).await
            }
        }
    }

    /// Run one claimed job and record its outcome in the store.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, subject_id = %job.subject_id, action = %job.action)
    )]
    pub async fn process_job(&self, job: Job) -> JobOutcome {
        let result = match job.action {
            JobAction::Index => self.index_subject(&job).await,
            JobAction::Delete => self
                .index
                .delete_document(&self.config.index_name, job.subject_id)
                .await
                .map_err(JobError::from),
        };

        match result {
            Ok(()) => match self.store.mark_completed(job.id).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        subject_id = %job.subject_id,
                        action = %job.action,
                        "job completed"
                    );
                    JobOutcome::Completed
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to mark job completed");
                    JobOutcome::Unresolved
                }
            },
            Err(error) => self.handle_failure(&job, &error).await,
        }
    }

    async fn index_subject(&self, job: &Job) -> Result<(), JobError> {
        let document = self.source.project(job.subject_id).await?;
        self.index
            .add_documents(&self.config.index_name, std::slice::from_ref(&document))
            .await?;
        Ok(())
    }

    /// Apply the retry decision for a failed run of `job`.
    pub async fn handle_failure(&self, job: &Job, error: &JobError) -> JobOutcome {
        let message = error.to_string();

        match self.policy.decide(job, Utc::now()) {
            RetryDecision::Retry {
                attempt,
                backoff,
                next_schedule_at,
            } => match self.store.mark_failed(job.id, &message, next_schedule_at).await {
                Ok(()) => {
                    warn!(
                        job_id = %job.id,
                        subject_id = %job.subject_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %message,
                        "job failed, retry scheduled"
                    );
                    JobOutcome::Retrying { attempt, backoff }
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to mark job failed");
                    JobOutcome::Unresolved
                }
            },
            RetryDecision::DeadLetter { attempt } => {
                match self.store.mark_dead(job.id, &message).await {
                    Ok(()) => {
                        warn!(
                            job_id = %job.id,
                            subject_id = %job.subject_id,
                            attempts = attempt,
                            error = %message,
                            "job dead-lettered"
                        );
                        JobOutcome::DeadLettered { attempt }
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "failed to mark job dead");
                        JobOutcome::Unresolved
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
