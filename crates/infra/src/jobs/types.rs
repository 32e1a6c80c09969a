//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use searchsync_core::{DomainError, JobId, SubjectId};

/// What a job asks the search index to do with its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Rebuild the document from the record source and upsert it.
    Index,
    /// Remove the document from the index.
    Delete,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Index => "index",
            JobAction::Delete => "delete",
        }
    }
}

impl FromStr for JobAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(JobAction::Index),
            "delete" => Ok(JobAction::Delete),
            other => Err(DomainError::validation(format!("unknown job action: {other}"))),
        }
    }
}

impl core::fmt::Display for JobAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
///
/// `pending → processing → completed | failed | dead`, with `failed` jobs
/// re-entering the claimable pool once their `scheduled_at` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Indexed/deleted successfully (terminal)
    Completed,
    /// Failed, waiting for its retry schedule
    Failed,
    /// Exhausted its attempts (terminal, needs an operator)
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of search-index work, as stored in `search_index_jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Record the job concerns
    pub subject_id: SubjectId,
    pub action: JobAction,
    pub status: JobStatus,
    /// Failed attempts so far (starts at 0, never decreases)
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Not claimable before this instant
    pub scheduled_at: DateTime<Utc>,
    /// Set on successful completion
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job that is due immediately.
    pub fn new(subject_id: SubjectId, action: JobAction, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            subject_id,
            action,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            scheduled_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Schedule the job for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Whether a claim issued at `now` may pick this job up.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now
    }
}

/// Document pushed to the search engine for one program.
///
/// Derived from the record source on every `index` job; never persisted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: SubjectId,
    pub title: String,
    pub description: String,
    pub program_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    /// Category name (denormalized for filtering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Language code (denormalized for filtering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub thumbnail: String,
    pub video_url: String,
    /// RFC 3339
    pub created_at: String,
}
