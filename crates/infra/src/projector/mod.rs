//! Record projector: builds the search document for a record from its
//! current, non-deleted state.
//!
//! Read-only and side-effect free. A missing record is reported as
//! [`ProjectionError::NotFound`]; every other failure is a transient
//! [`ProjectionError::Lookup`].

pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use searchsync_core::SubjectId;

use crate::jobs::types::IndexDocument;

pub use postgres::PostgresRecordSource;

/// Read access to the primary record store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Project the current state of `subject_id` into an index document.
    async fn project(&self, subject_id: SubjectId) -> Result<IndexDocument, ProjectionError>;
}

/// Projection error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// No live record with that id (absent or soft-deleted).
    #[error("record {0} not found")]
    NotFound(SubjectId),
    #[error("record lookup failed: {0}")]
    Lookup(String),
}

/// Map-backed record source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordSource {
    records: RwLock<HashMap<SubjectId, IndexDocument>>,
    failure: RwLock<Option<String>>,
}

impl InMemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record behind `doc.id`.
    pub fn upsert(&self, doc: IndexDocument) {
        if let Ok(mut records) = self.records.write() {
            records.insert(doc.id, doc);
        }
    }

    pub fn remove(&self, subject_id: SubjectId) {
        if let Ok(mut records) = self.records.write() {
            records.remove(&subject_id);
        }
    }

    /// Make every lookup fail with `message` until cleared with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = message.map(str::to_string);
        }
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn project(&self, subject_id: SubjectId) -> Result<IndexDocument, ProjectionError> {
        let failure = self
            .failure
            .read()
            .map_err(|_| ProjectionError::Lookup("record source lock poisoned".to_string()))?
            .clone();
        if let Some(message) = failure {
            return Err(ProjectionError::Lookup(message));
        }

        self.records
            .read()
            .map_err(|_| ProjectionError::Lookup("record source lock poisoned".to_string()))?
            .get(&subject_id)
            .cloned()
            .ok_or(ProjectionError::NotFound(subject_id))
    }
}
