//! Search index adapter.
//!
//! [`IndexClient`] is the seam between the job processor and the search
//! engine. [`MeilisearchClient`] talks to a real engine over HTTP;
//! [`InMemoryIndex`] keeps documents in a map for tests and local runs.

pub mod meilisearch;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use searchsync_core::SubjectId;

use crate::jobs::types::IndexDocument;

pub use meilisearch::MeilisearchClient;

/// Name of the field every document is keyed by.
pub const PRIMARY_KEY: &str = "id";

/// Attribute configuration applied by [`IndexClient::ensure_index`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexSettings {
    pub searchable: Vec<String>,
    pub filterable: Vec<String>,
    pub sortable: Vec<String>,
}

impl IndexSettings {
    /// Settings for the program catalogue index.
    pub fn programs() -> Self {
        fn owned(fields: &[&str]) -> Vec<String> {
            fields.iter().map(|f| f.to_string()).collect()
        }

        Self {
            searchable: owned(&["title", "description"]),
            filterable: owned(&["status", "program_type", "category", "language"]),
            sortable: owned(&["published_at", "created_at"]),
        }
    }
}

/// Search engine operations needed by the worker.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Create the index if missing and apply `settings`.
    async fn ensure_index(
        &self,
        index: &str,
        primary_key: &str,
        settings: &IndexSettings,
    ) -> Result<(), SearchError>;

    /// Upsert documents by primary key.
    async fn add_documents(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<(), SearchError>;

    /// Remove a document. Removing an absent document succeeds.
    async fn delete_document(&self, index: &str, id: SubjectId) -> Result<(), SearchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    /// Engine unreachable, timed out, or the response could not be read.
    #[error("search engine request failed: {0}")]
    Http(String),
    #[error("search engine rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// The engine accepted the write but its task ended unsuccessfully.
    #[error("search engine task {task_uid} failed: {message}")]
    TaskFailed { task_uid: u64, message: String },
}

#[derive(Debug, Default)]
struct IndexState {
    settings: Option<IndexSettings>,
    documents: HashMap<SubjectId, IndexDocument>,
}

/// Map-backed index for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    indexes: RwLock<HashMap<String, IndexState>>,
    failure: RwLock<Option<SearchError>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<SearchError>) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = error;
        }
    }

    pub fn document(&self, index: &str, id: SubjectId) -> Option<IndexDocument> {
        self.indexes
            .read()
            .ok()?
            .get(index)?
            .documents
            .get(&id)
            .cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indexes
            .read()
            .ok()
            .and_then(|indexes| indexes.get(index).map(|state| state.documents.len()))
            .unwrap_or(0)
    }

    pub fn settings(&self, index: &str) -> Option<IndexSettings> {
        self.indexes.read().ok()?.get(index)?.settings.clone()
    }

    fn check_failure(&self) -> Result<(), SearchError> {
        let failure = self
            .failure
            .read()
            .map_err(|_| SearchError::Http("index lock poisoned".to_string()))?;
        match failure.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn with_index<T>(
        &self,
        index: &str,
        f: impl FnOnce(&mut IndexState) -> T,
    ) -> Result<T, SearchError> {
        self.check_failure()?;
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| SearchError::Http("index lock poisoned".to_string()))?;
        Ok(f(indexes.entry(index.to_string()).or_default()))
    }
}

#[async_trait]
impl IndexClient for InMemoryIndex {
    async fn ensure_index(
        &self,
        index: &str,
        _primary_key: &str,
        settings: &IndexSettings,
    ) -> Result<(), SearchError> {
        self.with_index(index, |state| state.settings = Some(settings.clone()))
    }

    async fn add_documents(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<(), SearchError> {
        self.with_index(index, |state| {
            for doc in documents {
                state.documents.insert(doc.id, doc.clone());
            }
        })
    }

    async fn delete_document(&self, index: &str, id: SubjectId) -> Result<(), SearchError> {
        self.with_index(index, |state| {
            state.documents.remove(&id);
        })
    }
}
