//! Postgres-backed record source over the `programs` catalogue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use searchsync_core::SubjectId;

use super::{ProjectionError, RecordSource};
use crate::jobs::types::IndexDocument;

// Category name and language code are denormalized into the document so the
// search engine can filter on them.
const PROGRAM_FOR_INDEX: &str = r#"
    SELECT p.id,
           p.title,
           p.description,
           p.program_type,
           p.status,
           p.duration::TEXT AS duration,
           p.published_at,
           c.name AS category,
           l.code AS language,
           p.thumbnail,
           p.video_url,
           p.created_at
    FROM programs p
    LEFT JOIN categories c ON c.id = p.category_id
    LEFT JOIN languages l ON l.id = p.language_id
    WHERE p.id = $1 AND p.deleted_at IS NULL
"#;

/// Reads live programs for indexing.
#[derive(Debug, Clone)]
pub struct PostgresRecordSource {
    pool: Arc<PgPool>,
}

impl PostgresRecordSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl RecordSource for PostgresRecordSource {
    #[instrument(skip(self), fields(subject_id = %subject_id), err)]
    async fn project(&self, subject_id: SubjectId) -> Result<IndexDocument, ProjectionError> {
        let row = sqlx::query(PROGRAM_FOR_INDEX)
            .bind(subject_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| ProjectionError::Lookup(format!("load program {}: {}", subject_id, e)))?
            .ok_or(ProjectionError::NotFound(subject_id))?;

        ProgramRow::from_row(&row)
            .map(IndexDocument::from)
            .map_err(|e| ProjectionError::Lookup(format!("decode program {}: {}", subject_id, e)))
    }
}

// SQLx row types

#[derive(Debug)]
struct ProgramRow {
    id: uuid::Uuid,
    title: String,
    description: String,
    program_type: String,
    status: String,
    duration: Option<String>,
    published_at: Option<DateTime<Utc>>,
    category: Option<String>,
    language: Option<String>,
    thumbnail: String,
    video_url: String,
    created_at: DateTime<Utc>,
}

impl ProgramRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProgramRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            program_type: row.try_get("program_type")?,
            status: row.try_get("status")?,
            duration: row.try_get("duration")?,
            published_at: row.try_get("published_at")?,
            category: row.try_get("category")?,
            language: row.try_get("language")?,
            thumbnail: row.try_get("thumbnail")?,
            video_url: row.try_get("video_url")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl From<ProgramRow> for IndexDocument {
    fn from(row: ProgramRow) -> Self {
        IndexDocument {
            id: SubjectId::from_uuid(row.id),
            title: row.title,
            description: row.description,
            program_type: row.program_type,
            status: row.status,
            duration: row.duration,
            published_at: row.published_at.map(rfc3339),
            category: row.category,
            language: row.language,
            thumbnail: row.thumbnail,
            video_url: row.video_url,
            created_at: rfc3339(row.created_at),
        }
    }
}
