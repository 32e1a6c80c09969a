//! Meilisearch HTTP client.
//!
//! Writes are asynchronous on the engine side: a `202` only means the task
//! was enqueued. Every write therefore waits for its task to settle, so a
//! document the engine rejects later still surfaces as an error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, instrument};

use searchsync_core::SubjectId;

use super::{IndexClient, IndexSettings, SearchError};
use crate::jobs::types::IndexDocument;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueuedTask {
    task_uid: u64,
}

#[derive(Debug, Deserialize)]
struct TaskView {
    status: String,
    #[serde(default)]
    error: Option<TaskErrorView>,
}

#[derive(Debug, Deserialize)]
struct TaskErrorView {
    message: String,
}

/// Client for a single Meilisearch instance.
#[derive(Debug, Clone)]
pub struct MeilisearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    task_timeout: Duration,
    task_poll_interval: Duration,
}

impl MeilisearchClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url, api_key)
    }

    /// Reuse an existing reqwest client (timeouts, proxies, ...).
    pub fn with_http_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
        }
    }

    /// How long a write may stay enqueued/processing before it counts as failed.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check the engine answers `GET /health`.
    #[instrument(skip(self), fields(base_url = %self.base_url), err)]
    pub async fn health(&self) -> Result<(), SearchError> {
        let resp = self.send(self.request(Method::GET, "/health")).await?;
        expect_success(resp).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, SearchError> {
        req.send()
            .await
            .map_err(|e| SearchError::Http(e.to_string()))
    }

    /// Send a write and wait for the task it enqueued, if any.
    async fn write(&self, req: RequestBuilder) -> Result<(), SearchError> {
        let resp = self.send(req).await?;
        self.finish_write(resp).await
    }

    async fn finish_write(&self, resp: Response) -> Result<(), SearchError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(rejected(status, resp).await);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| SearchError::Http(e.to_string()))?;
        match serde_json::from_str::<EnqueuedTask>(&body) {
            Ok(task) => self.wait_for_task(task.task_uid).await,
            Err(_) => Ok(()),
        }
    }

    async fn wait_for_task(&self, task_uid: u64) -> Result<(), SearchError> {
        let deadline = Instant::now() + self.task_timeout;
        let path = format!("/tasks/{}", task_uid);

        loop {
            let resp = self.send(self.request(Method::GET, &path)).await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(rejected(status, resp).await);
            }
            let task: TaskView = resp
                .json()
                .await
                .map_err(|e| SearchError::Http(format!("task {}: {}", task_uid, e)))?;

            match task.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    let message = match task.error {
                        Some(error) => error.message,
                        None => task.status.clone(),
                    };
                    return Err(SearchError::TaskFailed { task_uid, message });
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(SearchError::Http(format!(
                    "task {} still {} after {:?}",
                    task_uid, task.status, self.task_timeout
                )));
            }
            debug!(task_uid, status = %task.status, "waiting for search task");
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }

    async fn put_setting<T: Serialize + ?Sized>(
        &self,
        index: &str,
        setting: &str,
        value: &T,
    ) -> Result<(), SearchError> {
        let path = format!("/indexes/{}/settings/{}", index, setting);
        self.write(self.request(Method::PUT, &path).json(value))
            .await
    }
}

async fn expect_success(resp: Response) -> Result<(), SearchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    Err(rejected(status, resp).await)
}

async fn rejected(status: StatusCode, resp: Response) -> SearchError {
    SearchError::Rejected {
        status: status.as_u16(),
        body: resp.text().await.unwrap_or_default(),
    }
}

#[async_trait]
impl IndexClient for MeilisearchClient {
    #[instrument(skip(self, settings), fields(index = %index), err)]
    async fn ensure_index(
        &self,
        index: &str,
        primary_key: &str,
        settings: &IndexSettings,
    ) -> Result<(), SearchError> {
        let resp = self
            .send(self.request(Method::GET, &format!("/indexes/{}", index)))
            .await?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                debug!(index = %index, "index missing, creating");
                self.write(
                    self.request(Method::POST, "/indexes")
                        .json(&json!({ "uid": index, "primaryKey": primary_key })),
                )
                .await?;
            }
            status => return Err(rejected(status, resp).await),
        }

        self.put_setting(index, "searchable-attributes", &settings.searchable)
            .await?;
        self.put_setting(index, "filterable-attributes", &settings.filterable)
            .await?;
        self.put_setting(index, "sortable-attributes", &settings.sortable)
            .await
    }

    #[instrument(skip(self, documents), fields(index = %index, count = documents.len()), err)]
    async fn add_documents(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<(), SearchError> {
        let path = format!("/indexes/{}/documents", index);
        self.write(
            self.request(Method::POST, &path)
                .query(&[("primaryKey", super::PRIMARY_KEY)])
                .json(documents),
        )
        .await
    }

    #[instrument(skip(self), fields(index = %index, document_id = %id), err)]
    async fn delete_document(&self, index: &str, id: SubjectId) -> Result<(), SearchError> {
        let path = format!("/indexes/{}/documents/{}", index, id);
        let resp = self.send(self.request(Method::DELETE, &path)).await?;

        // Missing index: nothing to delete.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        self.finish_write(resp).await
    }
}
