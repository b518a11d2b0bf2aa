//! # Direct Transfers
//!
//! Executes signed URLs against the storage backend. The broker is never on
//! this path: bytes go straight from the client to storage.
//!
//! A direct PUT carries only `Content-Type`. The backend's `ETag` is returned
//! exactly as received, quotes included.
//!
//! A signed DELETE succeeds whether or not the key exists, so callers that
//! must report missing objects ask [`ObjectTransport::exists`] first. It reads
//! a single byte under a GET grant.

use async_trait::async_trait;
use bytes::Bytes;

use crate::broker::{ensure_method, wire};
use crate::errors::{AppError, AppResult};
use crate::models::{GrantMethod, OperationGrant};

/// Moves bytes to and from storage using operation grants.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Uploads `body` under a PUT grant and returns the backend `ETag`, if any.
    async fn put(
        &self,
        grant: &OperationGrant,
        content_type: Option<&str>,
        body: Bytes,
    ) -> AppResult<Option<String>>;

    /// Deletes the object a DELETE grant points at. Absent keys are not an
    /// error.
    async fn delete(&self, grant: &OperationGrant) -> AppResult<()>;

    /// Reports whether the object a GET grant points at exists.
    async fn exists(&self, grant: &OperationGrant) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectTransport for HttpTransport {
    async fn put(
        &self,
        grant: &OperationGrant,
        content_type: Option<&str>,
        body: Bytes,
    ) -> AppResult<Option<String>> {
        ensure_method(grant, GrantMethod::Put)?;

        let mut request = self.client.put(&grant.signed_url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(http::header::CONTENT_TYPE, content_type);
        }

        let response = wire::send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_status(status, &body));
        }

        Ok(response
            .headers()
            .get(http::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }

    async fn delete(&self, grant: &OperationGrant) -> AppResult<()> {
        ensure_method(grant, GrantMethod::Delete)?;

        let response = wire::send(self.client.delete(&grant.signed_url)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::from_status(status, &body))
    }

    async fn exists(&self, grant: &OperationGrant) -> AppResult<bool> {
        ensure_method(grant, GrantMethod::Get)?;

        let request = self
            .client
            .get(&grant.signed_url)
            .header(http::header::RANGE, "bytes=0-0");
        let response = wire::send(request).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            // Zero-length objects cannot satisfy a one-byte range.
            http::StatusCode::RANGE_NOT_SATISFIABLE => Ok(true),
            http::StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::from_status(status, &body))
            }
        }
    }
}
