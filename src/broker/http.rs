//! HTTP implementation of the broker boundary.
//!
//! ```text
//! PUT    /put           → signed PUT URL
//! GET    /get           → signed GET URL
//! DELETE /delete        → signed DELETE URL
//! POST   /search        → object listing
//! POST   /s3-batch      → combined signing / native batch delete
//! POST   /s3-multipart  → create / sign-part / complete / abort
//! ```

use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use super::wire::{
    self, BatchItemBody, BatchRequestBody, BatchResponse, CompleteMultipartResponse,
    CompletedPart, CreateMultipartResponse, MultipartRequestBody, PutGrantBody,
    SearchRequestBody, SearchResponse,
};
use super::{
    BatchDeletion, BatchGrant, BatchSignItem, BrokerReply, GrantBroker, GrantRequest,
    MultipartBackend, MultipartTarget,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::constants::{
    HEADER_REQUEST_ID, ROUTE_BATCH, ROUTE_DELETE, ROUTE_GET, ROUTE_MULTIPART, ROUTE_PUT,
    ROUTE_SEARCH,
};
use crate::errors::{AppError, AppResult};
use crate::middleware::{AuthHeaders, ValidationMiddleware};
use crate::models::{Operation, OperationGrant, SearchPage};
use crate::session::SessionCredentials;
use crate::utils::generate_request_id;

/// Broker client over HTTP.
#[derive(Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    clock: Arc<dyn Clock>,
    batch_signing: bool,
    native_batch_delete: bool,
}

impl HttpBroker {
    pub fn new(client: reqwest::Client, config: &Config) -> AppResult<Self> {
        // Resolve once so a malformed base URL fails at construction.
        wire::route(&config.broker_url, ROUTE_PUT)?;
        Ok(Self {
            client,
            base_url: config.broker_url.clone(),
            clock: Arc::new(SystemClock),
            batch_signing: config.supports_batch_signing,
            native_batch_delete: config.supports_native_batch_delete,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn url(&self, route: &str) -> AppResult<url::Url> {
        wire::route(&self.base_url, route)
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        auth: &SessionCredentials,
    ) -> reqwest::RequestBuilder {
        AuthHeaders::apply(request, &auth.token, &auth.admin_secret)
            .header(HEADER_REQUEST_ID, generate_request_id())
    }

    async fn post_json<B, T>(&self, route: &str, auth: &SessionCredentials, body: &B) -> AppResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let request = self.authorized(self.client.post(self.url(route)?), auth).json(body);
        let response = wire::send(request).await?;
        wire::decode(response).await
    }

    async fn post_multipart<T>(
        &self,
        auth: &SessionCredentials,
        body: &MultipartRequestBody<'_>,
    ) -> AppResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.post_json(ROUTE_MULTIPART, auth, body).await
    }
}

#[async_trait]
impl GrantBroker for HttpBroker {
    async fn request_grant(
        &self,
        auth: &SessionCredentials,
        request: &GrantRequest,
    ) -> AppResult<OperationGrant> {
        request.validate()?;
        let expires_in = request.options.expires_in_secs;

        let http_request = match request.operation {
            Operation::Upload => {
                let body = PutGrantBody {
                    bucket: &request.bucket,
                    key: &request.key,
                    content_type: request.options.content_type.as_deref(),
                    expires_in,
                };
                self.client.put(self.url(ROUTE_PUT)?).json(&body)
            }
            Operation::Get | Operation::Delete => {
                let route = if request.operation == Operation::Get {
                    ROUTE_GET
                } else {
                    ROUTE_DELETE
                };
                let mut url = self.url(route)?;
                url.query_pairs_mut()
                    .append_pair("bucket", &request.bucket)
                    .append_pair("key", &request.key)
                    .append_pair("expiresIn", &expires_in.to_string());
                if request.operation == Operation::Get {
                    self.client.get(url)
                } else {
                    self.client.delete(url)
                }
            }
        };

        let requested_at = self.clock.now();
        let response = wire::send(self.authorized(http_request, auth)).await?;
        let (status, body) = wire::read(response).await?;
        let fallback_expiry = requested_at + Duration::seconds(expires_in as i64);

        let reply = BrokerReply::decode(request.operation, status, &body, fallback_expiry);
        if let BrokerReply::Rejected { ref message, .. } = reply {
            tracing::warn!(
                operation = %request.operation,
                key = %request.key,
                error = %message,
                "broker rejected grant request"
            );
        }
        reply.into_grant()
    }

    fn supports_batch_signing(&self) -> bool {
        self.batch_signing
    }

    async fn sign_batch(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        items: &[BatchSignItem],
        expires_in_secs: u64,
    ) -> AppResult<Vec<BatchGrant>> {
        ValidationMiddleware::validate_expires_in(expires_in_secs)
            .map_err(|e| AppError::Broker(e.to_string()))?;

        let body = BatchRequestBody {
            action: Operation::Upload.as_str(),
            bucket,
            items: items
                .iter()
                .map(|item| BatchItemBody {
                    path: &item.path,
                    content_type: item.content_type.as_deref(),
                })
                .collect(),
            expires_in: Some(expires_in_secs),
        };

        let requested_at = self.clock.now();
        let response: BatchResponse = self.post_json(ROUTE_BATCH, auth, &body).await?;
        let fallback_expiry = requested_at + Duration::seconds(expires_in_secs as i64);

        Ok(response
            .results
            .into_iter()
            .map(|result| {
                let grant = match (result.success, result.signed_url) {
                    (true, Some(url)) if !url.trim().is_empty() => Ok(OperationGrant {
                        signed_url: url,
                        expires_at: result.expires_at.unwrap_or(fallback_expiry),
                        method: Operation::Upload.method(),
                    }),
                    _ => Err(result
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "broker did not sign this path".to_string())),
                };
                BatchGrant {
                    path: result.path,
                    grant,
                }
            })
            .collect())
    }

    fn supports_native_batch_delete(&self) -> bool {
        self.native_batch_delete
    }

    async fn delete_batch(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        paths: &[String],
    ) -> AppResult<Vec<BatchDeletion>> {
        let body = BatchRequestBody {
            action: Operation::Delete.as_str(),
            bucket,
            items: paths
                .iter()
                .map(|path| BatchItemBody {
                    path,
                    content_type: None,
                })
                .collect(),
            expires_in: None,
        };
        let response: BatchResponse = self.post_json(ROUTE_BATCH, auth, &body).await?;

        Ok(response
            .results
            .into_iter()
            .map(|result| BatchDeletion {
                outcome: if result.success {
                    Ok(())
                } else {
                    Err(result
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "delete failed".to_string()))
                },
                path: result.path,
            })
            .collect())
    }

    async fn search(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        prefix: &str,
    ) -> AppResult<SearchPage> {
        let body = SearchRequestBody { bucket, prefix };
        let response: SearchResponse = self.post_json(ROUTE_SEARCH, auth, &body).await?;
        let total = response.total.unwrap_or(response.items.len() as u64);
        Ok(SearchPage {
            items: response.items,
            total,
        })
    }
}

#[async_trait]
impl MultipartBackend for HttpBroker {
    async fn create_multipart(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> AppResult<String> {
        let response: CreateMultipartResponse = self
            .post_multipart(
                auth,
                &MultipartRequestBody::Create {
                    bucket,
                    key,
                    content_type,
                },
            )
            .await?;
        if response.upload_id.trim().is_empty() {
            return Err(AppError::Broker("backend returned an empty upload id".into()));
        }
        Ok(response.upload_id)
    }

    async fn sign_part(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
        part_number: u32,
        expires_in_secs: u64,
    ) -> AppResult<OperationGrant> {
        let requested_at = self.clock.now();
        let request = self.authorized(self.client.post(self.url(ROUTE_MULTIPART)?), auth).json(
            &MultipartRequestBody::SignPart {
                bucket: &target.bucket,
                key: &target.key,
                upload_id: &target.upload_id,
                part_number,
                expires_in: expires_in_secs,
            },
        );
        let (status, body) = wire::read(wire::send(request).await?).await?;
        let fallback_expiry = requested_at + Duration::seconds(expires_in_secs as i64);
        BrokerReply::decode(Operation::Upload, status, &body, fallback_expiry).into_grant()
    }

    async fn complete_multipart(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
        parts: &[CompletedPart],
    ) -> AppResult<Option<String>> {
        let response: CompleteMultipartResponse = self
            .post_multipart(
                auth,
                &MultipartRequestBody::Complete {
                    bucket: &target.bucket,
                    key: &target.key,
                    upload_id: &target.upload_id,
                    parts,
                },
            )
            .await?;
        Ok(response.url.or(response.location))
    }

    async fn abort_multipart(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
    ) -> AppResult<()> {
        let _: HashMap<String, serde_json::Value> = self
            .post_multipart(
                auth,
                &MultipartRequestBody::Abort {
                    bucket: &target.bucket,
                    key: &target.key,
                    upload_id: &target.upload_id,
                },
            )
            .await?;
        Ok(())
    }
}
