//! # Presigned-Operation Broker
//!
//! Obtains time-limited, operation-scoped signed URLs from the trusted storage
//! broker. The broker is stateless: every call carries the session
//! credentials, no grant is cached between calls, and nothing is retried
//! here. Retry policy belongs to the caller.
//!
//! ## Seams
//!
//! - [`GrantBroker`]: single grants, combined batch signing, native batch
//!   delete and listing
//! - [`MultipartBackend`]: the create / sign-part / complete / abort
//!   primitives of a multipart upload
//!
//! [`http::HttpBroker`] implements both against the broker's HTTP routes.
//! Responses are decoded once, at the boundary, into [`BrokerReply`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{AppError, AppResult};
use crate::middleware::ValidationMiddleware;
use crate::models::{GrantMethod, Operation, OperationGrant, SearchPage};
use crate::session::SessionCredentials;

pub mod http;
pub mod wire;

pub use self::http::HttpBroker;
pub use self::wire::CompletedPart;

/// Options attached to one grant request.
#[derive(Clone, Debug, PartialEq)]
pub struct GrantOptions {
    /// Requested lifetime; must be positive.
    pub expires_in_secs: u64,
    pub content_type: Option<String>,
}

/// What a caller asks the broker to sign.
#[derive(Clone, Debug, PartialEq)]
pub struct GrantRequest {
    pub operation: Operation,
    pub bucket: String,
    pub key: String,
    pub options: GrantOptions,
}

impl GrantRequest {
    pub fn new(
        operation: Operation,
        bucket: impl Into<String>,
        key: impl Into<String>,
        expires_in_secs: u64,
    ) -> Self {
        Self {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            options: GrantOptions {
                expires_in_secs,
                content_type: None,
            },
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.options.content_type = content_type;
        self
    }

    /// Rejects malformed keys, lifetimes and content types before any call.
    pub fn validate(&self) -> AppResult<()> {
        let as_broker_error = |e: AppError| AppError::Broker(e.to_string());

        if self.bucket.trim().is_empty() {
            return Err(AppError::Broker("bucket must not be empty".into()));
        }
        ValidationMiddleware::validate_object_key(&self.key).map_err(as_broker_error)?;
        ValidationMiddleware::validate_expires_in(self.options.expires_in_secs)
            .map_err(as_broker_error)?;
        if let Some(content_type) = &self.options.content_type {
            if self.operation != Operation::Upload {
                return Err(AppError::Broker(format!(
                    "content type only applies to uploads, not {}",
                    self.operation
                )));
            }
            ValidationMiddleware::validate_content_type(content_type).map_err(as_broker_error)?;
        }
        Ok(())
    }
}

/// One path to sign in a combined batch round-trip.
#[derive(Clone, Debug)]
pub struct BatchSignItem {
    pub path: String,
    pub content_type: Option<String>,
}

/// Per-path outcome of a combined signing call.
#[derive(Clone, Debug)]
pub struct BatchGrant {
    pub path: String,
    pub grant: Result<OperationGrant, String>,
}

/// Per-path outcome of a native batch delete.
#[derive(Clone, Debug)]
pub struct BatchDeletion {
    pub path: String,
    pub outcome: Result<(), String>,
}

/// Decoded reply to a single grant request.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerReply {
    UploadGrant(OperationGrant),
    DeleteGrant(OperationGrant),
    DownloadGrant(OperationGrant),
    Rejected {
        status: Option<u16>,
        message: String,
    },
}

impl BrokerReply {
    /// Decodes a raw broker response for `operation`.
    ///
    /// # Arguments
    ///
    /// * `operation` - The operation that was requested
    /// * `status` - HTTP status of the broker response
    /// * `body` - Raw response body
    /// * `fallback_expiry` - Expiry assumed when the broker omits `expiresAt`
    pub fn decode(
        operation: Operation,
        status: ::http::StatusCode,
        body: &str,
        fallback_expiry: DateTime<Utc>,
    ) -> Self {
        if !status.is_success() {
            return BrokerReply::Rejected {
                status: Some(status.as_u16()),
                message: wire::error_message(body),
            };
        }

        let parsed: wire::SignedUrlResponse = match wire::parse(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return BrokerReply::Rejected {
                    status: None,
                    message: e.to_string(),
                }
            }
        };

        if parsed.url.trim().is_empty() || parsed.signed == Some(false) {
            return BrokerReply::Rejected {
                status: None,
                message: format!("broker returned no signed URL for {}", operation),
            };
        }

        let grant = OperationGrant {
            signed_url: parsed.url,
            expires_at: parsed.expires_at.unwrap_or(fallback_expiry),
            method: operation.method(),
        };

        match operation {
            Operation::Upload => BrokerReply::UploadGrant(grant),
            Operation::Delete => BrokerReply::DeleteGrant(grant),
            Operation::Get => BrokerReply::DownloadGrant(grant),
        }
    }

    pub fn into_grant(self) -> AppResult<OperationGrant> {
        match self {
            BrokerReply::UploadGrant(grant)
            | BrokerReply::DeleteGrant(grant)
            | BrokerReply::DownloadGrant(grant) => Ok(grant),
            BrokerReply::Rejected {
                status: Some(status),
                message,
            } => {
                let status = ::http::StatusCode::from_u16(status)
                    .unwrap_or(::http::StatusCode::BAD_GATEWAY);
                Err(AppError::from_status(status, &message))
            }
            BrokerReply::Rejected {
                status: None,
                message,
            } => Err(AppError::Broker(message)),
        }
    }
}

/// Signs single operations, batches, and lists objects.
#[async_trait]
pub trait GrantBroker: Send + Sync {
    async fn request_grant(
        &self,
        auth: &SessionCredentials,
        request: &GrantRequest,
    ) -> AppResult<OperationGrant>;

    /// Whether [`GrantBroker::sign_batch`] is available.
    fn supports_batch_signing(&self) -> bool {
        false
    }

    /// Signs every item in one round-trip. Results are matched by path.
    async fn sign_batch(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        _items: &[BatchSignItem],
        _expires_in_secs: u64,
    ) -> AppResult<Vec<BatchGrant>> {
        Err(AppError::Broker("batch signing is not supported".into()))
    }

    /// Whether [`GrantBroker::delete_batch`] is available.
    fn supports_native_batch_delete(&self) -> bool {
        false
    }

    /// Deletes every path in one backend-native call.
    async fn delete_batch(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        _paths: &[String],
    ) -> AppResult<Vec<BatchDeletion>> {
        Err(AppError::Broker("native batch delete is not supported".into()))
    }

    async fn search(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        prefix: &str,
    ) -> AppResult<SearchPage>;
}

/// Object a multipart upload is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartTarget {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Backend-native multipart primitives, addressed by
/// `(bucket, key, upload_id, part_number)`.
#[async_trait]
pub trait MultipartBackend: Send + Sync {
    /// Starts an upload and returns the backend's upload id.
    async fn create_multipart(
        &self,
        auth: &SessionCredentials,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> AppResult<String>;

    /// Signs a PUT for one part.
    async fn sign_part(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
        part_number: u32,
        expires_in_secs: u64,
    ) -> AppResult<OperationGrant>;

    /// Finalizes the upload. Returns the object's location when the backend
    /// reports one.
    async fn complete_multipart(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
        parts: &[CompletedPart],
    ) -> AppResult<Option<String>>;

    async fn abort_multipart(
        &self,
        auth: &SessionCredentials,
        target: &MultipartTarget,
    ) -> AppResult<()>;
}

/// Checks that a grant authorizes `method` before it is used.
pub fn ensure_method(grant: &OperationGrant, method: GrantMethod) -> AppResult<()> {
    if grant.method != method {
        return Err(AppError::Broker(format!(
            "grant authorizes {:?}, not {:?}",
            grant.method, method
        )));
    }
    Ok(())
}
