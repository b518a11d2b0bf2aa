//! # Data Model
//!
//! Plain data carried between the authenticator, the broker, the multipart
//! coordinator and the batch orchestrator. Wire-facing types serialize in the
//! broker's camelCase JSON shape.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation a grant is requested for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Delete,
    Get,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Delete => "delete",
            Operation::Get => "get",
        }
    }

    /// HTTP method a signed URL for this operation is valid for.
    pub fn method(&self) -> GrantMethod {
        match self {
            Operation::Upload => GrantMethod::Put,
            Operation::Delete => GrantMethod::Delete,
            Operation::Get => GrantMethod::Get,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "upload" | "put" => Ok(Operation::Upload),
            "delete" => Ok(Operation::Delete),
            "get" | "download" => Ok(Operation::Get),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum GrantMethod {
    Put,
    Delete,
    Get,
}

impl GrantMethod {
    pub fn as_http(&self) -> http::Method {
        match self {
            GrantMethod::Put => http::Method::PUT,
            GrantMethod::Delete => http::Method::DELETE,
            GrantMethod::Get => http::Method::GET,
        }
    }
}

/// Opaque credential material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Short-lived bearer credential returned by the session authority.
#[derive(Clone, Debug)]
pub struct SessionGrant {
    pub token: Secret,
    pub expires_at: DateTime<Utc>,
}

impl SessionGrant {
    /// True while the grant has more than `margin` of lifetime left at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

/// Time-limited, operation-scoped signed URL.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationGrant {
    pub signed_url: String,
    pub expires_at: DateTime<Utc>,
    pub method: GrantMethod,
}

impl OperationGrant {
    /// A grant past (or within `margin` of) its expiry must not start a new transfer.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Half-open byte range `[start, end)` of a part within its source object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one successful part transfer. Immutable once recorded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: u32,
    /// Storage backend's integrity token, kept byte-exact.
    pub etag: String,
    pub byte_range: ByteRange,
    /// Hex SHA-256 of the part's bytes.
    pub checksum: String,
}

/// Lifecycle of a multipart upload session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Created,
    PartsInProgress,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Created => "created",
            UploadState::PartsInProgress => "parts_in_progress",
            UploadState::Completing => "completing",
            UploadState::Completed => "completed",
            UploadState::Aborting => "aborting",
            UploadState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object in a batch request. Identity is `path`.
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub path: String,
    pub content_type: Option<String>,
    /// Bytes to store; unused for deletions.
    pub payload: Option<Bytes>,
}

impl BatchItem {
    pub fn upload(path: impl Into<String>, content_type: Option<String>, payload: Bytes) -> Self {
        Self {
            path: path.into(),
            content_type,
            payload: Some(payload),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_type: None,
            payload: None,
        }
    }
}

/// Per-item outcome. A failed entry always carries a non-empty `error`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub path: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    pub fn succeeded(path: impl Into<String>, signed_url: Option<String>) -> Self {
        Self {
            path: path.into(),
            success: true,
            signed_url,
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        };
        Self {
            path: path.into(),
            success: false,
            signed_url: None,
            error: Some(error),
        }
    }
}

/// One entry of a bucket listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SearchPage {
    pub items: Vec<ObjectSummary>,
    pub total: u64,
}
