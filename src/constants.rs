//! # Engine Constants
//!
//! This module defines constants shared by the upload coordinator, the batch
//! orchestrator and the broker client. Keeping them in one place keeps the
//! wire names and size limits consistent across the crate.
//!
//! ## Size Limits
//!
//! Part sizes follow the limits enforced by S3-compatible backends: every part
//! except the last must be at least 5 MiB, and one upload holds at most
//! 10,000 parts.
//!
//! ## Headers
//!
//! Header names used on the broker boundary and on direct transfers.

/// Reference chunk size used to partition files for the multipart path (5 MiB).
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Minimum size of every part but the last.
pub const MIN_PART_SIZE: u64 = CHUNK_SIZE;

/// Maximum size of a single part (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_PART_COUNT: u32 = 10_000;

/// Default lifetime requested for per-operation grants, in seconds.
pub const DEFAULT_GRANT_TTL_SECS: u64 = 900;

/// Longest grant lifetime a caller may request, in seconds.
pub const MAX_GRANT_TTL_SECS: u64 = 7 * 24 * 3600;

/// Lifetime assumed for a session grant when the authority does not report one.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 900;

/// Default per-call timeout, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Safety margin kept between a call's deadline and its grant's expiry.
pub const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 30;

/// Default number of parts transferred concurrently for one object.
pub const DEFAULT_PART_CONCURRENCY: usize = 4;

/// Default broker endpoint.
pub const DEFAULT_BROKER_URL: &str = "http://localhost:3000/api";

/// Default destination bucket.
pub const DEFAULT_BUCKET: &str = "media";

/// Content type used when a caller does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Header carrying the out-of-band admin secret.
pub const HEADER_ADMIN_SECRET: &str = "x-admin-password";

/// Header carrying the operation-scoped request id.
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Broker routes, relative to the broker base URL.
pub const ROUTE_SESSION: &str = "session";
pub const ROUTE_SEARCH: &str = "search";
pub const ROUTE_GET: &str = "get";
pub const ROUTE_PUT: &str = "put";
pub const ROUTE_DELETE: &str = "delete";
pub const ROUTE_BATCH: &str = "s3-batch";
pub const ROUTE_MULTIPART: &str = "s3-multipart";

/// Environment variables recognised by [`crate::config::Config::apply_env`].
pub const ENV_BROKER_URL: &str = "VAULT_BROKER_URL";
pub const ENV_BUCKET: &str = "VAULT_BUCKET";
pub const ENV_CHUNK_SIZE: &str = "VAULT_CHUNK_SIZE";
pub const ENV_CONCURRENCY_LIMIT: &str = "VAULT_CONCURRENCY_LIMIT";
