//! # Utility Functions
//!
//! Helpers shared by the coordinator, the orchestrator and the CLI.
//!
//! ## Core Utilities
//!
//! - **Chunk Planning**: Splits an object into numbered byte ranges
//! - **Object Key Generation**: Builds hierarchical storage keys for uploads
//! - **Unique Identifiers**: Generates request ids for log correlation
//! - **Public URLs**: Joins object keys onto a public base URL
//!
//! ## File Organization Strategy
//!
//! Generated keys group objects by content category and upload date:
//!
//! ```text
//! {prefix}/{category}/{YYYYMMDD}/{fileName}
//! ```

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::constants::{DEFAULT_CONTENT_TYPE, MAX_PART_COUNT};
use crate::errors::{AppError, AppResult};
use crate::models::ByteRange;

/// Splits `total_size` bytes into consecutive ranges of `chunk_size`.
///
/// The returned vector is indexed by `part_number - 1`; every range but the
/// last is exactly `chunk_size` long. A zero-length object has no parts.
///
/// # Errors
///
/// - `InvalidField` when `chunk_size` is zero
/// - `InvalidField` when the plan would exceed the backend's part limit
///
/// # Example
///
/// ```
/// use media_vault_uploads::utils::plan_parts;
///
/// let mib = 1024 * 1024;
/// let parts = plan_parts(12 * mib, 5 * mib).unwrap();
/// assert_eq!(parts.len(), 3);
/// assert_eq!(parts[2].len(), 2 * mib);
/// ```
pub fn plan_parts(total_size: u64, chunk_size: u64) -> AppResult<Vec<ByteRange>> {
    if chunk_size == 0 {
        return Err(AppError::InvalidField {
            field: "chunk_size".to_string(),
            reason: "must be positive".to_string(),
        });
    }

    let count = total_size.div_ceil(chunk_size);
    if count > MAX_PART_COUNT as u64 {
        return Err(AppError::InvalidField {
            field: "chunk_size".to_string(),
            reason: format!(
                "{} bytes in {}-byte parts needs {} parts, limit is {}",
                total_size, chunk_size, count, MAX_PART_COUNT
            ),
        });
    }

    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0;
    while start < total_size {
        let end = (start + chunk_size).min(total_size);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }
    Ok(ranges)
}

/// Hex SHA-256 digest of a part's bytes.
pub fn part_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Generates a storage key from an optional prefix and a file name.
///
/// # Path Structure
///
/// ```text
/// {prefix}/{category}/{date}/{fileName}
/// ```
///
/// # Content Categories
///
/// - `image/`, `video/`, `audio/` by MIME family
/// - `document/` for text and JSON
/// - `other/` for everything else
pub fn generate_object_key(prefix: Option<&str>, file_name: &str, content_type: &str) -> String {
    let file_name_safe = sanitize_filename(file_name);
    let category = categorize_content_type(content_type);
    let date = Utc::now().format("%Y%m%d").to_string();

    let prefix: Vec<String> = prefix
        .unwrap_or_default()
        .split('/')
        .map(sanitize_path_component)
        .filter(|c| !c.is_empty())
        .collect();

    if prefix.is_empty() {
        format!("{}/{}/{}", category, date, file_name_safe)
    } else {
        format!("{}/{}/{}/{}", prefix.join("/"), category, date, file_name_safe)
    }
}

/// Sanitizes a path component to prevent security issues.
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(50)
        .collect::<String>()
        .to_lowercase()
}

/// Removes path separators and reserved characters, keeping the extension.
fn sanitize_filename(filename: &str) -> String {
    let safe_chars: String = filename
        .trim()
        .chars()
        .filter(|c| !"/\\:*?\"<>|".contains(*c))
        .take(255)
        .collect();

    if safe_chars.is_empty() || safe_chars.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        safe_chars
    }
}

fn categorize_content_type(content_type: &str) -> &'static str {
    let content_type = content_type.to_lowercase();

    if content_type.starts_with("image/") {
        "image"
    } else if content_type.starts_with("video/") {
        "video"
    } else if content_type.starts_with("audio/") {
        "audio"
    } else if content_type.starts_with("text/") || content_type.contains("json") {
        "document"
    } else {
        "other"
    }
}

/// Best-effort MIME type from a file extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "json" => "application/json",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Generates a unique, time-sortable identifier for log correlation.
///
/// Format: `{timestampMillis}-{uuidV4}`
pub fn generate_request_id() -> String {
    let uuid_part = Uuid::new_v4().to_string();
    let timestamp = Utc::now().timestamp_millis();
    format!("{}-{}", timestamp, uuid_part)
}

/// Joins an object key onto a public base URL, percent-encoding each segment.
pub fn public_url(base: &str, key: &str) -> AppResult<String> {
    let mut url = url::Url::parse(base).map_err(|e| AppError::InvalidField {
        field: "public_base_url".to_string(),
        reason: e.to_string(),
    })?;
    url.path_segments_mut()
        .map_err(|_| AppError::InvalidField {
            field: "public_base_url".to_string(),
            reason: "cannot be a base URL".to_string(),
        })?
        .pop_if_empty()
        .extend(key.split('/'));
    Ok(url.to_string())
}

/// Drops the query string of a signed URL so it can be logged.
pub fn redact_signed_url(signed_url: &str) -> String {
    match signed_url.split_once('?') {
        Some((base, _)) => format!("{}?<redacted>", base),
        None => signed_url.to_string(),
    }
}
