//! # Upload Engine
//!
//! The two drivers built on top of the session authenticator, the broker and
//! the direct transport:
//!
//! - [`multipart::MultipartCoordinator`]: one large object, begin → parts →
//!   complete / abort
//! - [`batch::BatchOrchestrator`]: many independent objects, uploaded or
//!   deleted with bounded fan-out
//!
//! Every network call made by either driver runs under a deadline. For a
//! direct transfer the deadline also stays clear of the grant's expiry so a
//! signed URL is never presented after it lapses.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::OperationGrant;

pub mod batch;
pub mod multipart;

pub use self::batch::BatchOrchestrator;
pub use self::multipart::{MultipartCoordinator, UploadSession};

/// Time a transfer may take under `grant`: the lifetime left after `margin`,
/// capped at `cap`.
///
/// # Errors
///
/// - `GrantExpired` if the grant has no usable lifetime left at `now`
pub(crate) fn transfer_deadline(
    grant: &OperationGrant,
    now: DateTime<Utc>,
    margin: chrono::Duration,
    cap: Duration,
) -> AppResult<Duration> {
    let expired = || AppError::GrantExpired {
        expires_at: grant.expires_at,
    };
    if !grant.is_usable_at(now, margin) {
        return Err(expired());
    }
    let usable = (grant.remaining(now) - margin)
        .to_std()
        .map_err(|_| expired())?;
    Ok(usable.min(cap))
}

/// Runs `call`, failing with `Timeout` once `limit` elapses.
pub(crate) async fn within<T, F>(limit: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| AppError::Timeout(limit))?
}
