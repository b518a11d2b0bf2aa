//! # Multipart Upload Coordinator
//!
//! Drives one object through the backend's multipart protocol.
//!
//! ## Upload Lifecycle
//!
//! ```text
//! begin_upload    → Created
//! upload_part     → PartsInProgress   (repeatable, any order, concurrent)
//! complete_upload → Completing → Completed
//! abort_upload    → Aborting   → Aborted   (from any non-terminal state)
//! ```
//!
//! ## Part Records
//!
//! Parts are keyed by part number. A retried part replaces the earlier record
//! for the same number, so completion always submits one record per number in
//! strictly increasing order. Completion is refused locally unless the
//! recorded numbers form the contiguous run `1..=N`.
//!
//! ## Retries
//!
//! Transient part failures are retried with backoff under the configured
//! [`RetryPolicy`](crate::retry::RetryPolicy). Every attempt signs a fresh
//! part URL; a signed URL is never reused after a failed transfer.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{transfer_deadline, within};
use crate::broker::{CompletedPart, MultipartBackend, MultipartTarget};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::log_data;
use crate::logging::Logger;
use crate::middleware::ValidationMiddleware;
use crate::models::{ByteRange, PartRecord, UploadState};
use crate::progress::ProgressTracker;
use crate::session::SessionContext;
use crate::transport::ObjectTransport;
use crate::utils::{guess_content_type, part_checksum, plan_parts, public_url};

/// One in-flight multipart upload.
///
/// Owned by the caller between [`MultipartCoordinator::begin_upload`] and the
/// terminal `complete_upload` / `abort_upload` call. The part set is guarded
/// by a mutex so parts may finish concurrently.
#[derive(Debug)]
pub struct UploadSession {
    target: MultipartTarget,
    content_type: String,
    logger: Logger,
    progress: ProgressTracker,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    state: UploadState,
    parts: BTreeMap<u32, PartRecord>,
    expected_parts: Option<u32>,
}

impl UploadSession {
    fn new(target: MultipartTarget, content_type: String, logger: Logger) -> Self {
        Self {
            target,
            content_type,
            logger,
            progress: ProgressTracker::new("parts", 0),
            inner: Mutex::new(SessionInner {
                state: UploadState::Created,
                parts: BTreeMap::new(),
                expected_parts: None,
            }),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.target.upload_id
    }

    pub fn key(&self) -> &str {
        &self.target.key
    }

    pub fn bucket(&self) -> &str {
        &self.target.bucket
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn state(&self) -> UploadState {
        self.inner.lock().state
    }

    /// Recorded parts in increasing part-number order.
    pub fn parts(&self) -> Vec<PartRecord> {
        self.inner.lock().parts.values().cloned().collect()
    }

    pub fn part(&self, part_number: u32) -> Option<PartRecord> {
        self.inner.lock().parts.get(&part_number).cloned()
    }

    pub fn expected_parts(&self) -> Option<u32> {
        self.inner.lock().expected_parts
    }

    /// Declares how many parts the object has. Completion then also requires
    /// every one of them.
    pub fn set_expected_parts(&self, count: u32) -> AppResult<()> {
        ValidationMiddleware::validate_part_number(count)?;
        self.inner.lock().expected_parts = Some(count);
        self.progress.set_total(count as u64);
        Ok(())
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn request_id(&self) -> &str {
        self.logger.request_id()
    }

    fn invalid(&self, state: UploadState, action: &str) -> AppError {
        AppError::InvalidState {
            state: state.to_string(),
            action: action.to_string(),
        }
    }
}

/// Where the bytes of a whole-object upload come from.
enum PartSource {
    Memory(Bytes),
    File(PathBuf),
}

impl PartSource {
    async fn read(&self, range: ByteRange) -> AppResult<Bytes> {
        match self {
            PartSource::Memory(data) => Ok(data.slice(range.start as usize..range.end as usize)),
            PartSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; range.len() as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Runs multipart uploads against a [`MultipartBackend`], moving part bytes
/// directly to storage through an [`ObjectTransport`].
pub struct MultipartCoordinator<B: ?Sized, T: ?Sized> {
    backend: Arc<B>,
    transport: Arc<T>,
    config: Config,
}

impl<B, T> MultipartCoordinator<B, T>
where
    B: MultipartBackend + ?Sized,
    T: ObjectTransport + ?Sized,
{
    pub fn new(backend: Arc<B>, transport: Arc<T>, config: Config) -> Self {
        Self {
            backend,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a multipart upload for `key` in the configured bucket.
    ///
    /// The backend's create primitive is called exactly once; a rejection is
    /// returned as-is and never retried.
    ///
    /// # Errors
    ///
    /// - `InvalidField` if the key or content type is malformed
    /// - `Unauthorized` / `Unavailable` from session setup
    /// - `Broker` if the backend rejects the key or content type
    pub async fn begin_upload(
        &self,
        ctx: &SessionContext,
        key: &str,
        content_type: &str,
    ) -> AppResult<UploadSession> {
        ValidationMiddleware::validate_object_key(key)?;
        ValidationMiddleware::validate_content_type(content_type)?;

        let credentials = ctx.session_credentials().await?;
        let upload_id = within(
            self.config.request_timeout(),
            self.backend
                .create_multipart(&credentials, &self.config.bucket, key, content_type),
        )
        .await?;

        let session = UploadSession::new(
            MultipartTarget {
                bucket: self.config.bucket.clone(),
                key: key.to_string(),
                upload_id,
            },
            content_type.to_string(),
            Logger::generate(),
        );
        session.logger.info(
            "Multipart upload initiated",
            log_data!("key" => key, "uploadId" => session.upload_id()),
        );
        Ok(session)
    }

    /// Transfers one part and records it on the session.
    ///
    /// The byte range is derived from the part number and the configured
    /// chunk size. Recording replaces any earlier record for `part_number`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the session is completing or terminal
    /// - `RetriesExhausted` if every attempt failed transiently
    /// - `PartUploadFailed` on the first non-transient failure
    pub async fn upload_part(
        &self,
        ctx: &SessionContext,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> AppResult<PartRecord> {
        ValidationMiddleware::validate_part_number(part_number)?;
        {
            let mut inner = session.inner.lock();
            if let Some(expected) = inner.expected_parts {
                if part_number > expected {
                    return Err(AppError::InvalidField {
                        field: "partNumber".to_string(),
                        reason: format!("upload has only {} parts", expected),
                    });
                }
            }
            let state = inner.state;
            match state {
                UploadState::Created | UploadState::PartsInProgress => {
                    inner.state = UploadState::PartsInProgress;
                }
                state => return Err(session.invalid(state, "upload a part to")),
            }
        }

        let start = (part_number as u64 - 1) * self.config.chunk_size;
        let byte_range = ByteRange::new(start, start + body.len() as u64);
        let checksum = part_checksum(&body);

        let outcome = self
            .config
            .retry
            .run(move |attempt| {
                let body = body.clone();
                async move { self.attempt_part(ctx, session, part_number, attempt, body).await }
            })
            .await;

        let etag = match outcome {
            Ok(etag) => etag,
            Err(failure) => {
                session.logger.warn(
                    "Part upload failed",
                    log_data!(
                        "partNumber" => part_number,
                        "attempts" => failure.attempts,
                        "error" => failure.error.to_string(),
                    ),
                );
                return Err(if failure.exhausted {
                    AppError::RetriesExhausted {
                        part_number,
                        attempts: failure.attempts,
                        cause: Box::new(failure.error),
                    }
                } else {
                    AppError::part_failed(part_number, failure.error)
                });
            }
        };

        let record = PartRecord {
            part_number,
            etag,
            byte_range,
            checksum,
        };

        let (replaced, open_ended_count) = {
            let mut inner = session.inner.lock();
            if inner.state != UploadState::PartsInProgress {
                return Err(session.invalid(inner.state, "record a part on"));
            }
            let replaced = inner.parts.insert(part_number, record.clone()).is_some();
            let open_ended_count = match inner.expected_parts {
                Some(_) => None,
                None => Some(inner.parts.len() as u64),
            };
            (replaced, open_ended_count)
        };

        if replaced {
            session.logger.debug(
                "Part re-uploaded, previous record replaced",
                log_data!("partNumber" => part_number),
            );
        } else {
            // Without a declared part count the total tracks what has been recorded.
            if let Some(recorded) = open_ended_count {
                session.progress.grow_total(recorded);
            }
            session.progress.record_success();
        }
        Ok(record)
    }

    async fn attempt_part(
        &self,
        ctx: &SessionContext,
        session: &UploadSession,
        part_number: u32,
        attempt: u32,
        body: Bytes,
    ) -> AppResult<String> {
        if attempt > 1 {
            tracing::info!(
                request_id = %session.request_id(),
                part_number,
                attempt,
                "retrying part upload"
            );
        }

        let credentials = ctx.session_credentials().await?;
        let grant = within(
            self.config.request_timeout(),
            self.backend.sign_part(
                &credentials,
                &session.target,
                part_number,
                self.config.grant_ttl_secs,
            ),
        )
        .await?;

        let deadline = transfer_deadline(
            &grant,
            ctx.now(),
            self.config.expiry_margin(),
            self.config.request_timeout(),
        )?;

        let etag = within(deadline, self.transport.put(&grant, None, body)).await?;
        etag.filter(|etag| !etag.is_empty()).ok_or_else(|| {
            AppError::Broker(format!("storage returned no ETag for part {}", part_number))
        })
    }

    /// Finalizes the upload and returns the object's URL.
    ///
    /// # Errors
    ///
    /// - `CompletionFailed` if no parts are recorded, the recorded numbers are
    ///   not contiguous from 1, fewer parts than expected are recorded, or the
    ///   backend rejects the part list. The session stays open so the caller
    ///   can retry completion or abort.
    /// - `InvalidState` if the session is already completing or terminal
    pub async fn complete_upload(
        &self,
        ctx: &SessionContext,
        session: &UploadSession,
    ) -> AppResult<String> {
        let parts: Vec<CompletedPart> = {
            let mut inner = session.inner.lock();
            let state = inner.state;
            match state {
                UploadState::PartsInProgress => {}
                UploadState::Created => {
                    return Err(AppError::CompletionFailed(
                        "no parts have been uploaded".to_string(),
                    ))
                }
                state => return Err(session.invalid(state, "complete")),
            }
            check_coverage(&inner.parts, inner.expected_parts)?;
            inner.state = UploadState::Completing;
            inner
                .parts
                .values()
                .map(|part| CompletedPart {
                    part_number: part.part_number,
                    etag: part.etag.clone(),
                })
                .collect()
        };
        session.progress.set_status("completing");

        let credentials = match ctx.session_credentials().await {
            Ok(credentials) => credentials,
            Err(e) => {
                self.reopen(session);
                return Err(e);
            }
        };

        let result = within(
            self.config.request_timeout(),
            self.backend
                .complete_multipart(&credentials, &session.target, &parts),
        )
        .await;

        match result {
            Ok(location) => {
                {
                    let mut inner = session.inner.lock();
                    inner.state = UploadState::Completed;
                    inner.parts.clear();
                }
                session.progress.set_status("completed");
                session.logger.info(
                    "Multipart upload completed",
                    log_data!("key" => session.key(), "parts" => parts.len()),
                );
                Ok(self.object_url(session, location))
            }
            Err(e) => {
                self.reopen(session);
                session.logger.error(
                    "Multipart completion rejected",
                    log_data!("key" => session.key(), "error" => e.to_string()),
                );
                Err(AppError::CompletionFailed(e.to_string()))
            }
        }
    }

    fn reopen(&self, session: &UploadSession) {
        let mut inner = session.inner.lock();
        if inner.state == UploadState::Completing {
            inner.state = UploadState::PartsInProgress;
        }
    }

    fn object_url(&self, session: &UploadSession, location: Option<String>) -> String {
        if let Some(location) = location.filter(|l| !l.trim().is_empty()) {
            return location;
        }
        let fallback = || format!("s3://{}/{}", session.bucket(), session.key());
        match &self.config.public_base_url {
            Some(base) => public_url(base, session.key()).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "public_base_url unusable, returning object address");
                fallback()
            }),
            None => fallback(),
        }
    }

    /// Releases everything the backend holds for this upload.
    ///
    /// The session ends `Aborted` even when the backend call fails; an
    /// `AbortFailed` error only reports that cleanup is left to the backend's
    /// own expiry of orphaned uploads. Aborting an aborted session is a no-op.
    pub async fn abort_upload(&self, ctx: &SessionContext, session: &UploadSession) -> AppResult<()> {
        {
            let mut inner = session.inner.lock();
            let state = inner.state;
            match state {
                UploadState::Aborted => return Ok(()),
                UploadState::Completed | UploadState::Aborting => {
                    return Err(session.invalid(state, "abort"))
                }
                _ => inner.state = UploadState::Aborting,
            }
        }
        session.progress.set_status("aborting");

        let result = async {
            let credentials = ctx.session_credentials().await?;
            within(
                self.config.request_timeout(),
                self.backend.abort_multipart(&credentials, &session.target),
            )
            .await
        }
        .await;

        {
            let mut inner = session.inner.lock();
            inner.state = UploadState::Aborted;
            inner.parts.clear();
        }
        session.progress.set_status("aborted");

        match result {
            Ok(()) => {
                session.logger.info(
                    "Multipart upload aborted",
                    log_data!("key" => session.key(), "uploadId" => session.upload_id()),
                );
                Ok(())
            }
            Err(e) => {
                session.logger.warn(
                    "Abort failed, backend will expire the upload",
                    log_data!("key" => session.key(), "error" => e.to_string()),
                );
                Err(AppError::AbortFailed(e.to_string()))
            }
        }
    }

    /// Uploads an in-memory object end to end and returns its URL.
    pub async fn upload_bytes(
        &self,
        ctx: &SessionContext,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> AppResult<String> {
        let session = self.begin_upload(ctx, key, content_type).await?;
        let total = data.len() as u64;
        self.transfer(ctx, &session, PartSource::Memory(data), total).await
    }

    /// Uploads a file end to end, reading one part at a time.
    ///
    /// The content type is guessed from the file name when not given.
    pub async fn upload_file(
        &self,
        ctx: &SessionContext,
        path: &Path,
        key: &str,
        content_type: Option<&str>,
    ) -> AppResult<String> {
        let session = self.begin_file(ctx, path, key, content_type).await?;
        self.finish_file(ctx, &session, path).await
    }

    /// Begins an upload for a file without transferring it, so a caller can
    /// subscribe to the session's progress before calling
    /// [`MultipartCoordinator::finish_file`].
    pub async fn begin_file(
        &self,
        ctx: &SessionContext,
        path: &Path,
        key: &str,
        content_type: Option<&str>,
    ) -> AppResult<UploadSession> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let content_type = content_type.unwrap_or_else(|| guess_content_type(file_name));
        // Unreadable files fail before the backend has anything to clean up.
        let size = tokio::fs::metadata(path).await?.len();

        let session = self.begin_upload(ctx, key, content_type).await?;
        if let Ok(plan) = plan_parts(size, self.config.chunk_size) {
            if !plan.is_empty() {
                if let Err(e) = session.set_expected_parts(plan.len() as u32) {
                    self.abort_quietly(ctx, &session).await;
                    return Err(e);
                }
            }
        }
        Ok(session)
    }

    pub async fn finish_file(
        &self,
        ctx: &SessionContext,
        session: &UploadSession,
        path: &Path,
    ) -> AppResult<String> {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                self.abort_quietly(ctx, session).await;
                return Err(e.into());
            }
        };
        self.transfer(ctx, session, PartSource::File(path.to_path_buf()), size)
            .await
    }

    /// Uploads every planned part, then completes. Any permanent part failure
    /// or completion rejection aborts the upload before the error is returned.
    async fn transfer(
        &self,
        ctx: &SessionContext,
        session: &UploadSession,
        source: PartSource,
        total_size: u64,
    ) -> AppResult<String> {
        let plan = match plan_parts(total_size, self.config.chunk_size) {
            Ok(plan) if !plan.is_empty() => plan,
            Ok(_) => {
                self.abort_quietly(ctx, session).await;
                return Err(AppError::InvalidField {
                    field: "size".to_string(),
                    reason: "a multipart upload needs at least one byte".to_string(),
                });
            }
            Err(e) => {
                self.abort_quietly(ctx, session).await;
                return Err(e);
            }
        };
        session.set_expected_parts(plan.len() as u32)?;

        session.logger.info(
            "Uploading parts",
            log_data!(
                "key" => session.key(),
                "size" => total_size,
                "parts" => plan.len(),
                "concurrency" => self.config.part_concurrency,
            ),
        );

        let source = &source;
        let uploaded: AppResult<Vec<PartRecord>> = stream::iter(plan.into_iter().enumerate())
            .map(|(index, range)| async move {
                let body = source.read(range).await?;
                self.upload_part(ctx, session, index as u32 + 1, body).await
            })
            .buffer_unordered(self.config.part_concurrency.max(1))
            .try_collect()
            .await;

        if let Err(e) = uploaded {
            self.abort_quietly(ctx, session).await;
            return Err(e);
        }

        match self.complete_upload(ctx, session).await {
            Ok(url) => Ok(url),
            Err(e) => {
                self.abort_quietly(ctx, session).await;
                Err(e)
            }
        }
    }

    async fn abort_quietly(&self, ctx: &SessionContext, session: &UploadSession) {
        // AbortFailed is already logged by abort_upload.
        let _ = self.abort_upload(ctx, session).await;
    }
}

fn check_coverage(parts: &BTreeMap<u32, PartRecord>, expected: Option<u32>) -> AppResult<()> {
    let count = parts.len() as u32;
    let last = match parts.keys().next_back() {
        Some(&last) => last,
        None => {
            return Err(AppError::CompletionFailed(
                "no parts have been recorded".to_string(),
            ))
        }
    };

    if last != count {
        let gap = (1..=last).find(|n| !parts.contains_key(n)).unwrap_or(last);
        return Err(AppError::CompletionFailed(format!(
            "part {} is missing; recorded parts must run 1..={}",
            gap, last
        )));
    }
    if let Some(expected) = expected {
        if count != expected {
            return Err(AppError::CompletionFailed(format!(
                "only {} of {} parts recorded",
                count, expected
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(part_number: u32) -> PartRecord {
        PartRecord {
            part_number,
            etag: format!("\"etag-{}\"", part_number),
            byte_range: ByteRange::new(0, 1),
            checksum: String::new(),
        }
    }

    fn parts(numbers: &[u32]) -> BTreeMap<u32, PartRecord> {
        numbers.iter().map(|&n| (n, record(n))).collect()
    }

    #[test]
    fn coverage_requires_parts() {
        let err = check_coverage(&BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, AppError::CompletionFailed(_)));
    }

    #[test]
    fn coverage_detects_gaps() {
        let err = check_coverage(&parts(&[1, 2, 4]), None).unwrap_err();
        assert!(err.to_string().contains("part 3 is missing"));
        assert!(check_coverage(&parts(&[1, 2, 3]), None).is_ok());
    }

    #[test]
    fn coverage_checks_expected_count() {
        let err = check_coverage(&parts(&[1, 2]), Some(3)).unwrap_err();
        assert!(matches!(err, AppError::CompletionFailed(ref m) if m.contains("2 of 3")));
        assert!(check_coverage(&parts(&[1, 2, 3]), Some(3)).is_ok());
    }
}
