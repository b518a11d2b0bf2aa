//! # Batch Operation Orchestrator
//!
//! Uploads or deletes many independent objects and accounts for every one of
//! them. One item failing never stops the others, and the result list always
//! has exactly one entry per input item, in input order.
//!
//! ## Strategies
//!
//! - **Upload**: one combined signing round-trip when the broker supports it,
//!   otherwise one grant request per item; payloads then go straight to
//!   storage. If the combined call fails for any reason other than rejected
//!   credentials, the run falls back to per-item grants.
//! - **Delete**: one backend-native batch delete when available, otherwise a
//!   signed DELETE per key.
//! - **Get**: one signed download URL per item; nothing is transferred.
//!
//! Broker batch responses are matched back to inputs by path. Duplicate paths
//! are consumed in order, so each occurrence still gets its own result.
//!
//! ## Cancellation
//!
//! Cancelling a run's token stops new items from starting. Items already in
//! flight run to completion; items never started are reported as failed.

use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{transfer_deadline, within};
use crate::broker::{BatchSignItem, GrantBroker, GrantRequest};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::log_data;
use crate::logging::Logger;
use crate::models::{BatchItem, BatchResult, Operation, OperationGrant};
use crate::progress::ProgressTracker;
use crate::session::{SessionContext, SessionCredentials};
use crate::transport::ObjectTransport;
use crate::utils::{guess_content_type, redact_signed_url};

const CANCELLED: &str = "batch cancelled before this item started";

/// Per-run controls: fan-out bound, cancellation and progress.
#[derive(Clone, Debug)]
pub struct BatchRun {
    /// Maximum in-flight items. `None` starts every item at once.
    pub concurrency_limit: Option<usize>,
    pub cancel: CancellationToken,
    pub progress: Arc<ProgressTracker>,
}

impl BatchRun {
    pub fn new(concurrency_limit: Option<usize>) -> Self {
        Self {
            concurrency_limit,
            cancel: CancellationToken::new(),
            progress: Arc::new(ProgressTracker::new("items", 0)),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }
}

/// One unit of work: the item, its resolved content type and, when a
/// combined call already answered for it, the broker's outcome.
struct WorkItem {
    item: BatchItem,
    content_type: Option<String>,
    presigned: Option<Result<OperationGrant, String>>,
}

/// Drives batches through a [`GrantBroker`] and an [`ObjectTransport`].
pub struct BatchOrchestrator<Br: ?Sized, T: ?Sized> {
    broker: Arc<Br>,
    transport: Arc<T>,
    config: Config,
}

impl<Br, T> BatchOrchestrator<Br, T>
where
    Br: GrantBroker + ?Sized,
    T: ObjectTransport + ?Sized,
{
    pub fn new(broker: Arc<Br>, transport: Arc<T>, config: Config) -> Self {
        Self {
            broker,
            transport,
            config,
        }
    }

    /// Runs `operation` over `items` with at most `concurrency_limit` items
    /// in flight.
    ///
    /// # Returns
    ///
    /// One [`BatchResult`] per input item, in input order.
    ///
    /// # Errors
    ///
    /// Only whole-run failures: `Unauthorized` or `Unavailable` while
    /// establishing the session. Item failures are reported in the results.
    pub async fn run_batch(
        &self,
        ctx: &SessionContext,
        operation: Operation,
        items: Vec<BatchItem>,
        concurrency_limit: Option<usize>,
    ) -> AppResult<Vec<BatchResult>> {
        self.run(ctx, operation, items, &BatchRun::new(concurrency_limit))
            .await
    }

    /// [`BatchOrchestrator::run_batch`] with explicit cancellation and
    /// progress reporting.
    pub async fn run(
        &self,
        ctx: &SessionContext,
        operation: Operation,
        items: Vec<BatchItem>,
        run: &BatchRun,
    ) -> AppResult<Vec<BatchResult>> {
        run.progress.set_total(items.len() as u64);
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let logger = Logger::generate();
        let credentials = ctx.session_credentials().await?;
        logger.info(
            "Batch started",
            log_data!(
                "operation" => operation.as_str(),
                "items" => items.len(),
                "concurrencyLimit" => run.concurrency_limit,
            ),
        );

        let results = match operation {
            Operation::Delete if self.broker.supports_native_batch_delete() => {
                match self.delete_natively(&credentials, &items, run, &logger).await {
                    Some(results) => results?,
                    None => self.fan_out(ctx, operation, self.plain_work(items), run).await,
                }
            }
            Operation::Upload => {
                let work = self.upload_work(&credentials, items, &logger).await?;
                self.fan_out(ctx, operation, work, run).await
            }
            _ => self.fan_out(ctx, operation, self.plain_work(items), run).await,
        };

        let failed = results.iter().filter(|r| !r.success).count();
        logger.info(
            "Batch finished",
            log_data!(
                "operation" => operation.as_str(),
                "succeeded" => results.len() - failed,
                "failed" => failed,
            ),
        );
        Ok(results)
    }

    fn plain_work(&self, items: Vec<BatchItem>) -> Vec<WorkItem> {
        items
            .into_iter()
            .map(|item| WorkItem {
                item,
                content_type: None,
                presigned: None,
            })
            .collect()
    }

    /// Resolves content types and, when supported, signs every upload in one
    /// round-trip.
    async fn upload_work(
        &self,
        credentials: &SessionCredentials,
        items: Vec<BatchItem>,
        logger: &Logger,
    ) -> AppResult<Vec<WorkItem>> {
        let mut work: Vec<WorkItem> = items
            .into_iter()
            .map(|item| {
                let content_type = item
                    .content_type
                    .clone()
                    .unwrap_or_else(|| guess_content_type(&item.path).to_string());
                WorkItem {
                    item,
                    content_type: Some(content_type),
                    presigned: None,
                }
            })
            .collect();

        if !self.broker.supports_batch_signing() {
            return Ok(work);
        }

        let sign_items: Vec<BatchSignItem> = work
            .iter()
            .map(|w| BatchSignItem {
                path: w.item.path.clone(),
                content_type: w.content_type.clone(),
            })
            .collect();

        let signed = within(
            self.config.request_timeout(),
            self.broker.sign_batch(
                credentials,
                &self.config.bucket,
                &sign_items,
                self.config.grant_ttl_secs,
            ),
        )
        .await;

        match signed {
            Ok(grants) => {
                let mut by_path = queue_by_path(grants.into_iter().map(|g| (g.path, g.grant)));
                for w in work.iter_mut() {
                    w.presigned = by_path.get_mut(&w.item.path).and_then(VecDeque::pop_front);
                }
            }
            Err(e @ AppError::Unauthorized(_)) => return Err(e),
            Err(e) => {
                logger.warn(
                    "Combined signing failed, requesting grants per item",
                    log_data!("error" => e.to_string()),
                );
            }
        }
        Ok(work)
    }

    /// Deletes every path in one backend-native call. Returns `None` when the
    /// call failed in a way the per-key path may still handle.
    async fn delete_natively(
        &self,
        credentials: &SessionCredentials,
        items: &[BatchItem],
        run: &BatchRun,
        logger: &Logger,
    ) -> Option<AppResult<Vec<BatchResult>>> {
        if run.cancel.is_cancelled() {
            return Some(Ok(items
                .iter()
                .map(|item| {
                    run.progress.record_failure();
                    BatchResult::failed(item.path.clone(), CANCELLED)
                })
                .collect()));
        }

        let paths: Vec<String> = items.iter().map(|item| item.path.clone()).collect();
        let deleted = within(
            self.config.request_timeout(),
            self.broker
                .delete_batch(credentials, &self.config.bucket, &paths),
        )
        .await;

        let deletions = match deleted {
            Ok(deletions) => deletions,
            Err(e @ AppError::Unauthorized(_)) => return Some(Err(e)),
            Err(e) => {
                logger.warn(
                    "Native batch delete failed, deleting per key",
                    log_data!("error" => e.to_string()),
                );
                return None;
            }
        };

        let mut by_path = queue_by_path(deletions.into_iter().map(|d| (d.path, d.outcome)));
        let results = paths
            .into_iter()
            .map(|path| {
                let outcome = by_path.get_mut(&path).and_then(VecDeque::pop_front);
                let result = match outcome {
                    Some(Ok(())) => BatchResult::succeeded(path, None),
                    Some(Err(cause)) => BatchResult::failed(path, cause),
                    None => BatchResult::failed(path, "broker returned no result for this path"),
                };
                record(&run.progress, &result);
                result
            })
            .collect();
        Some(Ok(results))
    }

    /// Processes work items with bounded parallelism, returning results in
    /// input order.
    async fn fan_out(
        &self,
        ctx: &SessionContext,
        operation: Operation,
        work: Vec<WorkItem>,
        run: &BatchRun,
    ) -> Vec<BatchResult> {
        let limit = run.concurrency_limit.unwrap_or(work.len()).max(1);

        let mut indexed: Vec<(usize, BatchResult)> = stream::iter(work.into_iter().enumerate())
            .map(|(index, work)| async move {
                let path = work.item.path.clone();
                let result = if run.cancel.is_cancelled() {
                    BatchResult::failed(path, CANCELLED)
                } else {
                    match self.process(ctx, operation, work).await {
                        Ok(signed_url) => BatchResult::succeeded(path, signed_url),
                        Err(cause) => {
                            let failure = AppError::BatchItemFailed {
                                path: path.clone(),
                                cause: cause.to_string(),
                            };
                            tracing::warn!(error = %failure, "batch item failed");
                            BatchResult::failed(path, cause.to_string())
                        }
                    }
                };
                record(&run.progress, &result);
                (index, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    /// Runs one item. Returns the signed URL the item was served with, for
    /// uploads and downloads.
    async fn process(
        &self,
        ctx: &SessionContext,
        operation: Operation,
        work: WorkItem,
    ) -> AppResult<Option<String>> {
        let WorkItem {
            item,
            content_type,
            presigned,
        } = work;

        let grant = match presigned {
            Some(Err(cause)) => return Err(AppError::Broker(cause)),
            Some(Ok(grant)) if grant.is_usable_at(ctx.now(), self.config.expiry_margin()) => grant,
            Some(Ok(stale)) => {
                tracing::debug!(
                    path = %item.path,
                    expires_at = %stale.expires_at,
                    "presigned grant too close to expiry, requesting a fresh one"
                );
                self.fresh_grant(ctx, operation, &item.path, content_type.clone())
                    .await?
            }
            None => {
                self.fresh_grant(ctx, operation, &item.path, content_type.clone())
                    .await?
            }
        };

        match operation {
            Operation::Upload => {
                let payload = item.payload.ok_or_else(|| AppError::MissingField {
                    field: "payload".to_string(),
                })?;
                let deadline = self.deadline(ctx, &grant)?;
                within(
                    deadline,
                    self.transport.put(&grant, content_type.as_deref(), payload),
                )
                .await?;
                tracing::debug!(path = %item.path, url = %redact_signed_url(&grant.signed_url), "uploaded");
                Ok(Some(grant.signed_url))
            }
            Operation::Delete => {
                let lookup = self.fresh_grant(ctx, Operation::Get, &item.path, None).await?;
                let deadline = self.deadline(ctx, &lookup)?;
                if !within(deadline, self.transport.exists(&lookup)).await? {
                    return Err(AppError::Broker(format!("object not found: {}", item.path)));
                }
                let deadline = self.deadline(ctx, &grant)?;
                within(deadline, self.transport.delete(&grant)).await?;
                Ok(None)
            }
            Operation::Get => Ok(Some(grant.signed_url)),
        }
    }

    async fn fresh_grant(
        &self,
        ctx: &SessionContext,
        operation: Operation,
        path: &str,
        content_type: Option<String>,
    ) -> AppResult<OperationGrant> {
        let credentials = ctx.session_credentials().await?;
        let request = GrantRequest::new(
            operation,
            self.config.bucket.clone(),
            path,
            self.config.grant_ttl_secs,
        )
        .with_content_type(content_type);
        within(
            self.config.request_timeout(),
            self.broker.request_grant(&credentials, &request),
        )
        .await
    }

    fn deadline(
        &self,
        ctx: &SessionContext,
        grant: &OperationGrant,
    ) -> AppResult<std::time::Duration> {
        transfer_deadline(
            grant,
            ctx.now(),
            self.config.expiry_margin(),
            self.config.request_timeout(),
        )
    }
}

fn record(progress: &ProgressTracker, result: &BatchResult) {
    if result.success {
        progress.record_success();
    } else {
        progress.record_failure();
    }
}

/// Groups broker entries by path, keeping their order within each path.
fn queue_by_path<V>(entries: impl IntoIterator<Item = (String, V)>) -> HashMap<String, VecDeque<V>> {
    let mut queues: HashMap<String, VecDeque<V>> = HashMap::new();
    for (path, value) in entries {
        queues.entry(path).or_default().push_back(value);
    }
    queues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_paths_keep_their_order() {
        let mut queues = queue_by_path(vec![
            ("a.txt".to_string(), 1),
            ("b.txt".to_string(), 2),
            ("a.txt".to_string(), 3),
        ]);
        let a = queues.get_mut("a.txt").unwrap();
        assert_eq!(a.pop_front(), Some(1));
        assert_eq!(a.pop_front(), Some(3));
        assert_eq!(a.pop_front(), None);
    }

    #[test]
    fn progress_counts_both_outcomes() {
        let progress = ProgressTracker::new("items", 2);
        record(&progress, &BatchResult::succeeded("a.txt", None));
        record(&progress, &BatchResult::failed("b.txt", "missing"));
        let snapshot = progress.snapshot();
        assert_eq!((snapshot.completed, snapshot.failed), (1, 1));
        assert_eq!(snapshot.percent, 100.0);
    }
}
