#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use media_vault_uploads::broker::{
    BatchDeletion, BatchGrant, BatchSignItem, CompletedPart, GrantBroker, GrantRequest,
    MultipartBackend, MultipartTarget,
};
use media_vault_uploads::clock::{Clock, ManualClock};
use media_vault_uploads::config::Config;
use media_vault_uploads::errors::{AppError, AppResult};
use media_vault_uploads::models::{
    GrantMethod, ObjectSummary, OperationGrant, SearchPage, Secret, SessionGrant,
};
use media_vault_uploads::retry::RetryPolicy;
use media_vault_uploads::session::{SessionAuthority, SessionContext, SessionCredentials};
use media_vault_uploads::transport::ObjectTransport;

pub const MIB: usize = 1024 * 1024;

pub fn count(counter: &AtomicU32) -> u32 {
    counter.load(Ordering::SeqCst)
}

pub fn test_config() -> Config {
    Config {
        broker_url: "https://broker.example/api".to_string(),
        bucket: "media".to_string(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        },
        ..Config::default()
    }
}

/// Bytes whose value encodes their offset, so misplaced parts are visible.
pub fn patterned(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub struct FakeAuthority {
    clock: Arc<ManualClock>,
    pub calls: AtomicU32,
    reject: bool,
}

impl FakeAuthority {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            calls: AtomicU32::new(0),
            reject: false,
        }
    }

    pub fn rejecting(clock: Arc<ManualClock>) -> Self {
        Self {
            reject: true,
            ..Self::new(clock)
        }
    }
}

#[async_trait]
impl SessionAuthority for FakeAuthority {
    async fn authenticate(&self, _: &Secret, _: &Secret) -> AppResult<SessionGrant> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject {
            return Err(AppError::Unauthorized("Invalid admin password".into()));
        }
        Ok(SessionGrant {
            token: Secret::new(format!("session-{}", call)),
            expires_at: self.clock.now() + Duration::hours(1),
        })
    }
}

pub fn session(authority: Arc<FakeAuthority>, clock: Arc<ManualClock>) -> SessionContext {
    SessionContext::new(authority, Secret::new("id-token"), Secret::new("admin"))
        .with_clock(clock)
        .with_retry(RetryPolicy::none())
}

#[derive(Clone, Copy, Debug)]
pub enum SignBatchFailure {
    Unavailable,
    Unauthorized,
}

#[derive(Clone, Debug)]
enum Target {
    Object(String),
    Part { upload_id: String, part_number: u32 },
}

#[derive(Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
    aborted: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, Upload>,
    grants: HashMap<String, Target>,
    next_id: u64,
    refused_paths: HashSet<String>,
    transient_part_failures: HashMap<u32, u32>,
    failing_part: Option<u32>,
    forbidden_part: Option<u32>,
    stale_grants: u32,
    rejected_completions: u32,
    failing_abort: bool,
    sign_batch_failure: Option<SignBatchFailure>,
    native_delete_failure: bool,
    cancel_on_put: Option<CancellationToken>,
    put_grants: Vec<OperationGrant>,
    put_content_types: Vec<Option<String>>,
    part_sizes: BTreeMap<u32, usize>,
    slow_puts: bool,
}

/// In-memory broker, multipart backend and storage endpoint.
pub struct FakeStorage {
    clock: Arc<ManualClock>,
    state: Mutex<State>,
    batch_signing: bool,
    native_delete: bool,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub creates: AtomicU32,
    pub part_signs: AtomicU32,
    pub grant_requests: AtomicU32,
    pub batch_signs: AtomicU32,
    pub batch_deletes: AtomicU32,
    pub completes: AtomicU32,
    pub aborts: AtomicU32,
    pub puts: AtomicU32,
    pub deletes: AtomicU32,
    pub existence_checks: AtomicU32,
}

impl FakeStorage {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
            batch_signing: false,
            native_delete: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            creates: AtomicU32::new(0),
            part_signs: AtomicU32::new(0),
            grant_requests: AtomicU32::new(0),
            batch_signs: AtomicU32::new(0),
            batch_deletes: AtomicU32::new(0),
            completes: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            puts: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
            existence_checks: AtomicU32::new(0),
        }
    }

    pub fn with_batch_signing(mut self) -> Self {
        self.batch_signing = true;
        self
    }

    pub fn with_native_delete(mut self) -> Self {
        self.native_delete = true;
        self
    }

    pub fn put_object(&self, key: &str, data: &[u8]) {
        self.state
            .lock()
            .objects
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn refuse_path(&self, path: &str) {
        self.state.lock().refused_paths.insert(path.to_string());
    }

    pub fn fail_part_transiently(&self, part_number: u32, times: u32) {
        self.state
            .lock()
            .transient_part_failures
            .insert(part_number, times);
    }

    pub fn fail_part_always(&self, part_number: u32) {
        self.state.lock().failing_part = Some(part_number);
    }

    pub fn forbid_part(&self, part_number: u32) {
        self.state.lock().forbidden_part = Some(part_number);
    }

    /// The next `count` grants are issued already expired.
    pub fn issue_stale_grants(&self, count: u32) {
        self.state.lock().stale_grants = count;
    }

    pub fn reject_completions(&self, count: u32) {
        self.state.lock().rejected_completions = count;
    }

    pub fn fail_aborts(&self) {
        self.state.lock().failing_abort = true;
    }

    pub fn fail_sign_batch(&self, failure: SignBatchFailure) {
        self.state.lock().sign_batch_failure = Some(failure);
    }

    pub fn fail_native_delete(&self) {
        self.state.lock().native_delete_failure = true;
    }

    pub fn cancel_on_first_put(&self, token: CancellationToken) {
        self.state.lock().cancel_on_put = Some(token);
    }

    pub fn slow_puts(&self) {
        self.state.lock().slow_puts = true;
    }

    pub fn put_grants(&self) -> Vec<OperationGrant> {
        self.state.lock().put_grants.clone()
    }

    pub fn put_content_types(&self) -> Vec<Option<String>> {
        self.state.lock().put_content_types.clone()
    }

    pub fn part_sizes(&self) -> Vec<usize> {
        self.state.lock().part_sizes.values().copied().collect()
    }

    pub fn stored_part_numbers(&self, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn issue(&self, state: &mut State, target: Target, path: &str, method: GrantMethod) -> OperationGrant {
        state.next_id += 1;
        let signed_url = format!(
            "https://storage.example/media/{}?X-Amz-Signature=sig{}",
            path, state.next_id
        );
        let now = self.clock.now();
        let expires_at: DateTime<Utc> = if state.stale_grants > 0 {
            state.stale_grants -= 1;
            now - Duration::seconds(1)
        } else {
            now + Duration::minutes(15)
        };
        state.grants.insert(signed_url.clone(), target);
        OperationGrant {
            signed_url,
            expires_at,
            method,
        }
    }
}

#[async_trait]
impl GrantBroker for FakeStorage {
    async fn request_grant(
        &self,
        _auth: &SessionCredentials,
        request: &GrantRequest,
    ) -> AppResult<OperationGrant> {
        self.grant_requests.fetch_add(1, Ordering::SeqCst);
        request.validate()?;
        let mut state = self.state.lock();
        if state.refused_paths.contains(&request.key) {
            return Err(AppError::Broker("signing refused for this key".into()));
        }
        Ok(self.issue(
            &mut state,
            Target::Object(request.key.clone()),
            &request.key,
            request.operation.method(),
        ))
    }

    fn supports_batch_signing(&self) -> bool {
        self.batch_signing
    }

    async fn sign_batch(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        items: &[BatchSignItem],
        _expires_in_secs: u64,
    ) -> AppResult<Vec<BatchGrant>> {
        self.batch_signs.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        match state.sign_batch_failure {
            Some(SignBatchFailure::Unavailable) => {
                return Err(AppError::Unavailable("503 Service Unavailable".into()))
            }
            Some(SignBatchFailure::Unauthorized) => {
                return Err(AppError::Unauthorized("session expired".into()))
            }
            None => {}
        }
        Ok(items
            .iter()
            .map(|item| {
                let grant = if state.refused_paths.contains(&item.path) {
                    Err("signing refused for this key".to_string())
                } else {
                    Ok(self.issue(
                        &mut state,
                        Target::Object(item.path.clone()),
                        &item.path,
                        GrantMethod::Put,
                    ))
                };
                BatchGrant {
                    path: item.path.clone(),
                    grant,
                }
            })
            // Reverse so matching cannot rely on response order.
            .rev()
            .collect())
    }

    fn supports_native_batch_delete(&self) -> bool {
        self.native_delete
    }

    async fn delete_batch(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        paths: &[String],
    ) -> AppResult<Vec<BatchDeletion>> {
        self.batch_deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.native_delete_failure {
            return Err(AppError::Broker("batch delete not enabled".into()));
        }
        Ok(paths
            .iter()
            .map(|path| BatchDeletion {
                path: path.clone(),
                outcome: match state.objects.remove(path) {
                    Some(_) => Ok(()),
                    None => Err("NoSuchKey".to_string()),
                },
            })
            .collect())
    }

    async fn search(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        prefix: &str,
    ) -> AppResult<SearchPage> {
        let state = self.state.lock();
        let items: Vec<ObjectSummary> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: None,
            })
            .collect();
        Ok(SearchPage {
            total: items.len() as u64,
            items,
        })
    }
}

#[async_trait]
impl MultipartBackend for FakeStorage {
    async fn create_multipart(
        &self,
        _auth: &SessionCredentials,
        _bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> AppResult<String> {
        let id = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let upload_id = format!("upload-{}", id);
        self.state.lock().uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                ..Upload::default()
            },
        );
        Ok(upload_id)
    }

    async fn sign_part(
        &self,
        _auth: &SessionCredentials,
        target: &MultipartTarget,
        part_number: u32,
        _expires_in_secs: u64,
    ) -> AppResult<OperationGrant> {
        self.part_signs.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        match state.uploads.get(&target.upload_id) {
            Some(upload) if !upload.aborted => {}
            _ => return Err(AppError::Broker("NoSuchUpload".into())),
        }
        Ok(self.issue(
            &mut state,
            Target::Part {
                upload_id: target.upload_id.clone(),
                part_number,
            },
            &target.key,
            GrantMethod::Put,
        ))
    }

    async fn complete_multipart(
        &self,
        _auth: &SessionCredentials,
        target: &MultipartTarget,
        parts: &[CompletedPart],
    ) -> AppResult<Option<String>> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.rejected_completions > 0 {
            state.rejected_completions -= 1;
            return Err(AppError::Broker("InvalidPart: one or more parts could not be found".into()));
        }

        let upload = state
            .uploads
            .get(&target.upload_id)
            .filter(|u| !u.aborted)
            .ok_or_else(|| AppError::Broker("NoSuchUpload".into()))?;

        let submitted: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        let stored: Vec<u32> = upload.parts.keys().copied().collect();
        if submitted != stored {
            return Err(AppError::Broker("InvalidPartOrder".into()));
        }

        let mut data = Vec::new();
        for part in parts {
            let (etag, bytes) = &upload.parts[&part.part_number];
            if etag != &part.etag {
                return Err(AppError::Broker(format!("InvalidPart: etag mismatch on {}", part.part_number)));
            }
            data.extend_from_slice(bytes);
        }
        let key = upload.key.clone();
        state.uploads.remove(&target.upload_id);
        state.objects.insert(key.clone(), Bytes::from(data));
        Ok(Some(format!("https://cdn.example/{}/{}", target.bucket, key)))
    }

    async fn abort_multipart(
        &self,
        _auth: &SessionCredentials,
        target: &MultipartTarget,
    ) -> AppResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.failing_abort {
            return Err(AppError::Unavailable("connection reset".into()));
        }
        if let Some(upload) = state.uploads.get_mut(&target.upload_id) {
            upload.aborted = true;
            upload.parts.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectTransport for FakeStorage {
    async fn put(
        &self,
        grant: &OperationGrant,
        content_type: Option<&str>,
        body: Bytes,
    ) -> AppResult<Option<String>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let slow = {
            let mut state = self.state.lock();
            state.put_grants.push(grant.clone());
            state.put_content_types.push(content_type.map(str::to_string));
            if let Some(token) = state.cancel_on_put.take() {
                token.cancel();
            }
            state.slow_puts
        };

        if slow {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if grant.expires_at <= self.clock.now() {
            return Err(AppError::Unauthorized("403 Forbidden: Request has expired".into()));
        }

        let mut state = self.state.lock();
        let target = state
            .grants
            .get(&grant.signed_url)
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("403 Forbidden: SignatureDoesNotMatch".into()))?;

        match target {
            Target::Object(key) => {
                state.objects.insert(key, body);
                Ok(Some(format!("\"object-{}\"", state.next_id)))
            }
            Target::Part {
                upload_id,
                part_number,
            } => {
                if state.forbidden_part == Some(part_number) {
                    return Err(AppError::Unauthorized("403 Forbidden".into()));
                }
                if state.failing_part == Some(part_number) {
                    return Err(AppError::Unavailable("503 Slow Down".into()));
                }
                if let Some(left) = state.transient_part_failures.get_mut(&part_number) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(AppError::Unavailable("503 Slow Down".into()));
                    }
                }
                state.next_id += 1;
                let etag = format!("\"{}-{}\"", part_number, state.next_id);
                let size = body.len();
                let upload = state
                    .uploads
                    .get_mut(&upload_id)
                    .filter(|u| !u.aborted)
                    .ok_or_else(|| AppError::Broker("NoSuchUpload".into()))?;
                upload.parts.insert(part_number, (etag.clone(), body));
                state.part_sizes.insert(part_number, size);
                Ok(Some(etag))
            }
        }
    }

    async fn delete(&self, grant: &OperationGrant) -> AppResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if grant.expires_at <= self.clock.now() {
            return Err(AppError::Unauthorized("403 Forbidden: Request has expired".into()));
        }
        let mut state = self.state.lock();
        let key = match state.grants.get(&grant.signed_url) {
            Some(Target::Object(key)) => key.clone(),
            _ => return Err(AppError::Unauthorized("403 Forbidden".into())),
        };
        // Signed DELETEs answer 204 for absent keys.
        state.objects.remove(&key);
        Ok(())
    }

    async fn exists(&self, grant: &OperationGrant) -> AppResult<bool> {
        self.existence_checks.fetch_add(1, Ordering::SeqCst);
        if grant.method != GrantMethod::Get {
            return Err(AppError::Unauthorized("403 Forbidden: SignatureDoesNotMatch".into()));
        }
        let state = self.state.lock();
        match state.grants.get(&grant.signed_url) {
            Some(Target::Object(key)) => Ok(state.objects.contains_key(key)),
            _ => Err(AppError::Unauthorized("403 Forbidden".into())),
        }
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub authority: Arc<FakeAuthority>,
    pub storage: Arc<FakeStorage>,
    pub ctx: SessionContext,
}

impl Harness {
    pub fn new(build: impl FnOnce(FakeStorage) -> FakeStorage) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let authority = Arc::new(FakeAuthority::new(clock.clone()));
        let storage = Arc::new(build(FakeStorage::new(clock.clone())));
        let ctx = session(authority.clone(), clock.clone());
        Self {
            clock,
            authority,
            storage,
            ctx,
        }
    }
}
