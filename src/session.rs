//! # Session Authentication
//!
//! Exchanges the caller's identity token and admin secret for a short-lived
//! session grant, and caches that grant in an explicit [`SessionContext`]
//! handed to every coordinator and orchestrator call.
//!
//! ## Grant Lifecycle
//!
//! ```text
//! SessionContext::new → session_credentials() → authenticate (first call)
//!                     → session_credentials() → cached grant (while valid)
//!                     → invalidate()          → next call re-authenticates
//! ```
//!
//! ## Failure Classes
//!
//! - `Unauthorized`: a credential was rejected; surfaced immediately
//! - `Unavailable`: the authority could not be reached; retried with backoff

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broker::wire::{self, SessionResponse};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::constants::{DEFAULT_SESSION_TTL_SECS, ROUTE_SESSION};
use crate::errors::{AppError, AppResult};
use crate::middleware::{AuthHeaders, ValidationMiddleware};
use crate::models::{Secret, SessionGrant};
use crate::retry::RetryPolicy;

/// Remote authority issuing session grants.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn authenticate(
        &self,
        identity_token: &Secret,
        admin_secret: &Secret,
    ) -> AppResult<SessionGrant>;
}

/// Credentials attached to one broker call: a live session token plus the
/// admin secret forwarded alongside it.
#[derive(Clone, Debug)]
pub struct SessionCredentials {
    pub token: Secret,
    pub admin_secret: Secret,
    pub expires_at: DateTime<Utc>,
}

/// Validates both credentials, then asks the authority for a grant.
///
/// # Arguments
///
/// * `authority` - The remote session authority
/// * `identity_token` - Bearer credential from the identity provider
/// * `admin_secret` - Out-of-band admin password
///
/// # Errors
///
/// - `MissingField` if either credential is empty
/// - `Unauthorized` if the authority rejects a credential
/// - `Unavailable` if the authority cannot be reached
pub async fn authenticate(
    authority: &dyn SessionAuthority,
    identity_token: &Secret,
    admin_secret: &Secret,
) -> AppResult<SessionGrant> {
    ValidationMiddleware::validate_credentials(identity_token, admin_secret)?;
    authority.authenticate(identity_token, admin_secret).await
}

/// HTTP session authority speaking the broker's `POST /session` route.
#[derive(Clone)]
pub struct HttpSessionAuthority {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpSessionAuthority {
    pub fn new(client: reqwest::Client, broker_url: &str) -> AppResult<Self> {
        Ok(Self {
            client,
            endpoint: wire::route(broker_url, ROUTE_SESSION)?,
        })
    }

    pub fn from_config(client: reqwest::Client, config: &Config) -> AppResult<Self> {
        Self::new(client, &config.broker_url)
    }
}

#[async_trait]
impl SessionAuthority for HttpSessionAuthority {
    async fn authenticate(
        &self,
        identity_token: &Secret,
        admin_secret: &Secret,
    ) -> AppResult<SessionGrant> {
        let request = AuthHeaders::apply(
            self.client.post(self.endpoint.clone()),
            identity_token,
            admin_secret,
        );
        let response = wire::send(request).await?;
        let body: SessionResponse = wire::decode(response).await?;

        if body.token.trim().is_empty() {
            return Err(AppError::Unauthorized("authority returned an empty token".into()));
        }

        let expires_at = body
            .expires_at
            .or_else(|| decode_token_expiry(&body.token))
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_SESSION_TTL_SECS));

        Ok(SessionGrant {
            token: Secret::new(body.token),
            expires_at,
        })
    }
}

/// Reads the `exp` claim of a JWT-shaped token without verifying it.
pub fn decode_token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Explicit session state shared by every operation of one caller.
///
/// The context owns the caller's credentials and the cached session grant.
/// Concurrent callers share one refresh: the first caller to find the cache
/// stale re-authenticates while the others wait for its result.
pub struct SessionContext {
    authority: Arc<dyn SessionAuthority>,
    identity_token: Secret,
    admin_secret: Secret,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    margin: Duration,
    cached: Mutex<Option<SessionGrant>>,
}

impl SessionContext {
    pub fn new(
        authority: Arc<dyn SessionAuthority>,
        identity_token: Secret,
        admin_secret: Secret,
    ) -> Self {
        Self {
            authority,
            identity_token,
            admin_secret,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            margin: Duration::seconds(crate::constants::DEFAULT_EXPIRY_MARGIN_SECS as i64),
            cached: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns credentials backed by a live session grant, authenticating if
    /// the cache is empty or about to expire.
    ///
    /// `Unavailable` failures are retried under the context's retry policy;
    /// `Unauthorized` is returned on the first occurrence.
    pub async fn session_credentials(&self) -> AppResult<SessionCredentials> {
        let mut cached = self.cached.lock().await;

        if let Some(grant) = cached.as_ref() {
            if grant.is_valid_at(self.now(), self.margin) {
                return Ok(self.credentials_for(grant));
            }
            tracing::debug!(expires_at = %grant.expires_at, "session grant stale, refreshing");
        }

        let grant = self
            .retry
            .run(move |attempt| async move {
                if attempt > 1 {
                    tracing::info!(attempt, "retrying session authentication");
                }
                authenticate(self.authority.as_ref(), &self.identity_token, &self.admin_secret)
                    .await
            })
            .await
            .map_err(|failure| failure.error)?;

        if !grant.is_valid_at(self.now(), Duration::zero()) {
            return Err(AppError::Unauthorized(format!(
                "authority issued a grant that expired at {}",
                grant.expires_at
            )));
        }

        tracing::info!(expires_at = %grant.expires_at, "session established");
        let credentials = self.credentials_for(&grant);
        *cached = Some(grant);
        Ok(credentials)
    }

    /// Drops the cached grant so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn credentials_for(&self, grant: &SessionGrant) -> SessionCredentials {
        SessionCredentials {
            token: grant.token.clone(),
            admin_secret: self.admin_secret.clone(),
            expires_at: grant.expires_at,
        }
    }
}
