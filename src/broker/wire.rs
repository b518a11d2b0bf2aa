//! Broker wire format: request/response bodies and the HTTP helpers that
//! turn raw responses into typed values or [`AppError`]s.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::models::ObjectSummary;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PutGrantBody<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
    pub expires_in: u64,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemBody<'a> {
    pub path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequestBody<'a> {
    pub action: &'a str,
    pub bucket: &'a str,
    pub items: Vec<BatchItemBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchResultBody {
    pub path: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub signed_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Vec<BatchResultBody>,
}

#[derive(Serialize, Debug)]
pub struct SearchRequestBody<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct SearchResponse {
    #[serde(default)]
    pub items: Vec<ObjectSummary>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Body of `POST /s3-multipart`, tagged by `action`.
#[derive(Serialize, Debug)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum MultipartRequestBody<'a> {
    #[serde(rename_all = "camelCase")]
    Create {
        bucket: &'a str,
        key: &'a str,
        content_type: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    SignPart {
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        expires_in: u64,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    },
    #[serde(rename_all = "camelCase")]
    Abort {
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    },
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultipartResponse {
    pub upload_id: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartResponse {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Builds the HTTP client shared by the authority, the broker and the transport.
pub fn http_client(config: &Config) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(AppError::Http)
}

/// Resolves a broker route against the configured base URL.
pub fn route(base: &str, route: &str) -> AppResult<url::Url> {
    let mut url = url::Url::parse(base)
        .map_err(|e| AppError::Config(format!("broker_url '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| AppError::Config(format!("broker_url '{}' cannot be a base", base)))?
        .pop_if_empty()
        .push(route);
    Ok(url)
}

/// Connection failures and timeouts mean the endpoint is unavailable.
pub fn map_send_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() || e.is_connect() {
        AppError::Unavailable(e.without_url().to_string())
    } else {
        AppError::Http(e.without_url())
    }
}

pub async fn send(request: reqwest::RequestBuilder) -> AppResult<reqwest::Response> {
    request.send().await.map_err(map_send_error)
}

/// Extracts a readable message from an error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(message),
            ..
        })
        | Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        _ => body.trim().to_string(),
    }
}

pub fn error_from_body(status: http::StatusCode, body: &str) -> AppError {
    AppError::from_status(status, &error_message(body))
}

/// Reads a response, mapping non-success statuses to errors and decoding the
/// JSON body otherwise.
pub async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
    let (status, body) = read(response).await?;
    if !status.is_success() {
        return Err(error_from_body(status, &body));
    }
    parse(&body)
}

/// Reads status and body text.
pub async fn read(response: reqwest::Response) -> AppResult<(http::StatusCode, String)> {
    let status = response.status();
    let body = response.text().await.map_err(map_send_error)?;
    Ok((status, body))
}

pub fn parse<T: DeserializeOwned>(body: &str) -> AppResult<T> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body)
        .map_err(|e| AppError::Broker(format!("malformed broker response: {}", e)))
}
