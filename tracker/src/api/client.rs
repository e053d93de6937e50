//! Remote API client
//!
//! One authenticated request primitive with bounded exponential backoff.
//! Base URL and device token are read from the settings table on every
//! call, so credential changes apply without a restart.

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::types::{LocationBatch, LocationUploadResponse};
use crate::config::{
    API_BASE_BACKOFF_MS, API_BASE_URL_KEY, API_MAX_ATTEMPTS, DEVICE_TOKEN_KEY, MAX_LOG_BODY_CHARS,
};
use crate::database::{HttpMethod, Repository};
use crate::error::{AppError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for direct API calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: API_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(API_BASE_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt with zero-based index `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Base URL and bearer token for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub base_url: String,
    pub token: String,
}

impl Credentials {
    /// Absolute URL for a path. Absolute URLs pass through unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    repo: Repository,
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(repo: Repository, transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self {
            repo,
            transport,
            retry,
        }
    }

    /// Read the current credentials from the settings table
    pub async fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            base_url: base_url(&self.repo).await?,
            token: device_token(&self.repo).await?,
        })
    }

    /// Authenticated request with retry.
    ///
    /// 4xx responses and local errors are returned immediately; transport
    /// failures and 5xx responses are retried with exponential backoff.
    pub async fn request(&self, method: HttpMethod, path: &str, body: &Value) -> Result<Value> {
        let credentials = self.credentials().await?;
        let body = serde_json::to_string(body)?;
        let attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            match self.send_once(&credentials, method, path, &body).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(
                        "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                        method,
                        path,
                        attempt + 1,
                        attempts,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Single attempt with pre-serialized body. Any non-2xx status is an error.
    pub async fn send_once(
        &self,
        credentials: &Credentials,
        method: HttpMethod,
        path: &str,
        body: &str,
    ) -> Result<Value> {
        let request = HttpRequest {
            method,
            url: credentials.url_for(path),
            bearer: credentials.token.clone(),
            body: Some(body.to_string()),
        };

        let response = self.transport.send(request).await?;
        parse_response(response)
    }

    /// Upload one location batch in a single attempt
    pub async fn upload_location(
        &self,
        credentials: &Credentials,
        batch: &LocationBatch,
    ) -> Result<LocationUploadResponse> {
        let body = serde_json::to_string(batch)?;
        let value = self
            .send_once(credentials, HttpMethod::Post, "/v1/location", &body)
            .await?;

        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}

/// Configured API base URL, or a `Config` error when unset
pub(crate) async fn base_url(repo: &Repository) -> Result<String> {
    repo.get_setting(API_BASE_URL_KEY)
        .await?
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            AppError::Config("API base URL not configured. Please set it in settings.".to_string())
        })
}

/// Configured device token, or a `Config` error when unset
pub(crate) async fn device_token(repo: &Repository) -> Result<String> {
    repo.get_setting(DEVICE_TOKEN_KEY)
        .await?
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| {
            AppError::Config("Device token not set. Please pair with server first.".to_string())
        })
}

fn parse_response(response: HttpResponse) -> Result<Value> {
    if !response.is_success() {
        let mut message = response
            .body
            .chars()
            .take(MAX_LOG_BODY_CHARS)
            .collect::<String>();
        if response.body.chars().count() > MAX_LOG_BODY_CHARS {
            message.push_str("...");
        }
        tracing::debug!("API response error ({}): {}", response.status, message);

        return Err(AppError::Api {
            status: response.status,
            message,
        });
    }

    // Empty or non-JSON success bodies (e.g. PATCH endpoints) resolve to {}
    if !response.is_json() || response.body.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    Ok(serde_json::from_str(&response.body)?)
}
