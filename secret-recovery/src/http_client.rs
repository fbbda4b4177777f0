// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Http client for the secret recovery service
//!
//! Responsible for
//!  - fetching and caching service credentials
//!  - store / restore requests
//!  - mapping http status codes into the closed [`SvrError`] set
//!  - request metrics
//!
//! Each call is a single attempt; retry and rate-limit waits are left to the caller.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode, header::HeaderMap};
use serde::{Serialize, de::DeserializeOwned};
use snafu::prelude::*;
use tracing::{debug, error, trace, warn};

use crate::{
    Result,
    config::{
        CONNECT_TIMEOUT_SECS, CREDENTIAL_PATH, DEFAULT_SVR_URL, REQUEST_TIMEOUT_SECS,
        RESTORE_PATH, STORE_PATH, SVR_URL_ENV,
    },
    error::{HttpSnafu, SerializationSnafu, SvrError},
    service::SecretRecoveryService,
    types::{
        AccountCredentials, RestoreRequest, RestoreResponse, StoreRequest, StoreResponse,
        SvrCredential,
    },
};

/// Request metrics tracked using atomic counters for thread-safe access.
/// These counters are cumulative and never reset during the client's lifetime.
#[derive(Debug, Default)]
pub struct SvrMetrics {
    /// Total number of HTTP requests sent to the server
    total_requests: AtomicU64,
    /// Total number of successful responses (2xx status codes)
    successful_responses: AtomicU64,
    /// Total number of error responses (non-2xx, excluding rate limit)
    errors: AtomicU64,
    /// Total number of rate limit responses (429)
    rate_limit_errors: AtomicU64,
    /// Credentials fetched from the server (cache misses and forced refreshes)
    credential_fetches: AtomicU64,
    /// Total bytes sent in request bodies
    bytes_sent: AtomicU64,
    /// Total bytes received in response bodies
    bytes_received: AtomicU64,
}

impl SvrMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of current metrics as plain u64 values
    pub fn snapshot(&self) -> SvrMetricsSnapshot {
        SvrMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rate_limit_errors: self.rate_limit_errors.load(Ordering::Relaxed),
            credential_fetches: self.credential_fetches.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn increment_requests(&self, body_len: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(body_len as u64, Ordering::Relaxed);
    }

    fn increment_success(&self, body_len: usize) {
        self.successful_responses.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(body_len as u64, Ordering::Relaxed);
    }

    fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_rate_limit_errors(&self) {
        self.rate_limit_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_credential_fetches(&self) {
        self.credential_fetches.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of [`SvrMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvrMetricsSnapshot {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub errors: u64,
    pub rate_limit_errors: u64,
    pub credential_fetches: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl fmt::Display for SvrMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} success={} errors={} rate_limit={} credentials={} sent={}B recv={}B",
            self.total_requests,
            self.successful_responses,
            self.errors,
            self.rate_limit_errors,
            self.credential_fetches,
            self.bytes_sent,
            self.bytes_received,
        )
    }
}

/// Configuration for [`HttpSecretRecoveryClient`].
#[derive(Debug, Clone)]
pub struct SvrClientConfig {
    /// Base URL, e.g. `https://backup.example.org`
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SvrClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var(SVR_URL_ENV).unwrap_or_else(|_| DEFAULT_SVR_URL.to_string()),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

impl SvrClientConfig {
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// [`SecretRecoveryService`] over https.
#[derive(Clone)]
pub struct HttpSecretRecoveryClient {
    client: reqwest::Client,
    base_url: String,
    account: Arc<Mutex<Option<AccountCredentials>>>,
    cached_credential: Arc<Mutex<Option<SvrCredential>>>,
    metrics: Arc<SvrMetrics>,
}

impl fmt::Debug for HttpSecretRecoveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSecretRecoveryClient")
            .field("base_url", &self.base_url)
            .field("has_account", &self.account.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl HttpSecretRecoveryClient {
    pub fn with_config(config: SvrClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context(HttpSnafu {
                method: "client-init",
                url: "",
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account: Arc::new(Mutex::new(None)),
            cached_credential: Arc::new(Mutex::new(None)),
            metrics: Arc::new(SvrMetrics::new()),
        })
    }

    /// Sets the account credentials used for the credential endpoint.
    /// Clears any cached service credential.
    pub fn set_account(&self, account: AccountCredentials) {
        *self.account.lock() = Some(account);
        *self.cached_credential.lock() = None;
    }

    pub fn metrics_snapshot(&self) -> SvrMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn fetch_credential(&self) -> Result<SvrCredential> {
        let (username, password) = {
            let account = self.account.lock();
            let account = account.as_ref().context(crate::error::UnauthenticatedSnafu)?;
            (account.username.clone(), account.password.clone())
        };
        self.metrics.increment_credential_fetches();
        let url = format!("{}{CREDENTIAL_PATH}", self.base_url);
        let request = self
            .client
            .request(Method::GET, &url)
            .basic_auth(username, Some(password));
        self.send(Method::GET, url, request, 0).await
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        credential: &SvrCredential,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{path}", self.base_url);
        let body = Bytes::from(serde_json::to_vec(body).context(SerializationSnafu)?);
        let body_len = body.len();
        debug!(%url, ?body_len, "svr request");
        let request = self
            .client
            .request(Method::POST, &url)
            .basic_auth(&credential.username, Some(&credential.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.send(Method::POST, url, request, body_len).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        request: reqwest::RequestBuilder,
        body_len: usize,
    ) -> Result<T> {
        self.metrics.increment_requests(body_len);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.increment_errors();
                error!(source=?e, %url, "svr http");
                if e.is_connect() || e.is_timeout() {
                    return Err(SvrError::Connection {
                        url,
                        message: e.to_string(),
                    });
                }
                return Err(SvrError::Http {
                    method: method.to_string(),
                    url,
                    source: e,
                });
            }
        };
        let code = response.status();
        if code.is_success() {
            let body = response.bytes().await.context(HttpSnafu {
                method: method.to_string(),
                url: url.clone(),
            })?;
            self.metrics.increment_success(body.len());
            if tracing::enabled!(target: "secret_recovery::http_json", tracing::Level::TRACE) {
                trace!(target: "secret_recovery::http_json", %url, "response {} bytes", body.len());
            }
            return deserialize_json(&body);
        }
        if code == StatusCode::TOO_MANY_REQUESTS {
            self.metrics.increment_rate_limit_errors();
        } else {
            self.metrics.increment_errors();
        }
        let headers = response.headers().clone();
        let message = response.text().await.unwrap_or_default();
        let err = error_for_status(code, &headers, &url, message);
        warn!(?code, %url, "svr request failed: {err}");
        Err(err)
    }
}

impl SecretRecoveryService for HttpSecretRecoveryClient {
    async fn credential(&self, force_refresh: bool) -> Result<SvrCredential> {
        if !force_refresh {
            let cached = self.cached_credential.lock().clone();
            if let Some(cred) = cached {
                return Ok(cred);
            }
        }
        let cred = self.fetch_credential().await?;
        *self.cached_credential.lock() = Some(cred.clone());
        Ok(cred)
    }

    async fn store(&self, credential: &SvrCredential, request: StoreRequest) -> Result<StoreResponse> {
        self.post(STORE_PATH, credential, &request).await
    }

    async fn restore(
        &self,
        credential: &SvrCredential,
        request: RestoreRequest,
    ) -> Result<RestoreResponse> {
        self.post(RESTORE_PATH, credential, &request).await
    }
}

/// Map a non-success http status to the service error set.
fn error_for_status(code: StatusCode, headers: &HeaderMap, url: &str, message: String) -> SvrError {
    match code {
        StatusCode::BAD_REQUEST /* 400 */ |
        StatusCode::UNPROCESSABLE_ENTITY /* 422 */ => SvrError::InvalidArgument { message },
        StatusCode::NOT_FOUND /* 404 */ => SvrError::NotFound,
        StatusCode::TOO_MANY_REQUESTS /* 429 */ => match parse_retry_after(headers) {
            Some(retry_after) => SvrError::RateLimited { retry_after },
            None => {
                error!(%url, "Received 429 response but couldn't parse retry-after header");
                SvrError::Api {
                    code: code.as_u16(),
                    url: url.to_string(),
                    message: "unparseable retry-after".to_string(),
                }
            }
        },
        StatusCode::REQUEST_TIMEOUT /* 408 */ |
        StatusCode::BAD_GATEWAY /* 502 */ |
        StatusCode::SERVICE_UNAVAILABLE /* 503 */ |
        StatusCode::GATEWAY_TIMEOUT /* 504 */ => SvrError::Connection {
            url: url.to_string(),
            message: format!("{code} {message}"),
        },
        _ => SvrError::Api {
            code: code.as_u16(),
            url: url.to_string(),
            message,
        },
    }
}

/// Parse the retry interval (whole seconds) from a 429 response.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    for header_name in ["retry-after", "ratelimit-reset"] {
        if let Some(value) = headers.get(header_name)
            && let Ok(text) = value.to_str()
        {
            if let Ok(secs) = text.trim().parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            error!("Could not parse 429 response header '{header_name}: {text}'");
        }
    }
    None
}

// deserialize, reporting errors with 'serde_path_to_error', which provides
// detailed json path to the error
fn deserialize_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    match serde_path_to_error::deserialize(&mut deserializer) {
        Ok(value) => Ok(value),
        Err(err) => {
            error!("Deserialization failed at {}: {}", err.path(), err);
            Err(SvrError::Deserialization {
                source: err.into_inner(),
            })
        }
    }
}
