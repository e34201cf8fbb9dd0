use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use capsync_core::{EndpointFamily, RetryDisposition, SyncError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_family_concurrency: usize,
    pub default_headers: HeaderMap,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_family_concurrency: 4,
            default_headers: HeaderMap::new(),
        }
    }
}

impl HttpClientConfig {
    /// Adds a credential header sent with every request. The value is marked
    /// sensitive so it never shows up in `Debug` output.
    pub fn with_secret_header(mut self, name: &str, secret: &str) -> anyhow::Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {name:?}"))?;
        let mut value = HeaderValue::from_str(secret).context("credential is not a valid header value")?;
        value.set_sensitive(true);
        self.default_headers.insert(name, value);
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::LimiterClosed => RetryDisposition::NonRetryable,
        }
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match &err {
            FetchError::HttpStatus { status: 429, .. } => SyncError::RateLimitExceeded(err.to_string()),
            _ if err.disposition() == RetryDisposition::Retryable => {
                SyncError::TransientNetwork(err.to_string())
            }
            _ => SyncError::Api(err.to_string()),
        }
    }
}

/// Single-attempt GET client. Retrying is left to the caller's supervisor so a
/// request is never retried at two layers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_family_limit: usize,
    per_family: Mutex<HashMap<EndpointFamily, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(config.default_headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_family_limit: config.per_family_concurrency.max(1),
            per_family: Mutex::new(HashMap::new()),
        })
    }

    async fn family_semaphore(&self, family: EndpointFamily) -> Arc<Semaphore> {
        let mut map = self.per_family.lock().await;
        map.entry(family)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_family_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        family: EndpointFamily,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_family = self.family_semaphore(family).await;
        let _family = per_family
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", family = family.as_str(), url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
