//! Generative restoration provider client.
//!
//! One opaque call: image in, restored image out, plus billing metadata for
//! the audit trail. The HTTP client throttles itself with a direct governor
//! limiter and retries transient failures with jittered exponential backoff.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bon::Builder;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const PROVIDER_MAX_ATTEMPTS: usize = 3;

/// Billing metadata recorded on the job record for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub request_id: String,
    pub billed_units: u32,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone)]
pub struct RestoredImage {
    pub bytes: Vec<u8>,
    pub receipt: ProviderReceipt,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Connection faults, 429s, and 5xx replies are worth retrying; anything
    /// else is a request-shape problem that retries cannot fix.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait RestorationProvider: Send + Sync {
    async fn restore(&self, prompt: &str, image: &[u8]) -> Result<RestoredImage, ProviderError>;
}

/// Parameters for the HTTP provider client.
#[derive(Debug, Clone, Builder)]
pub struct ProviderConfig {
    #[builder(into)]
    pub base_url: String,
    #[builder(into)]
    pub model: String,
    #[builder(into)]
    pub api_key: String,
    #[builder(default = 4)]
    pub requests_per_second: u32,
    #[builder(default = 120)]
    pub request_timeout_secs: u64,
}

#[derive(Serialize)]
struct RestoreRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    image: String,
}

#[derive(Deserialize)]
struct RestoreResponse {
    image: String,
    request_id: String,
    #[serde(default)]
    billed_units: u32,
    #[serde(default)]
    estimated_cost: f64,
}

pub struct HttpRestorationProvider {
    http: reqwest::Client,
    config: ProviderConfig,
    rate_limiter: Arc<GenericRateLimiter>,
    backoff: ExponentialBuilder,
}

impl HttpRestorationProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        debug_assert!(!config.api_key.is_empty());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let per_second = NonZeroU32::new(config.requests_per_second.max(1))
            .expect("requests_per_second is clamped to >= 1");
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(PROVIDER_MAX_ATTEMPTS - 1)
            .with_jitter();

        Ok(Self {
            http,
            config,
            rate_limiter,
            backoff,
        })
    }

    async fn call_once(&self, prompt: &str, image: &[u8]) -> Result<RestoredImage, ProviderError> {
        self.rate_limiter.until_ready().await;

        let body = RestoreRequest {
            model: &self.config.model,
            prompt,
            image: BASE64_STANDARD.encode(image),
        };
        let url = format!(
            "{}/v1/images/restore",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: RestoreResponse = response.json().await?;
        let bytes = BASE64_STANDARD
            .decode(&reply.image)
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        if bytes.is_empty() {
            return Err(ProviderError::Decode("empty image payload".to_string()));
        }
        Ok(RestoredImage {
            bytes,
            receipt: ProviderReceipt {
                request_id: reply.request_id,
                billed_units: reply.billed_units,
                estimated_cost: reply.estimated_cost,
            },
        })
    }
}

#[async_trait]
impl RestorationProvider for HttpRestorationProvider {
    async fn restore(&self, prompt: &str, image: &[u8]) -> Result<RestoredImage, ProviderError> {
        let attempt = || self.call_once(prompt, image);
        attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(ProviderError::is_transient)
            .notify(|err: &ProviderError, delay: Duration| {
                tracing::warn!(
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying provider restore call"
                );
            })
            .await
    }
}

/// Development implementation: returns the input unchanged with a synthetic
/// receipt. Lets the whole pipeline run without provider credentials.
pub struct EchoProvider;

#[async_trait]
impl RestorationProvider for EchoProvider {
    async fn restore(&self, _prompt: &str, image: &[u8]) -> Result<RestoredImage, ProviderError> {
        Ok(RestoredImage {
            bytes: image.to_vec(),
            receipt: ProviderReceipt {
                request_id: format!("echo-{}", uuid::Uuid::now_v7()),
                billed_units: 0,
                estimated_cost: 0.0,
            },
        })
    }
}
