//! Composition root.
//!
//! Every handler and worker receives an [`AppContext`] instead of reaching
//! for globals; tests build one against temp directories and in-process
//! implementations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::{AppConfig, AuthMode, ModerationMode, ProviderMode};
use crate::error::AppError;
use crate::services::auth::{DevTokenVerifier, HttpTokenVerifier, TokenVerifier};
use crate::services::blob::{BlobStore, FsBlobStore};
use crate::services::credits::{CreditPolicy, CreditService};
use crate::services::idempotency::IdempotencyStore;
use crate::services::kv::{AtomicKv, MemoryKv, RedisKv};
use crate::services::moderation::{HttpModerationClient, ModerationClient, PermissiveModeration};
use crate::services::provider::{
    EchoProvider, HttpRestorationProvider, ProviderConfig, RestorationProvider,
};
use crate::services::queue::{QueuePolicy, TaskQueue, TerminalFailure};
use crate::services::rate_limit::{RateLimitPolicy, RateLimitService, WindowPolicy};
use crate::services::records::RecordStore;
use crate::services::store::DocStore;

/// Ring buffer of recent request latencies for the readiness summary.
pub struct LatencySampler {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

impl LatencySampler {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency_ms: u64) {
        let mut samples = self.samples.lock().expect("latency mutex poisoned");
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let samples = self.samples.lock().expect("latency mutex poisoned");
        if samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let percentile = |p: f64| {
            let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        LatencySummary {
            count: sorted.len(),
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
        }
    }
}

pub struct AppContext {
    pub config: AppConfig,
    pub kv: Arc<dyn AtomicKv>,
    /// True when the shared store is unreachable and the in-process fallback
    /// is serving counters/buckets/idempotency.
    pub kv_degraded: bool,
    pub docs: Arc<DocStore>,
    pub records: Arc<RecordStore>,
    pub queue: Arc<TaskQueue>,
    pub credits: Arc<CreditService>,
    pub idempotency: Arc<IdempotencyStore>,
    pub rate_limits: Arc<RateLimitService>,
    pub blobs: Arc<dyn BlobStore>,
    pub moderation: Arc<dyn ModerationClient>,
    pub provider: Arc<dyn RestorationProvider>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub latency: Arc<LatencySampler>,
}

/// Wire the full service graph from configuration. Returns the context and
/// the queue's terminal-failure stream for the dead-letter writer.
pub async fn build_context(
    config: AppConfig,
) -> Result<(AppContext, mpsc::UnboundedReceiver<TerminalFailure>), AppError> {
    let (kv, kv_degraded) = build_kv(&config).await;

    let docs = Arc::new(DocStore::open(&config.storage.docs_dir())?);
    let records = Arc::new(RecordStore::new(Arc::clone(&docs)));

    let queue_policy = QueuePolicy {
        max_attempts: config.jobs.max_attempts,
        backoff_base_ms: config.jobs.backoff_base_ms,
        backoff_jitter: config.jobs.backoff_jitter,
        remove_on_complete: config.jobs.remove_on_complete,
        remove_on_fail: config.jobs.remove_on_fail,
        lease_ms: config.jobs.stalled_check_ms as i64,
    };
    let (queue, failures) = TaskQueue::new(Arc::clone(&docs), queue_policy);

    let credits = Arc::new(CreditService::new(
        Arc::clone(&kv),
        Arc::clone(&docs),
        CreditPolicy {
            daily_free_limit: config.credits.daily_free_limit,
            job_cost: config.credits.job_cost,
        },
    ));
    let idempotency = Arc::new(IdempotencyStore::new(Arc::clone(&kv)));
    let rate_limits = Arc::new(RateLimitService::new(
        Arc::clone(&kv),
        RateLimitPolicy {
            user: WindowPolicy {
                limit: config.server.rate_limit.user_limit,
                window_secs: config.server.rate_limit.user_interval_secs,
            },
            peer: WindowPolicy {
                limit: config.server.rate_limit.ip_limit,
                window_secs: config.server.rate_limit.ip_interval_secs,
            },
        },
    ));

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
        config.storage.blob_dir(),
        config.storage.blob_public_base_url.clone(),
        config.storage.derived_signing_key(),
        config.storage.upload_ttl_seconds,
        config.storage.download_ttl_seconds,
    )?);

    let moderation: Arc<dyn ModerationClient> = match (&config.moderation.mode, &config.moderation.endpoint) {
        (ModerationMode::Http, Some(endpoint)) => Arc::new(HttpModerationClient::new(
            endpoint.clone(),
            config.moderation.api_key.clone(),
        )?),
        _ => Arc::new(PermissiveModeration),
    };

    let provider: Arc<dyn RestorationProvider> = match (&config.provider.mode, &config.provider.api_key) {
        (ProviderMode::Http, Some(api_key)) if !api_key.is_empty() => {
            Arc::new(HttpRestorationProvider::new(
                ProviderConfig::builder()
                    .base_url(config.provider.base_url.clone())
                    .model(config.provider.model.clone())
                    .api_key(api_key.clone())
                    .requests_per_second(config.provider.requests_per_second)
                    .build(),
            )?)
        }
        _ => Arc::new(EchoProvider),
    };

    let verifier: Arc<dyn TokenVerifier> = match (&config.auth.mode, &config.auth.endpoint) {
        (AuthMode::Http, Some(endpoint)) => Arc::new(HttpTokenVerifier::new(endpoint.clone())?),
        _ => Arc::new(DevTokenVerifier),
    };

    let latency = Arc::new(LatencySampler::new(config.health.metric_sample_size));

    let context = AppContext {
        config,
        kv,
        kv_degraded,
        docs,
        records,
        queue,
        credits,
        idempotency,
        rate_limits,
        blobs,
        moderation,
        provider,
        verifier,
        latency,
    };
    Ok((context, failures))
}

async fn build_kv(config: &AppConfig) -> (Arc<dyn AtomicKv>, bool) {
    match config.kv.redis_url.as_deref() {
        Some(url) if !url.is_empty() => match RedisKv::connect(url).await {
            Ok(kv) => (Arc::new(kv) as Arc<dyn AtomicKv>, false),
            Err(error) => {
                tracing::warn!(%error, "shared key-value store unreachable; using in-process fallback");
                (Arc::new(MemoryKv::new()) as Arc<dyn AtomicKv>, true)
            }
        },
        _ => {
            tracing::info!("no shared key-value store configured; using in-process fallback");
            (Arc::new(MemoryKv::new()) as Arc<dyn AtomicKv>, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dev_context_builds_with_degraded_kv() {
        let temp = TempDir::new().expect("temp dir");
        let config = AppConfig::dev(temp.path().to_path_buf());
        let (context, _failures) = build_context(config).await.expect("context builds");
        assert!(context.kv_degraded);
        context.docs.probe().expect("doc store probes");
    }

    #[test]
    fn latency_percentiles_are_ordered() {
        let sampler = LatencySampler::new(100);
        for ms in 1..=100 {
            sampler.record(ms);
        }
        let summary = sampler.summary();
        assert_eq!(summary.count, 100);
        assert!(summary.p50_ms <= summary.p95_ms);
        assert!(summary.p95_ms >= 90);
    }

    #[test]
    fn sampler_caps_at_capacity() {
        let sampler = LatencySampler::new(10);
        for ms in 0..50 {
            sampler.record(ms);
        }
        assert_eq!(sampler.summary().count, 10);
    }
}
