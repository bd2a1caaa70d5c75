//! Venue import pipeline.
//!
//! Pulls venue records from an external [`VenueProvider`], retries transient
//! failures with exponential backoff and resolves every record through the
//! [`VenueResolver`]. Calls go through a circuit breaker and a per-provider
//! rate limiter. A record that cannot be fetched comes back as
//! [`Resolution::Pending`] so the import run itself never fails.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::guard::{BreakerConfig, BreakerState, CircuitBreaker, RateLimitConfig, RateLimiter};
use crate::venue::{Resolution, VenueCandidate, VenueResolver};

/// Source of venue records (OSM, Yelp, a partner feed).
pub trait VenueProvider: Send + Sync {
    /// Provider name, matching `VenueCandidate::provider`.
    fn name(&self) -> &str;

    /// Fetch one venue by the provider's own id. Network failures should
    /// surface as [`Error::TransientUpstream`] so they are retried.
    fn fetch<'a>(&'a self, provider_id: &'a str) -> impl Future<Output = Result<VenueCandidate>> + Send + 'a;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Fetch attempts per record, including the first (default: 3).
    pub max_attempts: u32,
    /// Backoff after the first failure (default: 200ms), doubled per retry.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling (default: 5000ms).
    pub max_backoff_ms: u64,
    /// Records fetched concurrently (default: 4).
    pub concurrency: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 200, max_backoff_ms: 5_000, concurrency: 4 }
    }
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("import.max_attempts must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("import.concurrency must be at least 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config("import.initial_backoff_ms exceeds max_backoff_ms".into()));
        }
        Ok(())
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Outcome of one import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub run_id: String,
    /// One entry per requested id, in request order.
    pub resolutions: Vec<Resolution>,
    pub matched: usize,
    pub created: usize,
    pub pending: usize,
}

pub struct VenueImporter {
    resolver: Arc<VenueResolver>,
    config: ImportConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

impl VenueImporter {
    pub fn new(
        resolver: Arc<VenueResolver>,
        config: ImportConfig,
        breaker: BreakerConfig,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            resolver,
            config,
            breaker: CircuitBreaker::new("venue-provider", breaker),
            limiter: RateLimiter::new(rate_limit),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Fetch and resolve `provider_ids`, recording decisions under `run_id`.
    pub async fn import<P: VenueProvider>(&self, provider: &P, provider_ids: Vec<String>, run_id: &str) -> ImportReport {
        let total = provider_ids.len();
        let start = Instant::now();
        info!(
            "[VenueImporter] Run {}: importing {} venues from {} (concurrency {})",
            run_id,
            total,
            provider.name(),
            self.config.concurrency
        );

        let resolutions: Vec<Resolution> = stream::iter(provider_ids)
            .map(move |id| async move { self.import_one(provider, &id, run_id).await })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = ImportReport { run_id: run_id.to_string(), ..Default::default() };
        for resolution in &resolutions {
            match resolution {
                Resolution::Matched { .. } => report.matched += 1,
                Resolution::Created { .. } => report.created += 1,
                Resolution::Pending { .. } => report.pending += 1,
            }
        }
        report.resolutions = resolutions;

        info!(
            "[VenueImporter] Run {} done in {:?}: {} matched, {} created, {} pending",
            run_id,
            start.elapsed(),
            report.matched,
            report.created,
            report.pending
        );
        report
    }

    async fn import_one<P: VenueProvider>(&self, provider: &P, provider_id: &str, run_id: &str) -> Resolution {
        let resolved = match self.fetch_with_retry(provider, provider_id).await {
            Ok(candidate) => self.resolver.resolve(&candidate, run_id, chrono::Utc::now().timestamp()),
            Err(e) => Err(e),
        };
        resolved.unwrap_or_else(|e| {
            warn!("[VenueImporter] {}:{} pending: {}", provider.name(), provider_id, e);
            Resolution::Pending { provider_id: provider_id.to_string(), reason: e.to_string() }
        })
    }

    async fn fetch_with_retry<P: VenueProvider>(&self, provider: &P, provider_id: &str) -> Result<VenueCandidate> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.breaker.allow(Instant::now())?;
            self.limiter.check(provider.name(), chrono::Utc::now().timestamp())?;

            match provider.fetch(provider_id).await {
                Ok(candidate) => {
                    self.breaker.record_success();
                    debug!("[VenueImporter] Fetched {}:{} on attempt {}", provider.name(), provider_id, attempt);
                    return Ok(candidate);
                }
                Err(e) if e.is_retriable() => {
                    self.breaker.record_failure(Instant::now());
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    let wait = self.config.backoff(attempt);
                    warn!(
                        "[VenueImporter] {}:{} failed: {}, retry {} after {:?}",
                        provider.name(),
                        provider_id,
                        e,
                        attempt,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
