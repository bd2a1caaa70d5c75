//! HTTP venue provider.
//!
//! Fetches venue records from a JSON places API:
//! - Connection pooling shared across concurrent imports
//! - Dispatch spacing (request starts are spread out, not just counted)
//! - Backoff on 429 without tripping the importer's circuit breaker
//!
//! Network errors and 5xx responses surface as
//! [`Error::TransientUpstream`] so the importer retries them.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::import::VenueProvider;
use crate::venue::VenueCandidate;
use crate::GpsPoint;

const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 100;
const MAX_IDLE_PER_HOST: usize = 16;
const MAX_429_RETRIES: u32 = 3;

/// Venue record as returned by the places API.
#[derive(Debug, Deserialize)]
struct ApiVenue {
    id: String,
    name: String,
    address: Option<String>,
    lat: f64,
    lng: f64,
    #[serde(default)]
    categories: Vec<String>,
}

fn candidate_from_api(provider: &str, venue: ApiVenue) -> VenueCandidate {
    VenueCandidate {
        provider: provider.to_string(),
        provider_id: venue.id,
        name: venue.name,
        address: venue.address,
        location: GpsPoint::new(venue.lat, venue.lng),
        tags: venue.categories,
    }
}

/// Spaces out when requests START. Each caller reserves the next free slot,
/// so concurrent imports never dispatch faster than one per interval.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;

            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        // Wait outside the lock
        if wait_duration > Duration::from_millis(5) {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait_duration);
            tokio::time::sleep(wait_duration).await;
        }
        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 1s, 2s, then 4s max
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!("[DispatchRateLimiter] Got 429, consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }
}

/// [`VenueProvider`] backed by a places API at `base_url`
/// (`GET {base_url}/venues/{id}`).
pub struct HttpVenueProvider {
    name: String,
    base_url: String,
    auth_header: Option<String>,
    client: Client,
    rate_limiter: DispatchRateLimiter,
}

impl HttpVenueProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>) -> Result<Self> {
        Self::with_dispatch_interval(name, base_url, api_key, Duration::from_millis(DEFAULT_DISPATCH_INTERVAL_MS))
    }

    pub fn with_dispatch_interval(name: &str, base_url: &str, api_key: Option<&str>, interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let auth_header = api_key.map(|key| {
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", key));
            format!("Basic {}", encoded)
        });

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            client,
            rate_limiter: DispatchRateLimiter::new(interval),
        })
    }

    async fn fetch_venue(&self, provider_id: &str) -> Result<VenueCandidate> {
        let url = format!("{}/venues/{}", self.base_url, provider_id);
        let mut throttled = 0;

        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;
            let started = Instant::now();

            let mut request = self.client.get(&url);
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::TransientUpstream(format!("{} request failed: {}", self.name, e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                throttled += 1;
                if throttled > MAX_429_RETRIES {
                    return Err(Error::TransientUpstream(format!("{} kept returning 429", self.name)));
                }
                let wait = self.rate_limiter.record_429();
                tokio::time::sleep(wait).await;
                continue;
            }
            self.rate_limiter.record_success();

            if status == StatusCode::NOT_FOUND {
                return Err(Error::InvalidInput(format!("{} has no venue {}", self.name, provider_id)));
            }
            if status.is_server_error() {
                return Err(Error::TransientUpstream(format!("{} returned HTTP {}", self.name, status)));
            }
            if !status.is_success() {
                return Err(Error::InvalidInput(format!("{} returned HTTP {}", self.name, status)));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| Error::TransientUpstream(format!("{} body download failed: {}", self.name, e)))?;
            let venue: ApiVenue = serde_json::from_slice(&bytes)?;

            debug!(
                "[HttpVenueProvider] #{} {} {} in {:?} ({:.1}KB)",
                dispatch_num,
                self.name,
                provider_id,
                started.elapsed(),
                bytes.len() as f64 / 1024.0
            );
            return Ok(candidate_from_api(&self.name, venue));
        }
    }
}

impl VenueProvider for HttpVenueProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(&'a self, provider_id: &'a str) -> impl Future<Output = Result<VenueCandidate>> + Send + 'a {
        self.fetch_venue(provider_id)
    }
}
