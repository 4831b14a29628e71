//! HTTP client for intervals.icu API with rate limiting.
//!
//! This module provides the production [`ActivityGateway`]:
//! - Connection pooling shared across batches
//! - Dispatch rate limiting (spaces out request starts)
//! - Automatic retry with exponential backoff on 429 and network errors

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::NaiveDate;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::gateway::ActivityGateway;
use crate::types::{ActivitySummary, GpsStream};
use crate::{Result, SyncError, elapsed_ms};

// Rate limits from intervals.icu API: 30/s burst, 132/10s sustained (13.2/s average).
// The API uses a sliding window, so stay at the sustained rate across a sync.
const DISPATCH_INTERVAL_MS: u64 = 77; // 1000ms / 13 = 77ms (13 req/s sustained rate)
const MAX_IDLE_CONNECTIONS: usize = 20;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;

/// Build a Basic auth header from an intervals.icu API key.
pub fn auth_header_from_api_key(api_key: &str) -> String {
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
    format!("Basic {}", auth)
}

// ============================================================================
// API payloads
// ============================================================================

/// One entry of `GET /athlete/0/activities`.
#[derive(Debug, Deserialize)]
struct ActivityListItem {
    id: String,
    start_date_local: String,
    #[serde(rename = "type")]
    sport_type: Option<String>,
    distance: Option<f64>,
    /// Absent on older payloads; when present, entries without `latlng`
    /// have no GPS track to fetch.
    stream_types: Option<Vec<String>>,
}

impl ActivityListItem {
    fn into_summary(self) -> Option<ActivitySummary> {
        if let Some(streams) = &self.stream_types {
            if !streams.iter().any(|s| s == "latlng") {
                return None;
            }
        }
        // "2024-01-05T07:30:00" -> 2024-01-05
        let date_part = self.start_date_local.get(..10)?;
        let start_date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        Some(ActivitySummary {
            id: self.id,
            start_date,
            sport_type: self.sport_type.unwrap_or_else(|| "Other".to_string()),
            distance_meters: self.distance.filter(|d| d.is_finite() && *d >= 0.0),
        })
    }
}

/// API response for activity map endpoint
#[derive(Debug, Deserialize)]
struct MapApiResponse {
    latlngs: Option<Vec<Option<[f64; 2]>>>,
}

impl MapApiResponse {
    fn into_stream(self) -> GpsStream {
        let points: Vec<[f64; 2]> = self
            .latlngs
            .map(|coords| coords.into_iter().flatten().collect())
            .unwrap_or_default();
        GpsStream {
            latitudes: points.iter().map(|p| p[0]).collect(),
            longitudes: points.iter().map(|p| p[1]).collect(),
            elevations: None,
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Dispatch rate limiter - spaces out when requests START
/// This is different from counting requests - it ensures we never dispatch
/// faster than the configured rate by spacing them apart.
struct DispatchRateLimiter {
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
    interval_ms: u64,
}

impl DispatchRateLimiter {
    fn new(interval_ms: u64) -> Self {
        Self {
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
            interval_ms,
        }
    }

    /// Wait for our dispatch slot. Each caller gets a unique slot
    /// spaced interval_ms apart.
    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + Duration::from_millis(self.interval_ms);

            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        // Wait outside the lock
        if wait_duration > Duration::from_millis(5) {
            debug!(
                "[Dispatch #{}] Waiting {:?} for slot",
                dispatch_num, wait_duration
            );
            tokio::time::sleep(wait_duration).await;
        }

        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // Exponential backoff: 500ms, 1s, 2s, 4s max
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!(
            "[DispatchRateLimiter] Got 429! Consecutive: {}, backing off {:?}",
            count, backoff
        );
        backoff
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// intervals.icu implementation of [`ActivityGateway`].
pub struct IntervalsGateway {
    client: Client,
    auth_header: String,
    base_url: String,
    rate_limiter: DispatchRateLimiter,
}

impl IntervalsGateway {
    /// Create a gateway with the given API key (Basic auth)
    pub fn new(api_key: &str, base_url: &str) -> Result<Self> {
        Self::with_auth_header(auth_header_from_api_key(api_key), base_url)
    }

    /// Create a gateway with a pre-formatted auth header
    /// Supports both "Basic ..." and "Bearer ..." formats
    pub fn with_auth_header(auth_header: String, base_url: &str) -> Result<Self> {
        if !(auth_header.starts_with("Basic ") || auth_header.starts_with("Bearer ")) {
            return Err(SyncError::invalid(
                "auth_header",
                "expected a Basic or Bearer header",
            ));
        }
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            auth_header,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: DispatchRateLimiter::new(DISPATCH_INTERVAL_MS),
        })
    }

    fn activities_url(&self, oldest: NaiveDate, newest: NaiveDate) -> String {
        format!(
            "{}/athlete/0/activities?oldest={}&newest={}",
            self.base_url,
            oldest.format("%Y-%m-%d"),
            newest.format("%Y-%m-%d")
        )
    }

    fn map_url(&self, activity_id: &str) -> String {
        format!("{}/activity/{}/map", self.base_url, activity_id)
    }

    /// GET `url` and decode JSON, retrying on 429 and network errors.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;
            let response = self
                .client
                .get(url)
                .header("Authorization", &self.auth_header)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(SyncError::Http {
                                message: "Max retries exceeded (429)".to_string(),
                                status_code: Some(status.as_u16()),
                            });
                        }
                        let wait = self.rate_limiter.record_429();
                        warn!(
                            "[Fetch #{}] 429 Too Many Requests, retry {} with {:?} backoff",
                            dispatch_num, retries, wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.rate_limiter.record_success();

                    if !status.is_success() {
                        return Err(SyncError::Http {
                            message: format!("HTTP {} for {}", status, url),
                            status_code: Some(status.as_u16()),
                        });
                    }

                    let bytes = resp.bytes().await?;
                    let data: T = serde_json::from_slice(&bytes)?;
                    debug!(
                        "[Fetch #{}] {:.1}KB in {} ms",
                        dispatch_num,
                        bytes.len() as f64 / 1024.0,
                        elapsed_ms(req_start)
                    );
                    return Ok(data);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(e.into());
                    }
                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!(
                        "[Fetch #{}] Error: {}, retry {} after {:?}",
                        dispatch_num, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl ActivityGateway for IntervalsGateway {
    fn list_activities(
        &self,
        oldest: NaiveDate,
        newest: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ActivitySummary>>> + Send {
        async move {
            let start = Instant::now();
            let items: Vec<ActivityListItem> =
                self.get_json(&self.activities_url(oldest, newest)).await?;
            let listed = items.len();
            let summaries: Vec<ActivitySummary> =
                items.into_iter().filter_map(ActivityListItem::into_summary).collect();
            info!(
                "[RUST: list_activities] {}..{}: {} listed, {} with GPS ({} ms)",
                oldest,
                newest,
                listed,
                summaries.len(),
                elapsed_ms(start)
            );
            Ok(summaries)
        }
    }

    fn fetch_gps_stream(&self, activity_id: &str) -> impl Future<Output = Result<GpsStream>> + Send {
        let url = self.map_url(activity_id);
        async move {
            let data: MapApiResponse = self.get_json(&url).await?;
            Ok(data.into_stream())
        }
    }
}
