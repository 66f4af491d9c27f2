//! Sliding-window rate limiting
//!
//! `RateLimiter` keeps the request instants of each key inside the trailing
//! window and admits a request only while fewer than `limit` remain. All
//! admission decisions go through one mutex so concurrent requests on the
//! same key cannot overshoot the limit.
//!
//! `enforce` applies the limiter as axum middleware: stream-start requests
//! are counted against a stricter budget under `<ip>:chat`, everything else
//! under `<ip>`, and `/health` is exempt.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Header carrying the applied limit
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Header carrying the remaining budget
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request was admitted (and recorded)
    pub allowed: bool,
    /// Requests in the window, including this one when admitted
    pub current_count: usize,
    /// Time until the oldest request leaves the window; set on rejection
    pub retry_after: Option<Duration>,
}

impl Admission {
    /// Budget left in the window for the given limit.
    #[must_use]
    pub const fn remaining(&self, limit: usize) -> usize {
        limit.saturating_sub(self.current_count)
    }
}

#[derive(Debug)]
struct Windows {
    records: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

/// Per-key sliding-window counter store
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
    sweep_interval: Duration,
}

impl RateLimiter {
    /// Create a limiter that also sweeps lazily every `sweep_interval`.
    #[must_use]
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            windows: Mutex::new(Windows {
                records: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check and, if admitted, record a request for `key` now.
    pub fn check_and_record(&self, key: &str, limit: usize, window: Duration) -> Admission {
        self.check_and_record_at(key, limit, window, Instant::now())
    }

    /// Check and record at an explicit instant.
    pub fn check_and_record_at(
        &self,
        key: &str,
        limit: usize,
        window: Duration,
        now: Instant,
    ) -> Admission {
        let mut windows = self.lock();
        let window_start = now.checked_sub(window);

        if now.saturating_duration_since(windows.last_sweep) > self.sweep_interval {
            if let Some(cutoff) = window_start {
                purge_expired(&mut windows.records, cutoff);
            }
            windows.last_sweep = now;
        }

        let timestamps = windows.records.entry(key.to_string()).or_default();
        if let Some(cutoff) = window_start {
            while timestamps.front().is_some_and(|t| *t <= cutoff) {
                timestamps.pop_front();
            }
        }

        let current_count = timestamps.len();
        if current_count >= limit {
            let retry_after = timestamps.front().map_or(Duration::from_secs(1), |oldest| {
                ceil_secs((*oldest + window).saturating_duration_since(now))
            });
            return Admission {
                allowed: false,
                current_count,
                retry_after: Some(retry_after),
            };
        }

        timestamps.push_back(now);
        Admission {
            allowed: true,
            current_count: current_count + 1,
            retry_after: None,
        }
    }

    /// Drop every key whose window has fully expired. Returns how many went.
    pub fn sweep(&self, window: Duration) -> usize {
        self.sweep_at(window, Instant::now())
    }

    /// Sweep at an explicit instant.
    pub fn sweep_at(&self, window: Duration, now: Instant) -> usize {
        let mut windows = self.lock();
        windows.last_sweep = now;
        let Some(cutoff) = now.checked_sub(window) else {
            return 0;
        };
        purge_expired(&mut windows.records, cutoff)
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock().records.len()
    }

    /// Run `sweep` every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        window: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep(window);
                        debug!(removed, remaining = self.tracked_keys(), "rate limit sweep");
                    }
                }
            }
        })
    }
}

fn purge_expired(records: &mut HashMap<String, VecDeque<Instant>>, cutoff: Instant) -> usize {
    let before = records.len();
    records.retain(|_, timestamps| {
        timestamps.retain(|t| *t > cutoff);
        !timestamps.is_empty()
    });
    before - records.len()
}

fn ceil_secs(d: Duration) -> Duration {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

/// Budgets applied by the middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Requests per window for ordinary endpoints
    pub general: usize,
    /// Requests per window for stream-start requests
    pub chat: usize,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            general: 100,
            chat: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Middleware state
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Shared counter store
    pub limiter: Arc<RateLimiter>,
    /// Budgets
    pub limits: RateLimits,
}

/// Whether a request starts a session stream.
#[must_use]
pub fn is_stream_start(method: &Method, path: &str) -> bool {
    method == Method::POST && path.trim_end_matches('/').ends_with("/stream")
}

/// axum middleware enforcing the limits.
pub async fn enforce(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path.trim_end_matches('/') == "/health" {
        return next.run(request).await;
    }

    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());

    let (key, limit) = if is_stream_start(request.method(), &path) {
        (format!("{client}:chat"), state.limits.chat)
    } else {
        (client.clone(), state.limits.general)
    };

    let admission = state
        .limiter
        .check_and_record(&key, limit, state.limits.window);

    if !admission.allowed {
        let retry_after = admission
            .retry_after
            .unwrap_or(Duration::from_secs(1))
            .as_secs();
        warn!(client = %client, path = %path, retry_after, "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limited",
                "message": format!("Rate limit exceeded. Try again in {retry_after} seconds."),
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(limit));
        headers.insert(HeaderName::from_static(REMAINING_HEADER), HeaderValue::from(0_usize));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(admission.remaining(limit)),
    );
    response
}
