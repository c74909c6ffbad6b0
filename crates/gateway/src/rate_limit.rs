use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::VerifiedCredential;
use crate::errors::GatewayError;
use crate::identity::{remote_addr, IdentityKey};
use crate::metrics;

/// Sliding-window limiter: at most `limit` admissions per key within any
/// trailing `window`. A limit of zero disables limiting.
pub struct SlidingWindowLimiter {
    visitors: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            visitors: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut visitors = self.visitors.lock();
        let timestamps = visitors.entry(key.to_string()).or_default();
        prune(timestamps, now, self.window);
        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Admissions currently recorded for `key`, without pruning.
    pub fn window_len(&self, key: &str) -> usize {
        self.visitors.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn tracked_keys(&self) -> usize {
        self.visitors.lock().len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Prunes every key and forgets the ones left empty. Returns how many keys
    /// were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut visitors = self.visitors.lock();
        let before = visitors.len();
        visitors.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before - visitors.len()
    }

    /// Runs `sweep` every `window` until the returned handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let cancel = CancellationToken::new();
        let limiter = Arc::clone(self);
        let token = cancel.clone();
        let period = self.window.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = limiter.tracked_keys(), "rate limit sweep");
                        }
                    }
                }
            }
            info!("rate limit sweeper stopped");
        });
        SweepHandle { cancel, task }
    }
}

/// Keeps only timestamps strictly inside `(now - window, now]`.
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };
    while timestamps.front().is_some_and(|ts| *ts <= cutoff) {
        timestamps.pop_front();
    }
}

pub struct SweepHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            debug!(?err, "rate limit sweeper join failed");
        }
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<SlidingWindowLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = match req.extensions().get::<VerifiedCredential>() {
        Some(credential) => credential.identity().clone(),
        None => IdentityKey::from_remote(remote_addr(&req)),
    };
    if limiter.allow(key.as_str()) {
        next.run(req).await
    } else {
        debug!(key = %key, "rate limit exceeded");
        metrics::record_rate_limited();
        GatewayError::RateLimited.into_response()
    }
}
