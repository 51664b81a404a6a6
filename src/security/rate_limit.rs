//! Sliding-window rate limiting per client IP.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{
    Response,
    context::Context,
    middleware::{BoxResponseFuture, Middleware, Next},
};

/// Allows at most `limit` requests per client IP in any `window`.
///
/// Each client keeps the timestamps of its requests inside the current
/// window, so the limit holds over every window-sized interval rather than
/// resetting on fixed boundaries. Clients idle for longer than
/// [`idle_ttl`](Self::idle_ttl) are forgotten by
/// [`evict_stale`](Self::evict_stale), which [`spawn_cleanup`](Self::spawn_cleanup)
/// runs periodically.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    idle_ttl: Duration,
    visitors: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            idle_ttl: window,
            visitors: Mutex::new(HashMap::new()),
        }
    }

    /// How long a client may go without requests before cleanup forgets it.
    /// Defaults to the window. Values below the window are raised to it, since
    /// forgetting a client with hits still inside the window would reset its
    /// limit.
    #[must_use]
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl.max(self.window);
        self
    }

    fn visitors(&self) -> MutexGuard<'_, HashMap<IpAddr, VecDeque<Instant>>> {
        self.visitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a request from `ip` now. `Err` carries how long until the
    /// client may retry.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        let mut visitors = self.visitors();
        let hits = visitors.entry(ip).or_default();
        while hits
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            hits.pop_front();
        }

        if hits.len() < self.limit {
            hits.push_back(now);
            return Ok(());
        }
        let oldest = hits.front().copied().unwrap_or(now);
        Err(self
            .window
            .saturating_sub(now.saturating_duration_since(oldest)))
    }

    /// Forgets clients whose latest request is older than the idle TTL.
    /// Returns how many were dropped.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let mut visitors = self.visitors();
        let before = visitors.len();
        visitors.retain(|_, hits| {
            hits.back()
                .is_some_and(|&t| now.saturating_duration_since(t) < self.idle_ttl)
        });
        before - visitors.len()
    }

    /// Number of clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.visitors().len()
    }

    /// Runs [`evict_stale`](Self::evict_stale) every `every` until the
    /// limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let evicted = limiter.evict_stale();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = limiter.tracked(), "rate limiter cleanup");
                }
            }
        })
    }
}

/// Answers `429 Too Many Requests` with `Retry-After` once a client exceeds
/// the shared [`RateLimiter`].
///
/// Clients are keyed by [`Request::remote_addr`](crate::Request::remote_addr);
/// put [`TrustedProxyMiddleware`](crate::middleware::TrustedProxyMiddleware)
/// first when running behind a proxy.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let ip = ctx.request().remote_addr().ip();
        match self.limiter.check(ip) {
            Ok(()) => next.run(ctx),
            Err(retry_after) => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                tracing::warn!(client = %ip, retry_after = secs, "rate limit exceeded");
                Box::pin(async move { Response::too_many_requests(secs.max(1)) })
            }
        }
    }
}
