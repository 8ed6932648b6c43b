//! Optional middlewares for API routers.

use crate::error::HttpError;
use crate::router::{ApiRequest, HandlerFuture, Middleware, Next};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Fixed-window rate limiter keyed by peer IP.
///
/// Requests beyond `max_requests` within `window` receive 429. Requests with
/// no known peer address share a single bucket.
pub struct RateLimit {
    max_requests: u32,
    window: Duration,
    buckets: Mutex<HashMap<Option<IpAddr>, (Instant, u32)>>,
}

impl RateLimit {
    /// Allow `max_requests` per `window` per client.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, key: Option<IpAddr>) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let entry = buckets.entry(key).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max_requests
    }
}

impl Middleware for RateLimit {
    fn handle(&self, req: ApiRequest, next: Next) -> HandlerFuture {
        if self.check(req.remote_ip) {
            next.run(req)
        } else {
            Box::pin(async { Err(HttpError::RateLimited) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ApiResponse, Router};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rate_limit_allows_then_rejects() {
        let router = Router::new()
            .layer(Arc::new(RateLimit::new(2, Duration::from_secs(60))))
            .get("/ping", |_req| async { Ok(ApiResponse::text("pong")) });

        for expected in [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
            let req = Request::builder()
                .method(Method::GET)
                .uri("/ping")
                .body(Body::empty())
                .unwrap();
            match router.handle(req, None).await {
                crate::router::RouterOutcome::Handled(resp) => {
                    assert_eq!(resp.status(), expected)
                }
                crate::router::RouterOutcome::Pass(_) => panic!("route should match"),
            }
        }
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimit::new(1, Duration::from_millis(0));
        assert!(limiter.check(None));
        // Zero-length window: every call starts a fresh window.
        assert!(limiter.check(None));
    }
}
