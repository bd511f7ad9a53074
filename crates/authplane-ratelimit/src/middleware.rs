//! Axum middleware that runs every request through a [`RateLimiter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use authplane_config::RequestMeta;
use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::limiter::RateLimiter;

/// Header carrying the limit that rejected a request.
pub const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Callback invoked with the request path whenever a request is rejected.
pub type ThrottleHook = Arc<dyn Fn(&str) + Send + Sync>;

/// State for [`enforce_rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: RateLimiter,
    on_throttled: Option<ThrottleHook>,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimitState")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RateLimitState {
    /// Wrap `limiter` for use as middleware state.
    #[must_use]
    pub const fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            on_throttled: None,
        }
    }

    /// Invoke `hook` for every rejected request.
    #[must_use]
    pub fn with_throttle_hook(mut self, hook: ThrottleHook) -> Self {
        self.on_throttled = Some(hook);
        self
    }
}

/// Reject requests over their limit with `429` and limiter failures with `500`.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let meta = request_meta(&req);
    let key = state.limiter.build_key(&state.limiter.client_ip(&meta));

    match state.limiter.check(&key, &meta).await {
        Ok(decision) if decision.allowed => next.run(req).await,
        Ok(decision) => {
            if let Some(hook) = &state.on_throttled {
                hook(&meta.path);
            }
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "message": "rate limit exceeded" })),
            )
                .into_response();
            if let Some(rule) = decision.rule {
                insert_rate_limit_headers(response.headers_mut(), rule.max, rule.window);
            }
            response
        }
        Err(err) => {
            error!(error = %err, path = %meta.path, "rate limiter failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "rate-limit error" })),
            )
                .into_response()
        }
    }
}

fn request_meta(req: &Request<Body>) -> RequestMeta {
    let mut meta = RequestMeta::new(req.method().clone(), req.uri().path());
    meta.headers = req.headers().clone();
    meta.remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    meta
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u64, window: Duration) {
    headers.insert(HEADER_RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RETRY_AFTER, HeaderValue::from(window.as_secs().max(1)));
}
