//! Control-plane HTTP surface: health, metrics, runtime configuration
//! updates and plugin routes mounted under the base path.

use std::sync::Arc;
use std::time::Duration;

use authplane_config::{ConfigError, ConfigManager};
use authplane_events::{Event, EventBus};
use authplane_ratelimit::{RateLimitState, RateLimiter, enforce_rate_limit};
use authplane_telemetry::{Metrics, build_sha};
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Span, error, info, warn};

/// Header carrying the admin key.
pub const HEADER_API_KEY: &str = "x-api-key";
const HEADER_REQUEST_ID: &str = "x-request-id";
/// Event published after a successful configuration update.
pub const EVENT_CONFIG_UPDATED: &str = "config.updated";

/// State shared by the control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live configuration.
    pub config: ConfigManager,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Internal event bus.
    pub bus: EventBus,
    /// Key required on admin routes; empty rejects everything.
    pub admin_api_key: Arc<str>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// JSON error body.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: &'static str,
    field: Option<String>,
}

impl ApiError {
    const fn new(status: StatusCode, message: &'static str) -> Self {
        Self {
            status,
            message,
            field: None,
        }
    }

    const fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    const fn internal(message: &'static str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn invalid(field: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "invalid configuration",
            field: Some(field.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.field {
            Some(field) => json!({ "message": self.message, "field": field }),
            None => json!({ "message": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Assemble the full router for one server generation.
#[must_use]
pub fn build_router(
    state: AppState,
    plugin_routes: Router,
    limiter: RateLimiter,
    base_path: &str,
) -> Router {
    let throttle_metrics = state.metrics.clone();
    let rate_limit = RateLimitState::new(limiter).with_throttle_hook(Arc::new(move |path: &str| {
        throttle_metrics.inc_rate_limit_throttled(path);
    }));
    let auth_routes =
        plugin_routes.layer(middleware::from_fn_with_state(rate_limit, enforce_rate_limit));

    let admin = Router::new()
        .route("/admin/config", patch(patch_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ));
    let control = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .merge(admin)
        .with_state(state.clone());

    let mount = base_path.trim_end_matches('/');
    let router = if mount.is_empty() {
        control.merge(auth_routes)
    } else {
        control.nest(mount, auth_routes)
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get(HEADER_REQUEST_ID)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                route = %request.uri().path(),
                request_id = %request_id,
                build_sha = %build_sha(),
                status_code = tracing::field::Empty,
                latency_ms = tracing::field::Empty
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &Span| {
            span.record("status_code", response.status().as_u16());
            let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
            span.record("latency_ms", latency_ms);
        });

    router.layer(
        ServiceBuilder::new()
            .layer(authplane_telemetry::propagate_request_id_layer())
            .layer(authplane_telemetry::set_request_id_layer())
            .layer(trace_layer)
            .layer(middleware::from_fn_with_state(state, record_http_metrics)),
    )
}

async fn record_http_metrics(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let route = req.extensions().get::<MatchedPath>().map_or_else(
        || req.uri().path().to_string(),
        |matched| matched.as_str().to_string(),
    );
    let response = next.run(req).await;
    state
        .metrics
        .inc_http_request(&route, response.status().as_u16());
    response
}

pub(crate) async fn require_admin_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(HEADER_API_KEY)
        .and_then(|value| value.to_str().ok());
    match provided {
        Some(key)
            if !state.admin_api_key.is_empty()
                && constant_time_eq(key.as_bytes(), state.admin_api_key.as_bytes()) =>
        {
            Ok(next.run(req).await)
        }
        _ => {
            warn!(path = %req.uri().path(), "rejected admin request");
            Err(ApiError::unauthorized())
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    app_name: String,
    build: &'static str,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app_name: state.config.config().app_name.clone(),
        build: build_sha(),
    })
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state.metrics.render().map_err(|err| {
        error!(error = %err, "failed to render metrics");
        ApiError::internal("failed to render metrics")
    })?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .map_err(|err| {
            error!(error = %err, "failed to build metrics response");
            ApiError::internal("failed to build metrics response")
        })
}

/// Body of `PATCH /admin/config`.
#[derive(Debug, Deserialize)]
pub(crate) struct ConfigPatch {
    key: String,
    value: Value,
}

#[derive(Debug, Serialize)]
struct ConfigPatchResponse {
    key: String,
    requires_restart: bool,
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<ConfigPatchResponse>, ApiError> {
    let previous = state.config.config();
    let updated = state
        .config
        .update(&patch.key, patch.value)
        .await
        .map_err(|err| {
            state.metrics.inc_config_update_failure();
            map_config_error(&patch.key, err)
        })?;
    let requires_restart = ConfigManager::requires_restart(&previous, &updated);
    info!(key = %patch.key, requires_restart, "configuration patched");

    if updated.event_bus.enabled {
        let event = Event::new(
            EVENT_CONFIG_UPDATED,
            json!({ "key": patch.key, "requires_restart": requires_restart }),
        )
        .with_metadata("source", "admin_api");
        match state.bus.publish(&event).await {
            Ok(_) => state.metrics.inc_event_published(EVENT_CONFIG_UPDATED),
            Err(err) => warn!(error = %err, "failed to publish configuration update"),
        }
    }

    Ok(Json(ConfigPatchResponse {
        key: patch.key,
        requires_restart,
    }))
}

fn map_config_error(key: &str, err: ConfigError) -> ApiError {
    match err {
        ConfigError::Validation { field, .. } | ConfigError::InvalidField { field, .. } => {
            ApiError::invalid(field)
        }
        other => {
            error!(error = ?other, key, "configuration update failed");
            ApiError::internal("configuration update failed")
        }
    }
}
