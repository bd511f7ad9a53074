//! Prometheus-backed metrics registry and snapshot helpers.

use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    events_published_total: IntCounterVec,
    pubsub_queue_depth: IntGauge,
    pubsub_subscribers: IntGauge,
    pubsub_dropped_total: IntGauge,
    rate_limit_throttled_total: IntCounterVec,
    config_update_failures_total: IntCounter,
    config_reloads_total: IntCounter,
    config_apply_latency_ms: IntGauge,
    server_restarts_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Messages currently buffered in subscriber queues.
    pub pubsub_queue_depth: i64,
    /// Live subscriber channels.
    pub pubsub_subscribers: i64,
    /// Messages dropped because a subscriber queue was full.
    pub pubsub_dropped_total: i64,
    /// Configuration updates rejected or failed.
    pub config_update_failures_total: u64,
    /// Configuration snapshots applied from the watcher.
    pub config_reloads_total: u64,
    /// Latest time taken to apply a configuration snapshot (ms).
    pub config_apply_latency_ms: i64,
    /// Listener restarts triggered by configuration changes.
    pub server_restarts_total: u64,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Construct a registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = register(
            &registry,
            "http_requests_total",
            IntCounterVec::new(
                Opts::new("http_requests_total", "Total HTTP requests received"),
                &["route", "code"],
            ),
        )?;
        let events_published_total = register(
            &registry,
            "events_published_total",
            IntCounterVec::new(
                Opts::new("events_published_total", "Events published on the bus by type"),
                &["type"],
            ),
        )?;
        let pubsub_queue_depth = register(
            &registry,
            "pubsub_queue_depth",
            IntGauge::with_opts(Opts::new(
                "pubsub_queue_depth",
                "Messages buffered across subscriber queues",
            )),
        )?;
        let pubsub_subscribers = register(
            &registry,
            "pubsub_subscribers",
            IntGauge::with_opts(Opts::new("pubsub_subscribers", "Live subscriber channels")),
        )?;
        let pubsub_dropped_total = register(
            &registry,
            "pubsub_dropped_total",
            IntGauge::with_opts(Opts::new(
                "pubsub_dropped_total",
                "Messages dropped because a subscriber queue was full",
            )),
        )?;
        let rate_limit_throttled_total = register(
            &registry,
            "rate_limit_throttled_total",
            IntCounterVec::new(
                Opts::new(
                    "rate_limit_throttled_total",
                    "Requests rejected by the rate limiter",
                ),
                &["path"],
            ),
        )?;
        let config_update_failures_total = register(
            &registry,
            "config_update_failures_total",
            IntCounter::with_opts(Opts::new(
                "config_update_failures_total",
                "Configuration updates rejected or failed",
            )),
        )?;
        let config_reloads_total = register(
            &registry,
            "config_reloads_total",
            IntCounter::with_opts(Opts::new(
                "config_reloads_total",
                "Configuration snapshots applied from the watcher",
            )),
        )?;
        let config_apply_latency_ms = register(
            &registry,
            "config_apply_latency_ms",
            IntGauge::with_opts(Opts::new(
                "config_apply_latency_ms",
                "Time taken to apply a configuration snapshot (ms)",
            )),
        )?;
        let server_restarts_total = register(
            &registry,
            "server_restarts_total",
            IntCounter::with_opts(Opts::new(
                "server_restarts_total",
                "Listener restarts triggered by configuration changes",
            )),
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                events_published_total,
                pubsub_queue_depth,
                pubsub_subscribers,
                pubsub_dropped_total,
                rate_limit_throttled_total,
                config_update_failures_total,
                config_reloads_total,
                config_apply_latency_ms,
                server_restarts_total,
            }),
        })
    }

    /// Count an HTTP response for `route` with `status`.
    pub fn inc_http_request(&self, route: &str, status: u16) {
        self.inner
            .http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Count a published event of `event_type`.
    pub fn inc_event_published(&self, event_type: &str) {
        self.inner
            .events_published_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Record the pub/sub transport's queue statistics.
    pub fn record_pubsub(&self, queued: usize, subscribers: usize, dropped: u64) {
        self.inner.pubsub_queue_depth.set(saturate(queued));
        self.inner.pubsub_subscribers.set(saturate(subscribers));
        self.inner
            .pubsub_dropped_total
            .set(i64::try_from(dropped).unwrap_or(i64::MAX));
    }

    /// Count a request rejected on `path`.
    pub fn inc_rate_limit_throttled(&self, path: &str) {
        self.inner
            .rate_limit_throttled_total
            .with_label_values(&[path])
            .inc();
    }

    /// Count a failed configuration update.
    pub fn inc_config_update_failure(&self) {
        self.inner.config_update_failures_total.inc();
    }

    /// Count a configuration snapshot applied from the watcher.
    pub fn inc_config_reload(&self) {
        self.inner.config_reloads_total.inc();
    }

    /// Record how long applying a configuration snapshot took.
    pub fn observe_config_apply_latency(&self, duration: Duration) {
        self.inner
            .config_apply_latency_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Count a listener restart.
    pub fn inc_server_restart(&self) {
        self.inner.server_restarts_total.inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the output is not UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Point-in-time snapshot of the gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pubsub_queue_depth: self.inner.pubsub_queue_depth.get(),
            pubsub_subscribers: self.inner.pubsub_subscribers.get(),
            pubsub_dropped_total: self.inner.pubsub_dropped_total.get(),
            config_update_failures_total: self.inner.config_update_failures_total.get(),
            config_reloads_total: self.inner.config_reloads_total.get(),
            config_apply_latency_ms: self.inner.config_apply_latency_ms.get(),
            server_restarts_total: self.inner.server_restarts_total.get(),
        }
    }

    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

fn register<C>(
    registry: &Registry,
    name: &'static str,
    collector: prometheus::Result<C>,
) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    let collector =
        collector.map_err(|source| TelemetryError::MetricsCollector { name, source })?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}

fn saturate(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
