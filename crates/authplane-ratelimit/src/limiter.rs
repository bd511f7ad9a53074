//! Fixed-window admission over a [`SecondaryStorage`] counter.
//!
//! Rules resolve per request from three tiers: plugin rule sets in
//! registration order, the configured per-path rules, then the configured
//! default. Settings are read from the live configuration on every call so
//! hot updates apply without rebuilding the limiter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use authplane_config::{ConfigManager, PluginRateLimit, RateLimitRule, RequestMeta};
use authplane_storage::{SecondaryStorage, StorageError};
use tracing::{debug, warn};

use crate::error::{RateLimitError, RateLimitResult};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Rule that produced the decision; `None` when limiting did not apply.
    pub rule: Option<RateLimitRule>,
}

impl Decision {
    const fn unlimited() -> Self {
        Self {
            allowed: true,
            rule: None,
        }
    }
}

/// Stateless limiter; all counters live in the secondary store.
#[derive(Clone)]
pub struct RateLimiter {
    config: ConfigManager,
    storage: Arc<dyn SecondaryStorage>,
    plugin_rules: Arc<[PluginRateLimit]>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimiter")
            .field("plugin_rules", &self.plugin_rules.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build a limiter over `storage` with the given plugin rule sets.
    #[must_use]
    pub fn new(
        config: ConfigManager,
        storage: Arc<dyn SecondaryStorage>,
        plugin_rules: Vec<PluginRateLimit>,
    ) -> Self {
        Self {
            config,
            storage,
            plugin_rules: plugin_rules.into(),
        }
    }

    /// Resolve the rule applying to `request`.
    #[must_use]
    pub fn rule_for(&self, request: &RequestMeta) -> RateLimitRule {
        let plugin_rule = self
            .plugin_rules
            .iter()
            .filter(|limits| limits.enabled)
            .find_map(|limits| limits.rules.get(&request.path))
            .map(|source| source.resolve(request));
        if let Some(rule) = plugin_rule {
            return rule;
        }

        let config = self.config.config();
        config
            .rate_limit
            .custom_rules
            .get(&request.path)
            .copied()
            .unwrap_or_else(|| config.rate_limit.default_rule())
    }

    /// Whether the request counted under `key` may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] when the counter cannot be read
    /// or incremented.
    pub async fn allow(&self, key: &str, request: &RequestMeta) -> RateLimitResult<bool> {
        self.check(key, request)
            .await
            .map(|decision| decision.allowed)
    }

    /// Like [`RateLimiter::allow`] but also reports the rule applied.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] when the counter cannot be read
    /// or incremented.
    pub async fn check(&self, key: &str, request: &RequestMeta) -> RateLimitResult<Decision> {
        if !self.config.config().rate_limit.enabled {
            return Ok(Decision::unlimited());
        }
        let rule = self.rule_for(request);
        if rule.disabled {
            return Ok(Decision::unlimited());
        }

        let max = i64::try_from(rule.max).unwrap_or(i64::MAX);
        let count = self.current(key).await?;
        if count >= max {
            debug!(key, count, max, "rate limit reached");
            return Ok(Decision {
                allowed: false,
                rule: Some(rule),
            });
        }

        let next = self
            .storage
            .increment(key, Some(window_ttl(rule.window)))
            .await
            .map_err(|source| {
                warn!(key, error = %source, "rate limit counter increment failed");
                RateLimitError::Storage {
                    operation: "increment",
                    key: key.to_string(),
                    source,
                }
            })?;
        Ok(Decision {
            allowed: next <= max,
            rule: Some(rule),
        })
    }

    async fn current(&self, key: &str) -> RateLimitResult<i64> {
        match self.storage.get(key).await {
            Ok(Some(value)) => Ok(value.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %value, "ignoring non-numeric rate limit counter");
                0
            })),
            Ok(None) | Err(StorageError::NotFound { .. }) => Ok(0),
            Err(source) => Err(RateLimitError::Storage {
                operation: "get",
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Client address for `request`.
    ///
    /// Configured headers are consulted in order (first comma-separated
    /// entry, trimmed), then the host part of the peer address, then the
    /// peer address verbatim.
    #[must_use]
    pub fn client_ip(&self, request: &RequestMeta) -> String {
        let config = self.config.config();
        let from_header = config.rate_limit.ip.headers.iter().find_map(|name| {
            request
                .headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });
        if let Some(ip) = from_header {
            return ip.to_string();
        }

        request
            .remote_addr
            .as_deref()
            .map(|remote| {
                remote
                    .parse::<SocketAddr>()
                    .map_or_else(|_| remote.to_string(), |addr| addr.ip().to_string())
            })
            .unwrap_or_default()
    }

    /// Storage key for `client_key` under the configured prefix.
    #[must_use]
    pub fn build_key(&self, client_key: &str) -> String {
        format!("{}{client_key}", self.config.config().rate_limit.prefix)
    }
}

// A zero window would mean "never expires" to the store.
fn window_ttl(window: Duration) -> Duration {
    if window.is_zero() {
        Duration::from_secs(1)
    } else {
        window
    }
}
