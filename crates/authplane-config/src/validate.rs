//! Validation rules applied before a configuration is accepted.

use std::time::Duration;

use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{Configuration, MEMORY_TRANSPORT, RateLimitRule};

/// Longest accepted rate-limit window.
pub const MAX_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Check every rule, returning the first violation.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] naming the offending field.
pub fn validate(config: &Configuration) -> ConfigResult<()> {
    ensure_non_empty("app_name", &config.app_name)?;
    validate_base_url(&config.base_url)?;
    validate_base_path(&config.base_path)?;
    if config.secret.is_empty() {
        return Err(ConfigError::validation("secret", "must_not_be_empty", None));
    }
    ensure_positive_duration("session.expires_in", config.session.expires_in)?;
    validate_password_bounds(config)?;
    validate_rate_limit(config)?;
    if config.event_bus.max_concurrent_handlers == 0 {
        return Err(ConfigError::validation(
            "event_bus.max_concurrent_handlers",
            "must_be_at_least_one",
            Some("0".to_string()),
        ));
    }
    validate_transport(config)?;
    Ok(())
}

/// Without a host-supplied transport only the bundled one can be built.
fn validate_transport(config: &Configuration) -> ConfigResult<()> {
    let transport = &config.event_bus.transport;
    if config.event_bus.pubsub.is_none() && transport != MEMORY_TRANSPORT {
        return Err(ConfigError::validation(
            "event_bus.transport",
            "unsupported_transport",
            Some(transport.clone()),
        ));
    }
    Ok(())
}

fn ensure_non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::validation(field, "must_not_be_empty", None));
    }
    Ok(())
}

fn ensure_positive_duration(field: &str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::validation(
            field,
            "must_be_positive",
            Some("0".to_string()),
        ));
    }
    Ok(())
}

fn validate_base_url(value: &str) -> ConfigResult<()> {
    let url = Url::parse(value).map_err(|_| {
        ConfigError::validation("base_url", "must_be_absolute_url", Some(value.to_string()))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::validation(
            "base_url",
            "unsupported_scheme",
            Some(value.to_string()),
        ));
    }
    Ok(())
}

fn validate_base_path(value: &str) -> ConfigResult<()> {
    if value.is_empty() || value.starts_with('/') {
        Ok(())
    } else {
        Err(ConfigError::validation(
            "base_path",
            "must_start_with_slash",
            Some(value.to_string()),
        ))
    }
}

fn validate_password_bounds(config: &Configuration) -> ConfigResult<()> {
    let section = &config.email_password;
    if section.min_password_length == 0 {
        return Err(ConfigError::validation(
            "email_password.min_password_length",
            "must_be_at_least_one",
            Some("0".to_string()),
        ));
    }
    if section.min_password_length > section.max_password_length {
        return Err(ConfigError::validation(
            "email_password.max_password_length",
            "must_not_be_below_minimum",
            Some(section.max_password_length.to_string()),
        ));
    }
    Ok(())
}

fn ensure_window(field: &str, value: Duration) -> ConfigResult<()> {
    ensure_positive_duration(field, value)?;
    if value > MAX_RATE_LIMIT_WINDOW {
        return Err(ConfigError::validation(
            field,
            "too_large",
            Some(format!("{}s", value.as_secs())),
        ));
    }
    Ok(())
}

fn validate_rate_limit(config: &Configuration) -> ConfigResult<()> {
    let section = &config.rate_limit;
    if !section.enabled {
        return Ok(());
    }
    ensure_window("rate_limit.window", section.window)?;
    if section.max == 0 {
        return Err(ConfigError::validation(
            "rate_limit.max",
            "must_be_positive",
            Some("0".to_string()),
        ));
    }
    ensure_non_empty("rate_limit.prefix", &section.prefix)?;
    for (path, rule) in &section.custom_rules {
        validate_rule(&format!("rate_limit.custom_rules.{path}"), rule)?;
    }
    Ok(())
}

/// Check the bounds of an enabled rule.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when the window or max is zero, or
/// the window exceeds [`MAX_RATE_LIMIT_WINDOW`].
pub fn validate_rule(field: &str, rule: &RateLimitRule) -> ConfigResult<()> {
    if rule.disabled {
        return Ok(());
    }
    ensure_window(&format!("{field}.window"), rule.window)?;
    if rule.max == 0 {
        return Err(ConfigError::validation(
            format!("{field}.max"),
            "must_be_positive",
            Some("0".to_string()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use authplane_events::{InMemoryPubSub, PubSub};

    use super::*;
    use crate::hooks::Shared;

    fn valid() -> Configuration {
        Configuration {
            secret: "s3cret".into(),
            ..Configuration::default()
        }
    }

    fn reason_for(config: &Configuration) -> (String, &'static str) {
        match validate(config).expect_err("should fail") {
            ConfigError::Validation { field, reason, .. } => (field, reason),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn defaults_with_secret_are_valid() {
        validate(&valid()).expect("valid");
        let (field, reason) = reason_for(&Configuration::default());
        assert_eq!((field.as_str(), reason), ("secret", "must_not_be_empty"));
    }

    #[test]
    fn rejects_bad_urls_and_paths() {
        let mut config = valid();
        config.base_url = "localhost:8080".into();
        assert_eq!(reason_for(&config).0, "base_url");

        config.base_url = "ftp://example.com".into();
        assert_eq!(reason_for(&config).1, "unsupported_scheme");

        let mut config = valid();
        config.base_path = "auth".into();
        assert_eq!(reason_for(&config).0, "base_path");

        config.base_path = String::new();
        validate(&config).expect("empty base path is allowed");
    }

    #[test]
    fn rejects_inverted_password_bounds() {
        let mut config = valid();
        config.email_password.min_password_length = 20;
        config.email_password.max_password_length = 10;
        assert_eq!(
            reason_for(&config).0,
            "email_password.max_password_length"
        );
    }

    #[test]
    fn rate_limit_rules_only_checked_when_enabled() {
        let mut config = valid();
        config.rate_limit.max = 0;
        assert_eq!(reason_for(&config).0, "rate_limit.max");

        config.rate_limit.enabled = false;
        validate(&config).expect("disabled limiter skips checks");

        let mut config = valid();
        config
            .rate_limit
            .custom_rules
            .insert("/sign-in".into(), RateLimitRule::new(Duration::ZERO, 3));
        assert_eq!(
            reason_for(&config).0,
            "rate_limit.custom_rules./sign-in.window"
        );

        config
            .rate_limit
            .custom_rules
            .insert("/sign-in".into(), RateLimitRule::unlimited());
        validate(&config).expect("disabled rule skips checks");
    }

    #[test]
    fn rejects_zero_handler_limit() {
        let mut config = valid();
        config.event_bus.max_concurrent_handlers = 0;
        assert_eq!(
            reason_for(&config).1,
            "must_be_at_least_one"
        );
    }

    #[test]
    fn rejects_windows_past_the_upper_bound() {
        let too_long = MAX_RATE_LIMIT_WINDOW + Duration::from_secs(1);

        let mut config = valid();
        config.rate_limit.window = too_long;
        let (field, reason) = reason_for(&config);
        assert_eq!((field.as_str(), reason), ("rate_limit.window", "too_large"));

        config.rate_limit.window = MAX_RATE_LIMIT_WINDOW;
        validate(&config).expect("the bound itself is accepted");

        config
            .rate_limit
            .custom_rules
            .insert("/sign-in".into(), RateLimitRule::new(Duration::MAX, 3));
        let (field, reason) = reason_for(&config);
        assert_eq!(
            (field.as_str(), reason),
            ("rate_limit.custom_rules./sign-in.window", "too_large")
        );

        let err = validate_rule("plugins.mfa./verify", &RateLimitRule::new(too_long, 1))
            .expect_err("plugin rule window too large");
        assert!(matches!(err, ConfigError::Validation { reason: "too_large", .. }));
    }

    #[test]
    fn unsupported_transports_need_a_host_pubsub() {
        let mut config = valid();
        config.event_bus.transport = "kafka".into();
        let (field, reason) = reason_for(&config);
        assert_eq!(
            (field.as_str(), reason),
            ("event_bus.transport", "unsupported_transport")
        );

        let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new());
        config.event_bus.pubsub = Some(Shared::from_arc(pubsub));
        validate(&config).expect("host-supplied transport may carry any name");
    }
}
