//! Process settings read from the environment.

use std::path::{Path, PathBuf};

use authplane_config::Configuration;
use authplane_telemetry::LogFormat;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Port used when `AUTHPLANE_PORT` is unset.
pub const DEFAULT_PORT: u16 = 8080;
/// Configuration file consulted when `AUTHPLANE_CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "authplane.yaml";

/// Environment-derived settings for the standalone server.
#[derive(Debug, Clone)]
pub struct AppSettings {
    /// `DATABASE_URL`; without it everything runs in memory.
    pub database_url: Option<String>,
    /// `AUTHPLANE_PORT`.
    pub port: u16,
    /// `AUTHPLANE_CONFIG_PATH`.
    pub config_path: PathBuf,
    /// `AUTHPLANE_BASE_URL` override.
    pub base_url: Option<String>,
    /// `AUTHPLANE_SECRET` override.
    pub secret: Option<String>,
    /// `AUTHPLANE_ADMIN_API_KEY`; empty rejects every admin request.
    pub admin_api_key: String,
    /// `AUTHPLANE_LOG_FORMAT`.
    pub log_format: LogFormat,
}

impl AppSettings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidConfig`] when a value cannot be parsed.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidConfig`] when a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let port = match non_empty("AUTHPLANE_PORT") {
            Some(raw) => parse_port(&raw)?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            port,
            config_path: non_empty("AUTHPLANE_CONFIG_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from),
            base_url: non_empty("AUTHPLANE_BASE_URL"),
            secret: non_empty("AUTHPLANE_SECRET"),
            admin_api_key: lookup("AUTHPLANE_ADMIN_API_KEY").unwrap_or_default(),
            log_format: non_empty("AUTHPLANE_LOG_FORMAT")
                .map_or_else(LogFormat::infer, |value| LogFormat::parse(&value)),
        })
    }

    /// Initial configuration: the YAML file when present, then environment
    /// overrides.
    ///
    /// A missing or unreadable file yields the defaults.
    #[must_use]
    pub fn configuration(&self) -> Configuration {
        let mut config = load_file(&self.config_path);
        if let Some(base_url) = &self.base_url {
            config.base_url.clone_from(base_url);
        }
        if let Some(secret) = &self.secret {
            config.secret.clone_from(secret);
        }
        if let Some(url) = &self.database_url {
            config.database.connection_string.clone_from(url);
        }
        config
    }
}

fn parse_port(raw: &str) -> AppResult<u16> {
    let invalid = |reason| AppError::InvalidConfig {
        field: "AUTHPLANE_PORT",
        reason,
        value: Some(raw.to_string()),
    };
    match raw.trim().parse::<u16>() {
        Ok(0) => Err(invalid("zero")),
        Ok(port) => Ok(port),
        Err(_) => Err(invalid("not_a_port")),
    }
}

fn load_file(path: &Path) -> Configuration {
    let document = match std::fs::read_to_string(path) {
        Ok(document) => document,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no configuration file; using defaults");
            return Configuration::default();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read configuration file; using defaults");
            return Configuration::default();
        }
    };
    Configuration::from_yaml_str(&document).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = ?err, "failed to parse configuration file; using defaults");
        Configuration::default()
    })
}
