//! Server configuration

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Apply pending migrations before serving
    pub run_migrations: bool,
    /// Empty means no cross-origin access
    pub cors_allowed_origins: Vec<String>,
    /// Bearer token required on `/billing/v1`
    pub service_token: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let service_token = env::var("BILLING_SERVICE_TOKEN")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("BILLING_SERVICE_TOKEN"))?;

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let run_migrations = match env::var("RUN_MIGRATIONS") {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                value: v,
            })?,
            Err(_) => true,
        };

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let log_format = match env::var("LOG_FORMAT") {
            Ok(v) => LogFormat::parse(&v).ok_or(ConfigError::Invalid {
                name: "LOG_FORMAT",
                value: v,
            })?,
            Err(_) => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            bind_address,
            run_migrations,
            cors_allowed_origins,
            service_token,
            log_format,
        })
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
