//! Environment-derived worker configuration.
//!
//! The panel endpoint and key are required; startup fails without them.
//! Everything else has a built-in default that matches the worker's
//! documented behavior.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{default_service_map, BackoffPolicy, EngineConfig};
use crate::orders::ServiceType;

/// Default per-attempt timeout for panel HTTP calls.
pub const DEFAULT_PANEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors raised while reading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set in environment")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {message}")]
    InvalidVar { var: &'static str, message: String },
}

/// Panel connection settings.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Where order rows live.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// REST backend (`ORDERS_API_URL` + `ORDERS_API_KEY`)
    Rest { api_url: String, api_key: String },
    /// In-process map; orders do not survive a restart
    Memory,
}

/// How callers are authenticated.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    /// Validate bearer tokens against an identity provider's user endpoint
    Http { api_url: String, api_key: String },
    /// Shared static token (`WORKER_API_TOKEN`)
    Static { token: String },
}

/// Full worker configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub panel: PanelConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub port: u16,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = require_var("PANEL_API_URL")?;
        let api_key = require_var("PANEL_API_KEY")?;

        let panel = PanelConfig {
            api_url,
            api_key,
            timeout: duration_var("PANEL_TIMEOUT_SECS", DEFAULT_PANEL_TIMEOUT, Duration::from_secs)?,
        };

        let engine = EngineConfig {
            service_map: service_map_var("PANEL_SERVICE_MAP")?,
            sweep_workers: parsed_var("SWEEP_WORKERS", 8usize)?,
            sweep_pacing: duration_var(
                "SWEEP_PACING_MS",
                Duration::from_millis(100),
                Duration::from_millis,
            )?,
            sweep_budget: duration_var(
                "SWEEP_BUDGET_SECS",
                Duration::from_secs(300),
                Duration::from_secs,
            )?,
            backoff: BackoffPolicy::default(),
        };

        let store = match std::env::var("ORDERS_API_URL") {
            Ok(api_url) if !api_url.is_empty() => StoreConfig::Rest {
                api_url,
                api_key: require_var("ORDERS_API_KEY")?,
            },
            _ => StoreConfig::Memory,
        };

        let auth = match std::env::var("AUTH_API_URL") {
            Ok(api_url) if !api_url.is_empty() => AuthConfig::Http {
                api_url,
                api_key: require_var("AUTH_API_KEY")?,
            },
            _ => AuthConfig::Static {
                token: std::env::var("WORKER_API_TOKEN").unwrap_or_default(),
            },
        };

        Ok(Self {
            panel,
            engine,
            store,
            auth,
            port: parsed_var("PORT", 8080u16)?,
        })
    }
}

fn require_var(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn parsed_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            var,
            message: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn duration_var(
    var: &'static str,
    default: Duration,
    from_units: fn(u64) -> Duration,
) -> Result<Duration, ConfigError> {
    Ok(match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => {
            let units: u64 = raw.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidVar {
                    var,
                    message: e.to_string(),
                }
            })?;
            from_units(units)
        }
        _ => default,
    })
}

/// Parse `followers=1,likes=2,...` into the service map, falling back to the
/// built-in mapping when unset. Partial overrides replace only the listed
/// entries.
fn service_map_var(var: &'static str) -> Result<HashMap<ServiceType, String>, ConfigError> {
    let mut map = default_service_map();
    let raw = match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => raw,
        _ => return Ok(map),
    };

    for pair in raw.split(',') {
        let (service, id) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidVar {
                var,
                message: format!("expected service=id, got '{pair}'"),
            })?;
        let service: ServiceType =
            service
                .trim()
                .parse()
                .map_err(|e: String| ConfigError::InvalidVar { var, message: e })?;
        map.insert(service, id.trim().to_string());
    }
    Ok(map)
}
