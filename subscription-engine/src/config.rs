//! Configuration for subscription-engine.

use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

use crate::models::{Cap, PlanLimits, Resource};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: String,
    pub database: DatabaseConfig,
    pub billing: BillingPolicy,
    pub scheduler: SchedulerConfig,
    pub payment_gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Billing rules the engine applies. Nothing here is hardcoded in the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingPolicy {
    pub trial_length_days: i64,
    pub grace_period_days: i64,
    pub payment_timeout_secs: u64,
    /// Caps for resources a plan does not mention.
    pub default_limits: PlanLimits,
    pub default_currency: String,
}

impl BillingPolicy {
    pub fn trial_length(&self) -> chrono::Duration {
        chrono::Duration::days(self.trial_length_days)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.grace_period_days)
    }

    pub fn payment_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.trial_length_days < 0 {
            return Err(format!(
                "TRIAL_LENGTH_DAYS must not be negative, got {}",
                self.trial_length_days
            ));
        }
        if self.grace_period_days < 0 {
            return Err(format!(
                "GRACE_PERIOD_DAYS must not be negative, got {}",
                self.grace_period_days
            ));
        }
        Ok(())
    }
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            trial_length_days: 14,
            grace_period_days: 7,
            payment_timeout_secs: 30,
            default_limits: PlanLimits::default(),
            default_currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub batch_size: i64,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size < 1 {
            return Err(format!(
                "ROLLER_BATCH_SIZE must be at least 1, got {}",
                self.batch_size
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
}

impl EngineConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common_config = core_config::Config::load()?;

        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let config = EngineConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("subscription-engine"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_env("OTLP_ENDPOINT", Some("http://tempo:4317"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            billing: BillingPolicy {
                trial_length_days: parse_env("TRIAL_LENGTH_DAYS", "14", is_prod)?,
                grace_period_days: parse_env("GRACE_PERIOD_DAYS", "7", is_prod)?,
                payment_timeout_secs: parse_env("PAYMENT_TIMEOUT_SECS", "30", is_prod)?,
                default_limits: parse_default_limits(&get_env(
                    "DEFAULT_LIMITS",
                    Some(""),
                    is_prod,
                )?)
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
                default_currency: get_env("DEFAULT_CURRENCY", Some("USD"), is_prod)?,
            },
            scheduler: SchedulerConfig {
                enabled: parse_env("ROLLER_ENABLED", "true", is_prod)?,
                tick_secs: parse_env("ROLLER_TICK_SECS", "60", is_prod)?,
                batch_size: parse_env("ROLLER_BATCH_SIZE", "100", is_prod)?,
            },
            payment_gateway: GatewayConfig {
                base_url: get_env(
                    "PAYMENT_GATEWAY_URL",
                    Some("http://payment-service:8080"),
                    is_prod,
                )?,
            },
        };

        config
            .billing
            .validate()
            .and_then(|_| config.scheduler.validate())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        Ok(config)
    }
}

/// Parse `resource=cap` pairs separated by commas. `unlimited` (or `null`)
/// marks a resource as uncapped.
pub fn parse_default_limits(raw: &str) -> Result<PlanLimits, String> {
    let mut limits = PlanLimits::default();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid default limit entry: {}", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Missing resource name in: {}", pair));
        }

        let cap = match value.trim().to_ascii_lowercase().as_str() {
            "unlimited" | "null" => Cap::Unlimited,
            number => Cap::Limited(
                number
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid cap for {}: {}", key, value.trim()))?,
            ),
        };
        limits.set(Resource::from(key), cap);
    }

    Ok(limits)
}

fn parse_env<T: FromStr>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError> {
    let raw = get_env(key, Some(default), is_prod)?;
    raw.trim().parse::<T>().map_err(|_| {
        AppError::ConfigError(anyhow::anyhow!(format!("{} has invalid value: {}", key, raw)))
    })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}
