use std::collections::HashMap;
use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Order management policy.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrderPolicyConfig {
    #[validate(range(min = 1, max = 10))]
    pub base_priority: u8,
    /// Orders strictly above this value get the high-value bump.
    pub high_value_threshold: Decimal,
    #[validate(length(min = 1))]
    pub metro_cities: Vec<String>,
    /// Priorities at or below this choose the fastest courier offer.
    #[validate(range(min = 1, max = 10))]
    pub high_priority_max: u8,
    #[validate(custom = "validate_positive_weight")]
    pub default_item_weight_kg: f64,
}

impl Default for OrderPolicyConfig {
    fn default() -> Self {
        Self {
            base_priority: 5,
            high_value_threshold: dec!(1000),
            metro_cities: vec!["riyadh".into(), "jeddah".into(), "dammam".into()],
            high_priority_max: 2,
            default_item_weight_kg: 0.5,
        }
    }
}

/// Address verification settings.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AddressConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
    /// Delivery GPS further than this from the cached coordinates flags the entry.
    #[validate(range(min = 1.0))]
    pub accuracy_threshold_meters: f64,
    /// Verifications waiting on a customer longer than this are reported stale.
    pub stale_after_minutes: i64,
    pub confirmation_template: String,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            accuracy_threshold_meters: 1000.0,
            stale_after_minutes: 240,
            confirmation_template: "Hello {name}, please confirm your delivery address for order \
                {order}: {address}. Reply YES to confirm or send the correct address."
                .to_string(),
        }
    }
}

/// Staging, manifest and supervisor settings.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchConfig {
    #[validate(range(min = 1))]
    pub manifest_batch_size: usize,
    #[validate(range(max = 23))]
    pub cutoff_hour: u32,
    #[validate(range(max = 59))]
    pub cutoff_minute: u32,
    /// Offset of the warehouse's local time from UTC.
    #[validate(custom = "validate_utc_offset")]
    pub utc_offset_hours: i32,
    /// Staging lane per courier (lower-case courier name).
    pub staging_areas: HashMap<String, String>,
    pub default_staging_area: String,
    #[validate(length(min = 1))]
    pub supervisor_phone: String,
    pub tracking_url_base: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let staging_areas = [("aramex", "STG-A"), ("smsa", "STG-B"), ("naqel", "STG-C")]
            .into_iter()
            .map(|(courier, area)| (courier.to_string(), area.to_string()))
            .collect();
        Self {
            manifest_batch_size: 10,
            cutoff_hour: 17,
            cutoff_minute: 0,
            utc_offset_hours: 3,
            staging_areas,
            default_staging_area: "STG-GENERAL".to_string(),
            supervisor_phone: "+966500000000".to_string(),
            tracking_url_base: "https://track.saylogix.example/t".to_string(),
        }
    }
}

/// Route planning estimates.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LastMileConfig {
    #[validate(range(min = 1))]
    pub max_stops_per_route: usize,
    pub km_per_stop: f64,
    pub minutes_per_stop: u32,
    #[validate(range(min = 1.0))]
    pub average_speed_kmh: f64,
}

impl Default for LastMileConfig {
    fn default() -> Self {
        Self {
            max_stops_per_route: 20,
            km_per_stop: 3.5,
            minutes_per_stop: 10,
            average_speed_kmh: 30.0,
        }
    }
}

/// Timeouts and retry budget for outbound collaborators.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IntegrationConfig {
    #[validate(range(min = 1))]
    pub call_timeout_ms: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    #[validate]
    pub orders: OrderPolicyConfig,

    #[serde(default)]
    #[validate]
    pub address: AddressConfig,

    #[serde(default)]
    #[validate]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    #[validate]
    pub last_mile: LastMileConfig,

    #[serde(default)]
    #[validate]
    pub integrations: IntegrationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            orders: OrderPolicyConfig::default(),
            address: AddressConfig::default(),
            dispatch: DispatchConfig::default(),
            last_mile: LastMileConfig::default(),
            integrations: IntegrationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("log_level");
            err.message = Some("log_level must be one of trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}

fn validate_positive_weight(weight: f64) -> Result<(), ValidationError> {
    if !weight.is_finite() || weight <= 0.0 {
        let mut err = ValidationError::new("default_item_weight_kg");
        err.message = Some("default_item_weight_kg must be a positive number".into());
        return Err(err);
    }
    Ok(())
}

fn validate_utc_offset(hours: i32) -> Result<(), ValidationError> {
    if !(-12..=14).contains(&hours) {
        let mut err = ValidationError::new("utc_offset_hours");
        err.message = Some("utc_offset_hours must be between -12 and 14".into());
        return Err(err);
    }
    Ok(())
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("saylogix={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads configuration from `./config`, the environment profile and `APP__` variables.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

pub fn load_config_from(dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("environment", run_env.as_str())?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(&run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(content: &str, filename: &str) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let mut file = std::fs::File::create(temp_dir.path().join(filename)).unwrap();
        writeln!(file, "{}", content).unwrap();
        temp_dir
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orders.base_priority, 5);
        assert_eq!(config.orders.high_value_threshold, dec!(1000));
        assert_eq!(config.dispatch.manifest_batch_size, 10);
        assert_eq!(config.dispatch.cutoff_hour, 17);
        assert_eq!(config.last_mile.max_stops_per_route, 20);
        assert_eq!(config.address.min_confidence, 0.8);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = write_config(
            r#"
            log_level = "debug"

            [dispatch]
            manifest_batch_size = 4
            cutoff_hour = 16

            [orders]
            high_value_threshold = 750
            "#,
            "default.toml",
        );

        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.dispatch.manifest_batch_size, 4);
        assert_eq!(config.dispatch.cutoff_hour, 16);
        assert_eq!(config.dispatch.cutoff_minute, 0);
        assert_eq!(config.orders.high_value_threshold, dec!(750));
        assert_eq!(config.orders.base_priority, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = write_config(
            r#"
            [dispatch]
            manifest_batch_size = 0
            "#,
            "default.toml",
        );
        let err = load_config_from(dir.path()).unwrap_err();
        assert!(matches!(err, AppConfigError::Validation(_)));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let config = AppConfig {
            log_level: "verbose".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_item_weight_is_rejected() {
        let mut config = AppConfig::default();
        config.orders.default_item_weight_kg = 0.0;
        assert!(config.validate().is_err());

        config.orders.default_item_weight_kg = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn utc_offset_outside_real_time_zones_is_rejected() {
        let dir = write_config(
            r#"
            [dispatch]
            utc_offset_hours = 15
            "#,
            "default.toml",
        );
        let err = load_config_from(dir.path()).unwrap_err();
        assert!(matches!(err, AppConfigError::Validation(_)));

        let mut config = AppConfig::default();
        config.dispatch.utc_offset_hours = -12;
        assert!(config.validate().is_ok());
    }
}
