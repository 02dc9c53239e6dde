use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_GATEWAY: &str = "phonepe";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;
const CONFIG_DIR: &str = "config";

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_gateway() -> String {
    DEFAULT_GATEWAY.to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_salt_index() -> u32 {
    1
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

/// Checkout behaviour knobs.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// Gateway used when the caller does not pick one.
    #[serde(default = "default_gateway")]
    pub default_gateway: String,

    /// ISO currency code orders are priced in.
    #[validate(length(min = 3, max = 3, message = "Currency must be a 3-letter code"))]
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Compensation policy for the non-transactional gateway boundary: when
    /// the create-payment call fails after the order commit, restore the
    /// stock decremented for that order. Disabling this keeps
    /// reserved-but-abandoned semantics instead.
    #[serde(default = "default_true")]
    pub restock_on_gateway_failure: bool,

    /// Timeout applied to every outbound gateway call. A timed-out call is
    /// treated exactly like an explicit gateway failure.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            default_gateway: default_gateway(),
            currency: default_currency(),
            restock_on_gateway_failure: true,
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
        }
    }
}

/// Credentials and endpoints for the hosted-page redirect gateway.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PhonePeConfig {
    #[validate(length(min = 1, message = "Merchant id is required"))]
    pub merchant_id: String,

    /// Shared salt used in the X-VERIFY checksum.
    #[validate(length(min = 8, message = "Salt key must be at least 8 characters"))]
    pub salt_key: String,

    #[serde(default = "default_salt_index")]
    pub salt_index: u32,

    pub base_url: String,

    /// Where the customer lands after the hosted payment page.
    pub redirect_url: String,

    /// Server-to-server callback endpoint registered with the provider.
    pub callback_url: String,
}

/// Credentials for the order/signature gateway.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RazorpayConfig {
    #[validate(length(min = 1, message = "Key id is required"))]
    pub key_id: String,

    #[validate(length(min = 1, message = "Key secret is required"))]
    pub key_secret: String,

    /// Separate secret used for webhook HMAC verification.
    #[validate(length(min = 1, message = "Webhook secret is required"))]
    pub webhook_secret: String,

    pub base_url: String,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "Database URL is required"))]
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[validate]
    pub phonepe: PhonePeConfig,

    #[validate]
    pub razorpay: RazorpayConfig,
}

impl AppConfig {
    /// Loads configuration from layered sources: `config/default.toml`, an
    /// environment-specific overlay, and `APP__`-prefixed environment
    /// variables (highest precedence).
    pub fn load() -> Result<Self, ConfigError> {
        let environment = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder();

        let default_path = Path::new(CONFIG_DIR).join("default.toml");
        if default_path.exists() {
            builder = builder.add_source(File::from(default_path));
        }

        let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        }

        builder = builder.add_source(Environment::with_prefix("APP").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;

        config
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid configuration: {e}")))?;

        info!(environment = %environment, "Configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            environment: "test".into(),
            log_level: "debug".into(),
            checkout: CheckoutConfig::default(),
            phonepe: PhonePeConfig {
                merchant_id: "M_TEST".into(),
                salt_key: "test-salt-key".into(),
                salt_index: 1,
                base_url: "https://api-preprod.example.test".into(),
                redirect_url: "https://shop.example.test/payment/return".into(),
                callback_url: "https://shop.example.test/webhooks/phonepe".into(),
            },
            razorpay: RazorpayConfig {
                key_id: "rzp_test_key".into(),
                key_secret: "rzp_test_secret".into(),
                webhook_secret: "rzp_webhook_secret".into(),
                base_url: "https://api.razorpay.test".into(),
            },
        }
    }

    #[test]
    fn sample_config_validates() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn short_salt_key_is_rejected() {
        let mut cfg = sample_config();
        cfg.phonepe.salt_key = "short".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn checkout_defaults_restock_and_timeout() {
        let checkout = CheckoutConfig::default();
        assert!(checkout.restock_on_gateway_failure);
        assert_eq!(checkout.gateway_timeout_secs, 10);
        assert_eq!(checkout.default_gateway, "phonepe");
    }
}
