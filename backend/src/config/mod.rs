//! # Configuration Module
//!
//! This module handles loading and validating configuration from
//! environment variables. All settings are centralized here and passed
//! explicitly into each service at construction.
//!
//! ## Usage
//!
//! ```rust,ignore
//! dotenvy::dotenv().ok();
//! let config = AppConfig::from_env()?;
//! println!("Payment expiry: {}s", config.payment_expiry_secs);
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATABASE_URL` | PostgreSQL connection string | unset (in-memory store) |
//! | `SERVER_HOST` | HTTP server host | `127.0.0.1` |
//! | `SERVER_PORT` | HTTP server port | `8080` |
//! | `PAYMENT_EXPIRY_SECS` | Payment deadline | `600` |
//! | `LOCKOUT_THRESHOLD` | Failed attempts before lockout | `5` |
//! | `OTP_MAX_SENDS_PER_HOUR` | OTP issuance limit per phone | `10` |
//! | `STRIPE_SECRET_KEY` | Gateway API key | unset (mock gateway) |
//! | `EXPOSE_DEBUG_SECRETS` | Echo OTP codes / tokens in responses | `false` |

use std::env;
use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

use crate::services::lockout::LockoutPolicy;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is missing
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Failed to parse a value
    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

/// Application configuration loaded from environment variables.
///
/// `Default` carries the production defaults; `from_env` overrides them
/// with whatever is set in the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // ==========================================
    // DATABASE SETTINGS
    // ==========================================

    /// PostgreSQL connection URL.
    ///
    /// When absent the service runs on the in-memory store, which is
    /// only suitable for local development.
    pub database_url: Option<String>,

    /// Maximum connections in the pool.
    pub database_pool_size: usize,

    // ==========================================
    // SERVER SETTINGS
    // ==========================================

    /// HTTP server host address.
    pub server_host: String,

    /// HTTP server port number.
    pub server_port: u16,

    /// Tracing filter directive, e.g. `info` or `sports_booking_backend=debug`.
    pub log_level: String,

    // ==========================================
    // RESERVATION POLICY
    // ==========================================

    /// Minimum lead time before slot start for a cancellation.
    pub cancellation_window_hours: i64,

    /// Minimum lead time before slot start for a refund.
    pub refund_window_hours: i64,

    // ==========================================
    // PAYMENT SETTINGS
    // ==========================================

    /// Seconds a freshly created (or regenerated) payment stays processable.
    pub payment_expiry_secs: i64,

    /// How often the expiry sweeper runs.
    pub payment_sweep_interval_secs: u64,

    /// How far past its deadline a pending payment must be before the
    /// sweeper marks it expired.
    pub payment_sweep_grace_secs: i64,

    /// ISO currency code used in payment references and gateway intents.
    pub currency: String,

    /// Beneficiary UPI id rendered into QR payment references.
    pub merchant_upi_id: String,

    /// Beneficiary display name rendered into QR payment references.
    pub merchant_name: String,

    /// Gateway secret key. `None` selects the mock gateway.
    pub stripe_secret_key: Option<String>,

    /// Gateway API base URL.
    pub stripe_api_base: String,

    /// Shared secret for webhook signatures.
    pub stripe_webhook_secret: String,

    // ==========================================
    // SECURITY SETTINGS
    // ==========================================

    /// Failed attempts after which a payment, OTP or user is locked.
    pub lockout_threshold: i32,

    /// OTP validity window in seconds.
    pub otp_ttl_secs: i64,

    /// OTP issuances allowed per phone in any rolling hour.
    pub otp_max_sends_per_hour: i64,

    /// Admin credential expected in `X-Admin-Key`. `None` disables admin routes.
    pub admin_api_key: Option<String>,

    /// Include OTP codes and security tokens in API responses.
    /// Never enable outside development.
    pub expose_debug_secrets: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_pool_size: 16,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            log_level: "info".to_string(),
            cancellation_window_hours: 2,
            refund_window_hours: 24,
            payment_expiry_secs: 600,
            payment_sweep_interval_secs: 60,
            payment_sweep_grace_secs: 3600,
            currency: "INR".to_string(),
            merchant_upi_id: "sportsclub@upi".to_string(),
            merchant_name: "SportsClub".to_string(),
            stripe_secret_key: None,
            stripe_api_base: "https://api.stripe.com".to_string(),
            stripe_webhook_secret: String::new(),
            lockout_threshold: 5,
            otp_ttl_secs: 600,
            otp_max_sends_per_hour: 10,
            admin_api_key: None,
            expose_debug_secrets: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Use `dotenvy::dotenv()` before calling this to load from `.env` file.
    ///
    /// ## Returns
    ///
    /// - `Ok(AppConfig)` - Configuration loaded successfully
    /// - `Err(ConfigError)` - A variable is present but invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            database_url: get_optional_env("DATABASE_URL"),
            database_pool_size: parse_env("DATABASE_POOL_SIZE", defaults.database_pool_size)?,

            server_host: get_env_or_default("SERVER_HOST", &defaults.server_host),
            server_port: parse_env("SERVER_PORT", defaults.server_port)?,
            log_level: get_env_or_default("LOG_LEVEL", &defaults.log_level),

            cancellation_window_hours: parse_env(
                "CANCELLATION_WINDOW_HOURS",
                defaults.cancellation_window_hours,
            )?,
            refund_window_hours: parse_env("REFUND_WINDOW_HOURS", defaults.refund_window_hours)?,

            payment_expiry_secs: parse_env("PAYMENT_EXPIRY_SECS", defaults.payment_expiry_secs)?,
            payment_sweep_interval_secs: parse_env(
                "PAYMENT_SWEEP_INTERVAL_SECS",
                defaults.payment_sweep_interval_secs,
            )?,
            payment_sweep_grace_secs: parse_env(
                "PAYMENT_SWEEP_GRACE_SECS",
                defaults.payment_sweep_grace_secs,
            )?,
            currency: get_env_or_default("CURRENCY", &defaults.currency),
            merchant_upi_id: get_env_or_default("MERCHANT_UPI_ID", &defaults.merchant_upi_id),
            merchant_name: get_env_or_default("MERCHANT_NAME", &defaults.merchant_name),
            stripe_secret_key: get_optional_env("STRIPE_SECRET_KEY"),
            stripe_api_base: get_env_or_default("STRIPE_API_BASE", &defaults.stripe_api_base),
            stripe_webhook_secret: get_env_or_default("STRIPE_WEBHOOK_SECRET", ""),

            lockout_threshold: parse_env("LOCKOUT_THRESHOLD", defaults.lockout_threshold)?,
            otp_ttl_secs: parse_env("OTP_TTL_SECS", defaults.otp_ttl_secs)?,
            otp_max_sends_per_hour: parse_env(
                "OTP_MAX_SENDS_PER_HOUR",
                defaults.otp_max_sends_per_hour,
            )?,
            admin_api_key: get_optional_env("ADMIN_API_KEY"),
            expose_debug_secrets: parse_env("EXPOSE_DEBUG_SECRETS", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would silently weaken security.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lockout_threshold < 1 {
            return Err(ConfigError::InvalidValue(
                "LOCKOUT_THRESHOLD".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.payment_expiry_secs <= 0 || self.otp_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_EXPIRY_SECS/OTP_TTL_SECS".to_string(),
                "must be positive".to_string(),
            ));
        }
        if self.stripe_secret_key.is_some() && self.stripe_webhook_secret.is_empty() {
            return Err(ConfigError::MissingEnvVar("STRIPE_WEBHOOK_SECRET".to_string()));
        }
        Ok(())
    }

    /// The shared lockout policy for payments, OTPs and users.
    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy::new(self.lockout_threshold)
    }

    pub fn payment_expiry(&self) -> Duration {
        Duration::seconds(self.payment_expiry_secs)
    }

    pub fn payment_sweep_grace(&self) -> Duration {
        Duration::seconds(self.payment_sweep_grace_secs)
    }

    pub fn otp_ttl(&self) -> Duration {
        Duration::seconds(self.otp_ttl_secs)
    }

    pub fn cancellation_window(&self) -> Duration {
        Duration::hours(self.cancellation_window_hours)
    }

    pub fn refund_window(&self) -> Duration {
        Duration::hours(self.refund_window_hours)
    }
}

/// Get an optional environment variable, treating empty values as unset.
fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Get an environment variable with a default value.
///
/// Returns the default if the variable is not set.
fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::ParseError(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_or_default() {
        let value = get_env_or_default("NONEXISTENT_VAR_12345", "default_value");
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_parse_env_falls_back_when_unset() {
        let value: i64 = parse_env("NONEXISTENT_NUMERIC_VAR_12345", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        std::env::set_var("BOOKING_TEST_BAD_PORT", "not-a-port");
        let result: Result<u16, _> = parse_env("BOOKING_TEST_BAD_PORT", 8080);
        assert!(matches!(result, Err(ConfigError::ParseError(key, _)) if key == "BOOKING_TEST_BAD_PORT"));
        std::env::remove_var("BOOKING_TEST_BAD_PORT");
    }

    #[test]
    fn test_defaults_match_policy() {
        let config = AppConfig::default();
        assert_eq!(config.lockout_threshold, 5);
        assert_eq!(config.payment_expiry(), Duration::minutes(10));
        assert_eq!(config.otp_ttl(), Duration::minutes(10));
        assert_eq!(config.cancellation_window(), Duration::hours(2));
        assert_eq!(config.refund_window(), Duration::hours(24));
        assert!(!config.expose_debug_secrets);
    }

    #[test]
    fn test_gateway_key_requires_webhook_secret() {
        let config = AppConfig {
            stripe_secret_key: Some("sk_test_123".to_string()),
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnvVar(_))));
    }
}
