// Application configuration
// Reads the environment (after dotenv) into typed settings. Policy thresholds are
// business-tunable, so every one of them can be overridden with a POLICY_* variable.

use chrono::{Duration, FixedOffset};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Error raised when an environment value is present but unusable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set in environment")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which storage backend the service runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Thresholds and amounts used by the policy engine
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Bookings closer than this require advance payment
    pub payment_window_hours: i64,
    /// Cancellations at least this far ahead are refundable
    pub refund_window_hours: i64,
    /// Cancellations closer than this are refused
    pub cancel_cutoff_hours: i64,
    /// Arrival may be confirmed this many minutes either side of the appointment
    pub arrival_window_minutes: i64,
    pub auto_cancel_grace_minutes: i64,
    pub auto_complete_minutes: i64,
    pub deposit_rate: Decimal,
    pub deposit_min: Decimal,
    pub deposit_max: Decimal,
    /// Flat deposit when nothing is pre-ordered
    pub table_hold_deposit: Decimal,
    pub seats_per_table: i32,
    pub session_expiry_minutes: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            payment_window_hours: 24,
            refund_window_hours: 24,
            cancel_cutoff_hours: 2,
            arrival_window_minutes: 10,
            auto_cancel_grace_minutes: 15,
            auto_complete_minutes: 40,
            deposit_rate: Decimal::new(30, 2),
            deposit_min: Decimal::from(50_000),
            deposit_max: Decimal::from(5_000_000),
            table_hold_deposit: Decimal::from(100_000),
            seats_per_table: 6,
            session_expiry_minutes: 15,
        }
    }
}

impl PolicyConfig {
    /// Build policy settings from POLICY_* variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            payment_window_hours: env_or("POLICY_PAYMENT_WINDOW_HOURS", defaults.payment_window_hours)?,
            refund_window_hours: env_or("POLICY_REFUND_WINDOW_HOURS", defaults.refund_window_hours)?,
            cancel_cutoff_hours: env_or("POLICY_CANCEL_CUTOFF_HOURS", defaults.cancel_cutoff_hours)?,
            arrival_window_minutes: env_or("POLICY_ARRIVAL_WINDOW_MINUTES", defaults.arrival_window_minutes)?,
            auto_cancel_grace_minutes: env_or("POLICY_AUTO_CANCEL_MINUTES", defaults.auto_cancel_grace_minutes)?,
            auto_complete_minutes: env_or("POLICY_AUTO_COMPLETE_MINUTES", defaults.auto_complete_minutes)?,
            deposit_rate: env_or("POLICY_DEPOSIT_RATE", defaults.deposit_rate)?,
            deposit_min: env_or("POLICY_DEPOSIT_MIN", defaults.deposit_min)?,
            deposit_max: env_or("POLICY_DEPOSIT_MAX", defaults.deposit_max)?,
            table_hold_deposit: env_or("POLICY_TABLE_HOLD_DEPOSIT", defaults.table_hold_deposit)?,
            seats_per_table: env_or("POLICY_SEATS_PER_TABLE", defaults.seats_per_table)?,
            session_expiry_minutes: env_or("POLICY_SESSION_EXPIRY_MINUTES", defaults.session_expiry_minutes)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the policy engine meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deposit_rate <= Decimal::ZERO || self.deposit_rate > Decimal::ONE {
            return Err(ConfigError::Invalid {
                key: "POLICY_DEPOSIT_RATE",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if self.deposit_min <= Decimal::ZERO || self.deposit_min > self.deposit_max {
            return Err(ConfigError::Invalid {
                key: "POLICY_DEPOSIT_MIN",
                reason: "must be positive and not above POLICY_DEPOSIT_MAX".to_string(),
            });
        }
        if self.table_hold_deposit <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                key: "POLICY_TABLE_HOLD_DEPOSIT",
                reason: "must be positive".to_string(),
            });
        }
        if self.seats_per_table <= 0 {
            return Err(ConfigError::Invalid {
                key: "POLICY_SEATS_PER_TABLE",
                reason: "must be positive".to_string(),
            });
        }
        if self.cancel_cutoff_hours > self.refund_window_hours {
            return Err(ConfigError::Invalid {
                key: "POLICY_CANCEL_CUTOFF_HOURS",
                reason: "must not exceed POLICY_REFUND_WINDOW_HOURS".to_string(),
            });
        }
        let minutes = [
            ("POLICY_ARRIVAL_WINDOW_MINUTES", self.arrival_window_minutes),
            ("POLICY_AUTO_CANCEL_MINUTES", self.auto_cancel_grace_minutes),
            ("POLICY_AUTO_COMPLETE_MINUTES", self.auto_complete_minutes),
            ("POLICY_SESSION_EXPIRY_MINUTES", self.session_expiry_minutes),
        ];
        for (key, value) in minutes {
            if value <= 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::minutes(self.session_expiry_minutes)
    }
}

/// Merchant settings for the redirect payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub tmn_code: String,
    pub hash_secret: String,
    pub pay_url: String,
    pub return_url: String,
    /// Offset used for the gateway's local timestamps (yyyyMMddHHmmss)
    pub timezone: FixedOffset,
    pub version: String,
    pub locale: String,
    pub order_type: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let offset_hours: i32 = env_or("VNP_TIMEZONE_OFFSET_HOURS", 7)?;
        let timezone = FixedOffset::east_opt(offset_hours * 3600).ok_or(ConfigError::Invalid {
            key: "VNP_TIMEZONE_OFFSET_HOURS",
            reason: format!("{} is not a valid UTC offset", offset_hours),
        })?;

        Ok(Self {
            tmn_code: required("VNP_TMN_CODE")?,
            hash_secret: required("VNP_HASH_SECRET")?,
            pay_url: std::env::var("VNP_PAY_URL")
                .unwrap_or_else(|_| "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()),
            return_url: required("VNP_RETURN_URL")?,
            timezone,
            version: "2.1.0".to_string(),
            locale: std::env::var("VNP_LOCALE").unwrap_or_else(|_| "vn".to_string()),
            order_type: "other".to_string(),
        })
    }
}

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub db_statement_timeout_ms: u64,
    pub gateway_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub policy: PolicyConfig,
    pub gateway: GatewayConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = match std::env::var("BOOKING_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    key: "BOOKING_STORE",
                    reason: format!("unknown backend '{}'", other),
                })
            }
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let sweep_interval_secs: u64 = env_or("SWEEP_INTERVAL_SECS", 300)?;
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080)?,
            store,
            database_url,
            jwt_secret: required("JWT_SECRET")?,
            db_statement_timeout_ms: env_or("DB_STATEMENT_TIMEOUT_MS", 5_000)?,
            gateway_timeout_ms: env_or("GATEWAY_TIMEOUT_MS", 10_000)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30)?,
            sweep_interval_secs,
            policy: PolicyConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_policy_matches_business_constants() {
        let policy = PolicyConfig::default();
        assert_eq!(policy.payment_window_hours, 24);
        assert_eq!(policy.cancel_cutoff_hours, 2);
        assert_eq!(policy.auto_cancel_grace_minutes, 15);
        assert_eq!(policy.auto_complete_minutes, 40);
        assert_eq!(policy.arrival_window_minutes, 10);
        assert_eq!(policy.deposit_rate, dec!(0.30));
        assert_eq!(policy.deposit_min, dec!(50000));
        assert_eq!(policy.deposit_max, dec!(5000000));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_deposit_bounds() {
        let policy = PolicyConfig {
            deposit_min: dec!(6000000),
            ..PolicyConfig::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::Invalid { key: "POLICY_DEPOSIT_MIN", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_rate_above_one() {
        let policy = PolicyConfig {
            deposit_rate: dec!(1.5),
            ..PolicyConfig::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_seats() {
        let policy = PolicyConfig {
            seats_per_table: 0,
            ..PolicyConfig::default()
        };
        assert!(policy.validate().is_err());
    }
}
