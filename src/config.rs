//! Startup configuration.
//!
//! Everything the service needs from the environment is read once in
//! [`AppConfig::from_env`] and handed to the components that need it.

use std::env;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use thiserror::Error;

use crate::domain::pricing::PricingPolicy;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UNPAID_ORDER_TIMEOUT_MINUTES: u64 = 60;
const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_MPESA_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const DEFAULT_AIRTEL_BASE_URL: &str = "https://openapiuat.airtel.africa";
const DEFAULT_STRIPE_BASE_URL: &str = "https://api.stripe.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// A value that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn reveal(&self) -> &T {
        &self.0
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl<T> Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub short_code: String,
    pub passkey: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct AirtelConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub country: String,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub base_url: String,
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Externally reachable base URL; provider callbacks are built from it.
    pub public_base_url: String,
    pub pricing: PricingPolicy,
    /// Pay-now orders without a payment after this long are cancelled.
    pub unpaid_order_timeout: chrono::Duration,
    pub expiry_sweep_interval: Duration,
    pub mpesa: Option<MpesaConfig>,
    pub airtel: Option<AirtelConfig>,
    pub stripe: Option<StripeConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let host = get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let defaults = PricingPolicy::default();
        let pricing = PricingPolicy {
            currency: get("CURRENCY").unwrap_or(defaults.currency),
            shipping_fee: parse_or("SHIPPING_FEE", get("SHIPPING_FEE"), defaults.shipping_fee)?,
            free_shipping_threshold: get("FREE_SHIPPING_THRESHOLD")
                .map(|v| parse::<BigDecimal>("FREE_SHIPPING_THRESHOLD", &v))
                .transpose()?,
            tax_rate: parse_or("TAX_RATE", get("TAX_RATE"), defaults.tax_rate)?,
            total_tolerance: parse_or(
                "TOTAL_TOLERANCE",
                get("TOTAL_TOLERANCE"),
                defaults.total_tolerance,
            )?,
        };

        let timeout_minutes: u64 = parse_or(
            "UNPAID_ORDER_TIMEOUT_MINUTES",
            get("UNPAID_ORDER_TIMEOUT_MINUTES"),
            DEFAULT_UNPAID_ORDER_TIMEOUT_MINUTES,
        )?;
        let unpaid_order_timeout = chrono::Duration::try_minutes(timeout_minutes as i64).ok_or(
            ConfigError::Invalid {
                name: "UNPAID_ORDER_TIMEOUT_MINUTES",
                value: timeout_minutes.to_string(),
            },
        )?;
        let sweep_secs: u64 = parse_or(
            "EXPIRY_SWEEP_INTERVAL_SECS",
            get("EXPIRY_SWEEP_INTERVAL_SECS"),
            DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS,
        )?;

        let mpesa = match (get("MPESA_CONSUMER_KEY"), get("MPESA_CONSUMER_SECRET")) {
            (Some(consumer_key), Some(consumer_secret)) => Some(MpesaConfig {
                base_url: get("MPESA_BASE_URL").unwrap_or_else(|| DEFAULT_MPESA_BASE_URL.to_string()),
                consumer_key,
                consumer_secret: Secret::new(consumer_secret),
                short_code: get("MPESA_SHORT_CODE").ok_or(ConfigError::Missing("MPESA_SHORT_CODE"))?,
                passkey: Secret::new(get("MPESA_PASSKEY").ok_or(ConfigError::Missing("MPESA_PASSKEY"))?),
            }),
            _ => None,
        };

        let airtel = match (get("AIRTEL_CLIENT_ID"), get("AIRTEL_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(AirtelConfig {
                base_url: get("AIRTEL_BASE_URL").unwrap_or_else(|| DEFAULT_AIRTEL_BASE_URL.to_string()),
                client_id,
                client_secret: Secret::new(client_secret),
                country: get("AIRTEL_COUNTRY").unwrap_or_else(|| "KE".to_string()),
                currency: get("AIRTEL_CURRENCY").unwrap_or_else(|| pricing.currency.clone()),
            }),
            _ => None,
        };

        let stripe = match get("STRIPE_SECRET_KEY") {
            Some(secret_key) => Some(StripeConfig {
                base_url: get("STRIPE_BASE_URL").unwrap_or_else(|| DEFAULT_STRIPE_BASE_URL.to_string()),
                secret_key: Secret::new(secret_key),
                webhook_secret: Secret::new(
                    get("STRIPE_WEBHOOK_SECRET").ok_or(ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,
                ),
            }),
            None => None,
        };

        Ok(Self {
            host,
            port,
            database_url,
            public_base_url,
            pricing,
            unpaid_order_timeout,
            expiry_sweep_interval: Duration::from_secs(sweep_secs),
            mpesa,
            airtel,
            stripe,
        })
    }

    pub fn callback_url(&self, provider: &str) -> String {
        format!("{}/payments/{provider}/callback", self.public_base_url)
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => parse(name, &v),
        None => Ok(default),
    }
}
