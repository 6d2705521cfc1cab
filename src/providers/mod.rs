//! Payment provider adapters.
//!
//! Each provider translates an order into its own payment request and parses
//! its own callbacks. Adapters never mark anything as paid; they only report
//! that the provider accepted the request. Money is confirmed by the
//! reconciler when the callback arrives.

pub mod airtel;
pub mod cod;
pub mod mpesa;
pub mod stripe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::errors::DomainError;
use crate::domain::payment::{CallbackOutcome, CorrelationKey, PaymentMethod};

pub use airtel::AirtelProvider;
pub use cod::CashOnDeliveryProvider;
pub use mpesa::MpesaProvider;
pub use stripe::StripeProvider;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything an adapter needs to ask for money.
#[derive(Debug, Clone)]
pub struct InitiationRequest {
    /// Id the payment record will be stored under. Providers that accept a
    /// client-generated reference or an idempotency key use it.
    pub attempt_id: Uuid,
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: BigDecimal,
    pub currency: String,
    /// Phone number for mobile money, payment-method token for cards.
    pub contact: String,
}

/// The provider accepted the request. This is not proof of payment.
#[derive(Debug, Clone)]
pub struct ProviderAcceptance {
    /// Value of the provider's correlation key.
    pub reference: String,
    /// Contact as the provider was given it, e.g. the normalized msisdn.
    pub contact: String,
    pub customer_message: Option<String>,
    pub client_secret: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback signature is missing")]
    MissingSignature,
    #[error("callback signature is invalid")]
    InvalidSignature,
    #[error("malformed callback: {0}")]
    Malformed(String),
    #[error("{0} does not send callbacks")]
    Unsupported(PaymentMethod),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// The provider field that links a callback to its payment.
    fn correlation_key(&self) -> CorrelationKey;

    /// The correlation value, for providers that take it from us rather than
    /// issuing one.
    fn reference_in_advance(&self, _request: &InitiationRequest) -> Option<String> {
        None
    }

    async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError>;

    /// Header carrying the callback signature, for providers that sign.
    fn signature_header(&self) -> Option<&'static str> {
        None
    }

    /// Providers without signatures accept everything; that gap is theirs.
    fn verify_callback(&self, _body: &[u8], _signature: Option<&str>) -> Result<(), CallbackError> {
        Ok(())
    }

    /// `Ok(None)` means the callback is valid but irrelevant to reconciliation.
    fn parse_callback(&self, body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError>;

    /// Fixed body the provider expects in response to a callback.
    fn acknowledgement(&self) -> Value;
}

impl From<reqwest::Error> for DomainError {
    fn from(e: reqwest::Error) -> Self {
        DomainError::Provider(e.to_string())
    }
}

pub fn http_client() -> Result<reqwest::Client, DomainError> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| DomainError::Internal(format!("could not build HTTP client: {e}")))
}

/// Lookup table from payment method to adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.method(), provider);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned()
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        self.providers.keys().copied().collect()
    }

    /// Registers cash-on-delivery plus every provider that has credentials.
    pub fn from_config(config: &AppConfig) -> Result<Self, DomainError> {
        let client = http_client()?;
        let mut registry = Self::new().with(Arc::new(CashOnDeliveryProvider));
        if let Some(mpesa) = &config.mpesa {
            registry = registry.with(Arc::new(MpesaProvider::new(
                client.clone(),
                mpesa.clone(),
                config.callback_url(PaymentMethod::Mpesa.as_str()),
            )));
        }
        if let Some(airtel) = &config.airtel {
            registry = registry.with(Arc::new(AirtelProvider::new(client.clone(), airtel.clone())));
        }
        if let Some(stripe) = &config.stripe {
            registry = registry.with(Arc::new(StripeProvider::new(client, stripe.clone())));
        }
        Ok(registry)
    }
}

/// Parses a JSON number or numeric string into a decimal.
pub(crate) fn decimal_from_json(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
