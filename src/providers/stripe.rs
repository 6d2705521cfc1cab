//! Stripe card payments via PaymentIntents.
//!
//! The PaymentIntent id is the correlation key; the payment id also travels
//! in the intent metadata for webhooks that outrun the create call. Webhooks are signed with the
//! endpoint secret (`Stripe-Signature: t=...,v1=...`); unsigned or stale
//! deliveries are refused before anything is parsed.

use async_trait::async_trait;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use super::{CallbackError, InitiationRequest, PaymentProvider, ProviderAcceptance};
use crate::config::StripeConfig;
use crate::domain::errors::DomainError;
use crate::domain::payment::{CallbackOutcome, CallbackResult, CorrelationKey, PaymentMethod};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeProvider {
    client: reqwest::Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: IntentObject,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripeError>,
    #[serde(default)]
    metadata: Option<IntentMetadata>,
}

#[derive(Debug, Deserialize)]
struct IntentMetadata {
    #[serde(default)]
    attempt_id: Option<String>,
}

/// Stripe amounts are integers in the currency's minor unit.
pub fn minor_units(amount: &BigDecimal) -> Result<i64, DomainError> {
    (amount * BigDecimal::from(100))
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
        .filter(|a| *a > 0)
        .ok_or_else(|| DomainError::InvalidInput(format!("cannot charge {amount} by card")))
}

/// Checks a `Stripe-Signature` header against `body` as of `now` (unix seconds).
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: &str,
    now: i64,
) -> Result<(), CallbackError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(CallbackError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(CallbackError::InvalidSignature);
    }
    let issued: i64 = timestamp.parse().map_err(|_| CallbackError::InvalidSignature)?;
    if (now - issued).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(CallbackError::InvalidSignature);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| CallbackError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let matches = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if matches {
        Ok(())
    } else {
        Err(CallbackError::InvalidSignature)
    }
}

impl StripeProvider {
    pub fn new(client: reqwest::Client, config: StripeConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::PaymentIntentId
    }

    async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
        let token = request.contact.trim();
        if token.is_empty() {
            return Err(DomainError::InvalidInput("a card payment method is required".to_string()));
        }
        let amount = minor_units(&request.amount)?;
        let form = [
            ("amount", amount.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("payment_method", token.to_string()),
            ("confirm", "true".to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("automatic_payment_methods[allow_redirects]", "never".to_string()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("metadata[order_number]", request.order_number.clone()),
            ("metadata[attempt_id]", request.attempt_id.to_string()),
        ];
        debug!("Creating PaymentIntent for order {} ({amount})", request.order_number);

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.config.base_url))
            .bearer_auth(self.config.secret_key.reveal())
            .header("Idempotency-Key", request.attempt_id.to_string())
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let raw: Value = response.json().await?;

        if !status.is_success() {
            let reason = serde_json::from_value::<StripeErrorBody>(raw.clone())
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| format!("Stripe rejected the payment with status {status}"));
            warn!("Stripe rejected payment for order {}: {reason}", request.order_number);
            return Err(DomainError::Provider(reason));
        }
        let intent: PaymentIntent = serde_json::from_value(raw.clone())
            .map_err(|e| DomainError::Provider(format!("unexpected Stripe response: {e}")))?;
        debug!(
            "PaymentIntent {} for order {} is {}",
            intent.id,
            request.order_number,
            intent.status.as_deref().unwrap_or("unknown")
        );
        Ok(ProviderAcceptance {
            reference: intent.id,
            contact: token.to_string(),
            customer_message: None,
            client_secret: intent.client_secret,
            raw,
        })
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some(SIGNATURE_HEADER)
    }

    fn verify_callback(&self, body: &[u8], signature: Option<&str>) -> Result<(), CallbackError> {
        let header = signature.ok_or(CallbackError::MissingSignature)?;
        verify_signature(
            self.config.webhook_secret.reveal(),
            body,
            header,
            Utc::now().timestamp(),
        )
    }

    fn parse_callback(&self, body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
        let raw: Value =
            serde_json::from_slice(body).map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let event: Event = serde_json::from_value(raw.clone())
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let object = event.data.object;

        let result = match event.event_type.as_str() {
            "payment_intent.succeeded" => CallbackResult::Succeeded {
                amount: object
                    .amount_received
                    .map(|minor| BigDecimal::new(minor.into(), 2)),
                receipt: object.latest_charge,
            },
            "payment_intent.payment_failed" => CallbackResult::Failed {
                reason: object
                    .last_payment_error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "card payment failed".to_string()),
            },
            other => {
                debug!("Ignoring Stripe event {other}");
                return Ok(None);
            }
        };
        let reference = object
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CallbackError::Malformed("missing data.object.id".to_string()))?;
        Ok(Some(CallbackOutcome {
            provider: PaymentMethod::Stripe,
            reference,
            attempt_id: object
                .metadata
                .and_then(|m| m.attempt_id)
                .and_then(|id| id.parse().ok()),
            result,
            raw,
        }))
    }

    fn acknowledgement(&self) -> Value {
        json!({ "received": true })
    }
}
