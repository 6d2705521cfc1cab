//! Safaricom M-Pesa (Daraja) STK push.
//!
//! Initiation sends a push prompt to the customer's phone. The response's
//! `CheckoutRequestID` is the correlation key; the asynchronous result
//! callback carries the same id under `Body.stkCallback`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::{DateTime, FixedOffset, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{decimal_from_json, CallbackError, InitiationRequest, PaymentProvider, ProviderAcceptance};
use crate::config::MpesaConfig;
use crate::domain::errors::DomainError;
use crate::domain::payment::{CallbackOutcome, CallbackResult, CorrelationKey, PaymentMethod};
use crate::domain::phone::normalize_msisdn;

const NAIROBI_OFFSET_SECS: i32 = 3 * 3600;

pub struct MpesaProvider {
    client: reqwest::Client,
    config: MpesaConfig,
    callback_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode", default)]
    result_code: Option<Value>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

impl CallbackMetadata {
    fn get(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|i| i.name == name)
            .and_then(|i| i.value.as_ref())
    }
}

/// `base64(short_code + passkey + timestamp)`
pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{short_code}{passkey}{timestamp}"))
}

/// Daraja wants local (EAT) time as `YYYYMMDDHHMMSS`.
pub fn stk_timestamp(now: DateTime<Utc>) -> String {
    let local = FixedOffset::east_opt(NAIROBI_OFFSET_SECS)
        .map(|offset| now.with_timezone(&offset).naive_local())
        .unwrap_or_else(|| now.naive_utc());
    local.format("%Y%m%d%H%M%S").to_string()
}

/// STK push only takes whole shillings; round up so the customer never underpays.
pub fn whole_units(amount: &BigDecimal) -> Result<u64, DomainError> {
    amount
        .with_scale_round(0, RoundingMode::Up)
        .to_u64()
        .filter(|a| *a > 0)
        .ok_or_else(|| DomainError::InvalidInput(format!("cannot charge {amount} via M-Pesa")))
}

fn result_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl MpesaProvider {
    pub fn new(client: reqwest::Client, config: MpesaConfig, callback_url: String) -> Self {
        Self {
            client,
            config,
            callback_url,
        }
    }

    async fn access_token(&self) -> Result<String, DomainError> {
        let response = self
            .client
            .get(format!("{}/oauth/v1/generate", self.config.base_url))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(&self.config.consumer_key, Some(self.config.consumer_secret.reveal()))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DomainError::Provider(format!(
                "M-Pesa token request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json::<TokenResponse>().await?.access_token)
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Mpesa
    }

    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::CheckoutRequestId
    }

    async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
        let phone = normalize_msisdn(&request.contact)?;
        let amount = whole_units(&request.amount)?;
        let token = self.access_token().await?;
        let timestamp = stk_timestamp(Utc::now());
        let body = StkPushRequest {
            business_short_code: &self.config.short_code,
            password: stk_password(&self.config.short_code, self.config.passkey.reveal(), &timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: &phone,
            party_b: &self.config.short_code,
            phone_number: &phone,
            callback_url: &self.callback_url,
            account_reference: &request.order_number,
            transaction_desc: format!("Payment for order {}", request.order_number),
        };
        debug!("Sending STK push for order {} ({amount})", request.order_number);

        let response = self
            .client
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let raw: Value = response.json().await?;
        let parsed: StkPushResponse = serde_json::from_value(raw.clone())
            .map_err(|e| DomainError::Provider(format!("unexpected STK push response: {e}")))?;

        match (status.is_success(), parsed.response_code.as_deref(), parsed.checkout_request_id) {
            (true, Some("0"), Some(checkout_request_id)) => Ok(ProviderAcceptance {
                reference: checkout_request_id,
                contact: phone,
                customer_message: parsed.customer_message,
                client_secret: None,
                raw,
            }),
            _ => {
                let reason = parsed
                    .error_message
                    .or(parsed.response_description)
                    .unwrap_or_else(|| format!("STK push rejected with status {status}"));
                warn!("M-Pesa rejected STK push for order {}: {reason}", request.order_number);
                Err(DomainError::Provider(reason))
            }
        }
    }

    fn parse_callback(&self, body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
        let raw: Value =
            serde_json::from_slice(body).map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let envelope: CallbackEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let callback = envelope.body.stk_callback;
        let reference = callback
            .checkout_request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CallbackError::Malformed("missing CheckoutRequestID".to_string()))?;
        let code = callback
            .result_code
            .as_ref()
            .and_then(result_code)
            .ok_or_else(|| CallbackError::Malformed("missing ResultCode".to_string()))?;

        let result = if code == 0 {
            let metadata = callback.callback_metadata;
            CallbackResult::Succeeded {
                amount: metadata
                    .as_ref()
                    .and_then(|m| m.get("Amount"))
                    .and_then(decimal_from_json),
                receipt: metadata
                    .as_ref()
                    .and_then(|m| m.get("MpesaReceiptNumber"))
                    .and_then(|v| v.as_str().map(str::to_string)),
            }
        } else {
            CallbackResult::Failed {
                reason: callback
                    .result_desc
                    .unwrap_or_else(|| format!("M-Pesa result code {code}")),
            }
        };
        Ok(Some(CallbackOutcome {
            provider: PaymentMethod::Mpesa,
            reference,
            attempt_id: None,
            result,
            raw,
        }))
    }

    fn acknowledgement(&self) -> Value {
        json!({ "ResultCode": 0, "ResultDesc": "Accepted" })
    }
}
