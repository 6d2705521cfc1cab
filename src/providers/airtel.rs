//! Airtel Money merchant payments (USSD push).
//!
//! Airtel echoes back the transaction id we choose, so the payment attempt id
//! doubles as the correlation key.

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CallbackError, InitiationRequest, PaymentProvider, ProviderAcceptance};
use crate::config::AirtelConfig;
use crate::domain::errors::DomainError;
use crate::domain::payment::{CallbackOutcome, CallbackResult, CorrelationKey, PaymentMethod};
use crate::domain::phone::{national_number, normalize_msisdn};

const SUCCESS_STATUS: &str = "TS";

pub struct AirtelProvider {
    client: reqwest::Client,
    config: AirtelConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseStatus {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    #[serde(default)]
    status: ResponseStatus,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    transaction: CallbackTransaction,
}

#[derive(Debug, Deserialize)]
struct CallbackTransaction {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    airtel_money_id: Option<String>,
}

pub fn transaction_id(request: &InitiationRequest) -> String {
    request.attempt_id.simple().to_string()
}

impl AirtelProvider {
    pub fn new(client: reqwest::Client, config: AirtelConfig) -> Self {
        Self { client, config }
    }

    async fn access_token(&self) -> Result<String, DomainError> {
        let response = self
            .client
            .post(format!("{}/auth/oauth2/token", self.config.base_url))
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret.reveal(),
                "grant_type": "client_credentials",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DomainError::Provider(format!(
                "Airtel token request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json::<TokenResponse>().await?.access_token)
    }
}

#[async_trait]
impl PaymentProvider for AirtelProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Airtel
    }

    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::TransactionId
    }

    fn reference_in_advance(&self, request: &InitiationRequest) -> Option<String> {
        Some(transaction_id(request))
    }

    async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
        let msisdn = normalize_msisdn(&request.contact)?;
        let reference = transaction_id(request);
        let token = self.access_token().await?;
        debug!("Requesting Airtel payment {reference} for order {}", request.order_number);

        let response = self
            .client
            .post(format!("{}/merchant/v1/payments/", self.config.base_url))
            .bearer_auth(token)
            .header("X-Country", &self.config.country)
            .header("X-Currency", &self.config.currency)
            .json(&json!({
                "reference": request.order_number,
                "subscriber": {
                    "country": self.config.country,
                    "currency": self.config.currency,
                    "msisdn": national_number(&msisdn),
                },
                "transaction": {
                    "amount": request.amount.to_string(),
                    "country": self.config.country,
                    "currency": self.config.currency,
                    "id": reference,
                },
            }))
            .send()
            .await?;
        let http_status = response.status();
        let raw: Value = response.json().await?;
        let parsed: PaymentResponse = serde_json::from_value(raw.clone())
            .map_err(|e| DomainError::Provider(format!("unexpected Airtel response: {e}")))?;

        if http_status.is_success() && parsed.status.success {
            Ok(ProviderAcceptance {
                reference,
                contact: msisdn,
                customer_message: parsed.status.message,
                client_secret: None,
                raw,
            })
        } else {
            let reason = parsed
                .status
                .message
                .unwrap_or_else(|| format!("Airtel rejected the payment with status {http_status}"));
            warn!("Airtel rejected payment for order {}: {reason}", request.order_number);
            Err(DomainError::Provider(reason))
        }
    }

    fn parse_callback(&self, body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
        let raw: Value =
            serde_json::from_slice(body).map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let envelope: CallbackEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let transaction = envelope.transaction;
        let reference = transaction
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CallbackError::Malformed("missing transaction.id".to_string()))?;
        let status = transaction
            .status_code
            .ok_or_else(|| CallbackError::Malformed("missing transaction.status_code".to_string()))?;

        let result = if status == SUCCESS_STATUS {
            CallbackResult::Succeeded {
                amount: None,
                receipt: transaction.airtel_money_id,
            }
        } else {
            CallbackResult::Failed {
                reason: transaction
                    .message
                    .unwrap_or_else(|| format!("Airtel status {status}")),
            }
        };
        Ok(Some(CallbackOutcome {
            provider: PaymentMethod::Airtel,
            reference,
            attempt_id: None,
            result,
            raw,
        }))
    }

    fn acknowledgement(&self) -> Value {
        json!({ "status": "success" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use bigdecimal::BigDecimal;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> AirtelProvider {
        AirtelProvider::new(
            reqwest::Client::new(),
            AirtelConfig {
                base_url: base_url.to_string(),
                client_id: "client".to_string(),
                client_secret: Secret::new("secret".to_string()),
                country: "KE".to_string(),
                currency: "KES".to_string(),
            },
        )
    }

    fn request() -> InitiationRequest {
        InitiationRequest {
            attempt_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            order_number: "ORD-260101-XYZ789".to_string(),
            amount: BigDecimal::from(2050),
            currency: "KES".to_string(),
            contact: "+254 733 123 456".to_string(),
        }
    }

    #[tokio::test]
    async fn accepted_payment_uses_our_transaction_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "expires_in": "180", "token_type": "bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/merchant/v1/payments/"))
            .and(header("X-Country", "KE"))
            .and(header("X-Currency", "KES"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "transaction": { "id": "ignored", "status": "Success." } },
                "status": { "code": "200", "message": "Success.", "result_code": "ESB000010", "success": true }
            })))
            .mount(&server)
            .await;

        let req = request();
        let acceptance = provider(&server.uri()).initiate(&req).await.unwrap();
        assert_eq!(acceptance.reference, req.attempt_id.simple().to_string());

        let received = server.received_requests().await.unwrap();
        let payment: Value = received
            .iter()
            .find(|r| r.url.path() == "/merchant/v1/payments/")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .unwrap();
        assert_eq!(payment["subscriber"]["msisdn"], json!("733123456"));
        assert_eq!(payment["transaction"]["id"], json!(acceptance.reference));
        assert_eq!(payment["reference"], json!("ORD-260101-XYZ789"));
    }

    #[tokio::test]
    async fn token_failure_is_a_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/oauth2/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = provider(&server.uri()).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, DomainError::Provider(_)));
    }

    #[test]
    fn ts_status_is_success() {
        let body = json!({ "transaction": {
            "id": "abc123", "message": "Paid", "status_code": "TS", "airtel_money_id": "MP210603.1234.L06941"
        }});
        let outcome = provider("http://unused")
            .parse_callback(body.to_string().as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(outcome.reference, "abc123");
        assert_eq!(
            outcome.result,
            CallbackResult::Succeeded {
                amount: None,
                receipt: Some("MP210603.1234.L06941".to_string())
            }
        );
    }

    #[test]
    fn other_statuses_are_failures() {
        let body = json!({ "transaction": {
            "id": "abc123", "message": "Insufficient funds", "status_code": "TF"
        }});
        let outcome = provider("http://unused")
            .parse_callback(body.to_string().as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome.result,
            CallbackResult::Failed {
                reason: "Insufficient funds".to_string()
            }
        );
    }

    #[test]
    fn callback_without_id_is_malformed() {
        let body = json!({ "transaction": { "status_code": "TS" } });
        assert!(matches!(
            provider("http://unused").parse_callback(body.to_string().as_bytes()),
            Err(CallbackError::Malformed(_))
        ));
    }
}
