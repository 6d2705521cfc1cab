use async_trait::async_trait;
use serde_json::{json, Value};

use super::{CallbackError, InitiationRequest, PaymentProvider, ProviderAcceptance};
use crate::domain::errors::DomainError;
use crate::domain::payment::{CallbackOutcome, CorrelationKey, PaymentMethod};

/// Cash collected by the courier. Nothing leaves the process; the payment
/// record exists so that collection can be tracked like any other payment.
pub struct CashOnDeliveryProvider;

pub fn reference_for(order_number: &str) -> String {
    format!("COD-{order_number}")
}

#[async_trait]
impl PaymentProvider for CashOnDeliveryProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::CashOnDelivery
    }

    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::LocalReference
    }

    fn reference_in_advance(&self, request: &InitiationRequest) -> Option<String> {
        Some(reference_for(&request.order_number))
    }

    async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
        Ok(ProviderAcceptance {
            reference: reference_for(&request.order_number),
            contact: request.contact.clone(),
            customer_message: Some("Pay the courier on delivery".to_string()),
            client_secret: None,
            raw: json!({ "method": "cod", "order_number": request.order_number }),
        })
    }

    fn parse_callback(&self, _body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
        Err(CallbackError::Unsupported(PaymentMethod::CashOnDelivery))
    }

    fn acknowledgement(&self) -> Value {
        json!({ "received": true })
    }
}
