use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;

use super::reconciler::{Reconciler, Reconciliation};
use crate::domain::payment::{CallbackResult, CorrelationKey, PaymentMethod};
use crate::providers::{CallbackError, PaymentProvider, ProviderRegistry};

#[derive(Debug, Error)]
pub enum CallbackRejection {
    #[error("no callback endpoint for '{0}'")]
    UnknownProvider(String),
    #[error(transparent)]
    Rejected(#[from] CallbackError),
}

/// A verified callback: the body to send back right away and the work to do
/// after the provider has its answer.
pub struct AcceptedCallback {
    pub acknowledgement: Value,
    pub job: CallbackJob,
}

pub struct CallbackJob {
    provider: Arc<dyn PaymentProvider>,
    reconciler: Arc<Reconciler>,
    body: Vec<u8>,
}

impl CallbackJob {
    /// Parses and reconciles. Failures are logged; the provider already got
    /// its acknowledgement and nobody is waiting for a result.
    pub async fn run(self) -> Option<Reconciliation> {
        let method = self.provider.method();
        let outcome = match self.provider.parse_callback(&self.body) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                debug!("Ignoring {method} callback with nothing to reconcile");
                return None;
            }
            Err(e) => {
                warn!("Dropping {method} callback: {e}");
                return None;
            }
        };
        let reference = outcome.reference.clone();
        let reported_success = matches!(outcome.result, CallbackResult::Succeeded { .. });
        match self.reconciler.reconcile(outcome).await {
            Ok(Reconciliation::Unmatched) => {
                let field = self.provider.correlation_key().field_name();
                if reported_success {
                    error!(
                        "Unmatched successful {method} callback, {field}={reference}; money may have been collected"
                    );
                } else {
                    warn!("Unmatched {method} callback, {field}={reference}");
                }
                Some(Reconciliation::Unmatched)
            }
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Reconciling {method} callback failed: {e}");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct CallbackReceiver {
    registry: ProviderRegistry,
    reconciler: Arc<Reconciler>,
}

impl CallbackReceiver {
    pub fn new(registry: ProviderRegistry, reconciler: Arc<Reconciler>) -> Self {
        Self {
            registry,
            reconciler,
        }
    }

    /// Looks up the provider named in the path and checks the signature.
    /// `header` resolves request headers by name.
    pub fn accept<H>(
        &self,
        provider: &str,
        body: Vec<u8>,
        header: H,
    ) -> Result<AcceptedCallback, CallbackRejection>
    where
        H: Fn(&str) -> Option<String>,
    {
        let adapter = provider
            .parse::<PaymentMethod>()
            .ok()
            .and_then(|method| self.registry.get(method))
            .filter(|p| p.correlation_key() != CorrelationKey::LocalReference)
            .ok_or_else(|| CallbackRejection::UnknownProvider(provider.to_string()))?;

        let signature = adapter.signature_header().and_then(&header);
        if let Err(e) = adapter.verify_callback(&body, signature.as_deref()) {
            warn!("Rejected {} callback: {e}", adapter.method());
            return Err(e.into());
        }

        info!("Acknowledged {} callback ({} bytes)", adapter.method(), body.len());
        Ok(AcceptedCallback {
            acknowledgement: adapter.acknowledgement(),
            job: CallbackJob {
                provider: adapter,
                reconciler: self.reconciler.clone(),
                body,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MpesaConfig, Secret, StripeConfig};
    use crate::domain::payment::{NewPayment, PaymentStatus};
    use crate::domain::ports::PaymentRepository;
    use crate::infrastructure::memory::InMemoryStore;
    use crate::infrastructure::notifier::LogNotifier;
    use crate::providers::{CashOnDeliveryProvider, MpesaProvider, StripeProvider};
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use uuid::Uuid;

    fn receiver(store: Arc<InMemoryStore>) -> CallbackReceiver {
        let registry = ProviderRegistry::new()
            .with(Arc::new(CashOnDeliveryProvider))
            .with(Arc::new(MpesaProvider::new(
                reqwest::Client::new(),
                MpesaConfig {
                    base_url: "http://unused".to_string(),
                    consumer_key: "key".to_string(),
                    consumer_secret: Secret::new("secret".to_string()),
                    short_code: "174379".to_string(),
                    passkey: Secret::new("passkey".to_string()),
                },
                "https://shop.example/payments/mpesa/callback".to_string(),
            )))
            .with(Arc::new(StripeProvider::new(
                reqwest::Client::new(),
                StripeConfig {
                    base_url: "http://unused".to_string(),
                    secret_key: Secret::new("sk_test".to_string()),
                    webhook_secret: Secret::new("whsec_test".to_string()),
                },
            )));
        let reconciler = Reconciler::new(store.clone(), store, Arc::new(LogNotifier));
        CallbackReceiver::new(registry, Arc::new(reconciler))
    }

    fn no_headers(_: &str) -> Option<String> {
        None
    }

    fn stk_success(checkout_request_id: &str) -> Vec<u8> {
        json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "Amount", "Value": 2050 },
                    { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" }
                ]}
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn accepted_callback_acknowledges_then_settles() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(NewPayment {
                id: Uuid::new_v4(),
                order_id: None,
                provider: PaymentMethod::Mpesa,
                provider_reference: "ws_CO_20".to_string(),
                amount: BigDecimal::from(2050),
                currency: "KES".to_string(),
                status: PaymentStatus::Pending,
                payer_contact: None,
                failure_reason: None,
                raw_payload: None,
            })
            .unwrap();

        let accepted = receiver(store.clone())
            .accept("mpesa", stk_success("ws_CO_20"), no_headers)
            .unwrap();
        assert_eq!(accepted.acknowledgement, json!({"ResultCode": 0, "ResultDesc": "Accepted"}));

        let result = accepted.job.run().await;
        assert!(matches!(result, Some(Reconciliation::Completed(_))));
        let payment = store
            .find_by_reference(PaymentMethod::Mpesa, "ws_CO_20")
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.receipt.as_deref(), Some("NLJ7RT61SV"));
    }

    #[tokio::test]
    async fn unmatched_callback_is_still_acknowledged() {
        let store = Arc::new(InMemoryStore::new());
        let accepted = receiver(store)
            .accept("mpesa", stk_success("ws_CO_nobody"), no_headers)
            .unwrap();
        assert_eq!(accepted.job.run().await, Some(Reconciliation::Unmatched));
    }

    #[tokio::test]
    async fn garbage_body_is_acknowledged_and_dropped() {
        let accepted = receiver(Arc::new(InMemoryStore::new()))
            .accept("mpesa", b"not json".to_vec(), no_headers)
            .unwrap();
        assert_eq!(accepted.job.run().await, None);
    }

    #[test]
    fn unsigned_stripe_event_is_rejected() {
        let result = receiver(Arc::new(InMemoryStore::new())).accept("stripe", b"{}".to_vec(), no_headers);
        assert!(matches!(
            result,
            Err(CallbackRejection::Rejected(CallbackError::MissingSignature))
        ));
    }

    #[test]
    fn forged_stripe_signature_is_rejected() {
        let result = receiver(Arc::new(InMemoryStore::new())).accept("stripe", b"{}".to_vec(), |name| {
            (name == "Stripe-Signature").then(|| "t=1,v1=deadbeef".to_string())
        });
        assert!(matches!(
            result,
            Err(CallbackRejection::Rejected(CallbackError::InvalidSignature))
        ));
    }

    #[test]
    fn providers_without_callbacks_are_unknown() {
        let r = receiver(Arc::new(InMemoryStore::new()));
        assert!(matches!(
            r.accept("cod", b"{}".to_vec(), no_headers),
            Err(CallbackRejection::UnknownProvider(_))
        ));
        assert!(matches!(
            r.accept("paypal", b"{}".to_vec(), no_headers),
            Err(CallbackRejection::UnknownProvider(_))
        ));
    }
}
