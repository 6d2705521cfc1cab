use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use super::{blocking, Caller};
use crate::domain::errors::DomainError;
use crate::domain::order::{Order, OrderPaymentStatus, OrderStatus};
use crate::domain::payment::{
    AttemptOutcome, AttemptUpdate, NewPayment, Payment, PaymentMethod, PaymentStatus,
};
use crate::domain::ports::{OrderRepository, PaymentRepository};
use crate::providers::{InitiationRequest, ProviderRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedPayment {
    pub payment_id: Uuid,
    pub provider_reference: String,
    pub customer_message: Option<String>,
    pub client_secret: Option<String>,
}

/// What a client may learn about a payment. Failure detail stays internal.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatusView {
    pub payment_id: Uuid,
    pub provider: PaymentMethod,
    pub status: PaymentStatus,
    pub order_id: Option<Uuid>,
    pub order_status: Option<OrderStatus>,
    pub order_payment_status: Option<OrderPaymentStatus>,
}

pub struct PaymentService {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentRepository>,
    registry: ProviderRegistry,
}

impl PaymentService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        payments: Arc<dyn PaymentRepository>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            orders,
            payments,
            registry,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Asks the provider to collect the order total. A successful call only
    /// means the provider accepted the request; the order stays unpaid until
    /// the callback is reconciled.
    ///
    /// `contact` defaults to the shipping phone number.
    pub async fn initiate(
        &self,
        caller: &Caller,
        method: PaymentMethod,
        order_id: Uuid,
        contact: Option<String>,
    ) -> Result<InitiatedPayment, DomainError> {
        let provider = self.registry.get(method).ok_or_else(|| {
            DomainError::InvalidInput(format!("payment method {method} is not available"))
        })?;

        let orders = self.orders.clone();
        let order = blocking(move || orders.find_by_id(order_id))
            .await?
            .ok_or(DomainError::NotFound)?;
        check_payable(caller, &order, method)?;

        let request = InitiationRequest {
            attempt_id: Uuid::new_v4(),
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: order.total.clone(),
            currency: order.currency.clone(),
            contact: contact
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| order.shipping_address.phone.clone()),
        };

        // Recorded before the provider is called so that a callback racing the
        // provider's response still finds its payment.
        let known_reference = provider.reference_in_advance(&request);
        let attempt = NewPayment {
            id: request.attempt_id,
            order_id: Some(order.id),
            provider: method,
            provider_reference: known_reference
                .clone()
                .unwrap_or_else(|| format!("attempt-{}", request.attempt_id)),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
            status: PaymentStatus::Processing,
            payer_contact: Some(request.contact.clone()),
            failure_reason: None,
            raw_payload: None,
        };
        let payments = self.payments.clone();
        let existing = blocking(move || {
            let reference = attempt.provider_reference.clone();
            match payments.insert(attempt) {
                Ok(_) => Ok(None),
                // The reference is already held, e.g. a second cash-on-delivery
                // request for the same order.
                Err(DomainError::Conflict(_)) => payments
                    .find_by_reference(method, &reference)?
                    .ok_or(DomainError::NotFound)
                    .map(Some),
                Err(e) => Err(e),
            }
        })
        .await?;
        if let Some(existing) = existing {
            debug!(
                "{} payment {} already recorded for order {}",
                method, existing.provider_reference, order.order_number
            );
            return Ok(InitiatedPayment {
                payment_id: existing.id,
                provider_reference: existing.provider_reference,
                customer_message: None,
                client_secret: None,
            });
        }

        let acceptance = match provider.initiate(&request).await {
            Ok(acceptance) => acceptance,
            Err(e) => {
                if !e.is_validation() {
                    warn!(
                        "{} initiation failed for order {}: {e}",
                        method, order.order_number
                    );
                }
                let reference =
                    known_reference.unwrap_or_else(|| format!("failed-{}", request.attempt_id));
                self.reject_attempt(request.attempt_id, reference, e.to_string())
                    .await?;
                return Err(match e {
                    DomainError::Provider(_) => e,
                    e if e.is_validation() => e,
                    e => DomainError::Provider(e.to_string()),
                });
            }
        };

        let update = AttemptUpdate {
            reference: acceptance.reference.clone(),
            contact: Some(acceptance.contact.clone()),
            outcome: AttemptOutcome::Accepted {
                raw: acceptance.raw.clone(),
            },
        };
        let payments = self.payments.clone();
        let orders = self.orders.clone();
        let attempt_id = request.attempt_id;
        let stored = blocking(move || {
            let reference = update.reference.clone();
            let stored = payments.update_attempt(attempt_id, update)?;
            orders.set_payment_reference(order_id, &reference)?;
            Ok(stored)
        })
        .await?;

        info!(
            "{} payment {} initiated for order {} ({} {})",
            method, stored.provider_reference, order.order_number, stored.amount, stored.currency
        );
        Ok(InitiatedPayment {
            payment_id: stored.id,
            provider_reference: stored.provider_reference,
            customer_message: acceptance.customer_message,
            client_secret: acceptance.client_secret,
        })
    }

    pub async fn status(&self, caller: &Caller, payment_id: Uuid) -> Result<PaymentStatusView, DomainError> {
        let payments = self.payments.clone();
        let orders = self.orders.clone();
        let (payment, order) = blocking(move || {
            let payment = payments.find_by_id(payment_id)?.ok_or(DomainError::NotFound)?;
            let order = match payment.order_id {
                Some(id) => orders.find_by_id(id)?,
                None => None,
            };
            Ok((payment, order))
        })
        .await?;

        match &order {
            Some(order) if !caller.can_see(order) => return Err(DomainError::Forbidden),
            None => caller.require_admin()?,
            _ => {}
        }
        Ok(view(&payment, order.as_ref()))
    }

    async fn reject_attempt(
        &self,
        attempt_id: Uuid,
        reference: String,
        reason: String,
    ) -> Result<Payment, DomainError> {
        let update = AttemptUpdate {
            reference,
            contact: None,
            outcome: AttemptOutcome::Rejected { reason },
        };
        let payments = self.payments.clone();
        blocking(move || payments.update_attempt(attempt_id, update)).await
    }
}

fn check_payable(caller: &Caller, order: &Order, method: PaymentMethod) -> Result<(), DomainError> {
    if order.customer_id != caller.user_id {
        return Err(DomainError::Forbidden);
    }
    if order.status == OrderStatus::Cancelled {
        return Err(DomainError::Conflict(format!(
            "order {} is cancelled",
            order.order_number
        )));
    }
    if order.is_paid() {
        return Err(DomainError::Conflict(format!(
            "order {} is already paid",
            order.order_number
        )));
    }
    if order.payment_method != method {
        return Err(DomainError::InvalidInput(format!(
            "order {} is to be paid with {}",
            order.order_number, order.payment_method
        )));
    }
    Ok(())
}

fn view(payment: &Payment, order: Option<&Order>) -> PaymentStatusView {
    PaymentStatusView {
        payment_id: payment.id,
        provider: payment.provider,
        status: payment.status,
        order_id: payment.order_id,
        order_status: order.map(|o| o.status),
        order_payment_status: order.map(|o| o.payment_status),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::order_service::{CreateOrder, OrderService};
    use crate::domain::order::{OrderLineInput, ShippingAddress};
    use crate::application::reconciler::{Reconciler, Reconciliation};
    use crate::domain::payment::{CallbackOutcome, CallbackResult, CorrelationKey};
    use crate::domain::pricing::PricingPolicy;
    use crate::domain::product::Product;
    use crate::infrastructure::memory::InMemoryStore;
    use crate::infrastructure::notifier::LogNotifier;
    use crate::providers::{CallbackError, CashOnDeliveryProvider, PaymentProvider, ProviderAcceptance};
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use serde_json::{json, Value};

    /// Mobile-money stand-in that either accepts with a fixed reference or
    /// fails as if the provider were down.
    pub(crate) struct FakeMpesa {
        pub reference: String,
        pub fail: bool,
    }

    #[async_trait]
    impl PaymentProvider for FakeMpesa {
        fn method(&self) -> PaymentMethod {
            PaymentMethod::Mpesa
        }

        fn correlation_key(&self) -> CorrelationKey {
            CorrelationKey::CheckoutRequestId
        }

        async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
            if self.fail {
                return Err(DomainError::Provider("503 Service Unavailable".to_string()));
            }
            let contact = crate::domain::phone::normalize_msisdn(&request.contact)?;
            Ok(ProviderAcceptance {
                reference: self.reference.clone(),
                contact,
                customer_message: Some("Check your phone".to_string()),
                client_secret: None,
                raw: json!({ "CheckoutRequestID": self.reference }),
            })
        }

        fn parse_callback(&self, _body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
            Err(CallbackError::Malformed("not used".to_string()))
        }

        fn acknowledgement(&self) -> Value {
            json!({ "ResultCode": 0 })
        }
    }

    /// Card provider whose webhook lands while the create call is still in
    /// flight, before its reference has been stored.
    struct WebhookFirst {
        store: Arc<InMemoryStore>,
        seen: std::sync::Mutex<Option<Reconciliation>>,
    }

    #[async_trait]
    impl PaymentProvider for WebhookFirst {
        fn method(&self) -> PaymentMethod {
            PaymentMethod::Stripe
        }

        fn correlation_key(&self) -> CorrelationKey {
            CorrelationKey::PaymentIntentId
        }

        async fn initiate(&self, request: &InitiationRequest) -> Result<ProviderAcceptance, DomainError> {
            let webhook = CallbackOutcome {
                provider: PaymentMethod::Stripe,
                reference: "pi_early".to_string(),
                attempt_id: Some(request.attempt_id),
                result: CallbackResult::Succeeded {
                    amount: Some(request.amount.clone()),
                    receipt: Some("ch_early".to_string()),
                },
                raw: json!({ "type": "payment_intent.succeeded" }),
            };
            let reconciler =
                Reconciler::new(self.store.clone(), self.store.clone(), Arc::new(LogNotifier));
            let result = reconciler.reconcile(webhook).await?;
            *self.seen.lock().unwrap() = Some(result);
            Ok(ProviderAcceptance {
                reference: "pi_early".to_string(),
                contact: request.contact.clone(),
                customer_message: None,
                client_secret: Some("pi_early_secret".to_string()),
                raw: json!({ "id": "pi_early", "status": "succeeded" }),
            })
        }

        fn parse_callback(&self, _body: &[u8]) -> Result<Option<CallbackOutcome>, CallbackError> {
            Err(CallbackError::Malformed("not used".to_string()))
        }

        fn acknowledgement(&self) -> Value {
            json!({ "received": true })
        }
    }

    pub(crate) struct Setup {
        pub store: Arc<InMemoryStore>,
        pub orders: OrderService,
        pub payments: PaymentService,
        pub product_id: Uuid,
    }

    pub(crate) fn setup(mpesa: FakeMpesa) -> Setup {
        setup_with(Arc::new(InMemoryStore::new()), Arc::new(mpesa))
    }

    pub(crate) fn setup_with(store: Arc<InMemoryStore>, provider: Arc<dyn PaymentProvider>) -> Setup {
        let product_id = Uuid::new_v4();
        store.add_product(Product {
            id: product_id,
            name: "Kenya AA".to_string(),
            price: BigDecimal::from(850),
            stock: 10,
            low_stock_alert: 2,
            is_active: true,
        });
        let registry = ProviderRegistry::new()
            .with(provider)
            .with(Arc::new(CashOnDeliveryProvider));
        let orders = OrderService::new(
            store.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            PricingPolicy::default(),
            registry.methods(),
        );
        let payments = PaymentService::new(store.clone(), store.clone(), registry);
        Setup {
            store,
            orders,
            payments,
            product_id,
        }
    }

    pub(crate) fn place_order(setup: &Setup, caller: &Caller, method: PaymentMethod) -> Order {
        setup
            .orders
            .create_order(
                caller,
                CreateOrder {
                    items: vec![OrderLineInput {
                        product_id: setup.product_id,
                        quantity: 2,
                    }],
                    shipping_address: ShippingAddress {
                        full_name: "Wanjiru K".to_string(),
                        phone: "0712345678".to_string(),
                        line1: "Moi Avenue 12".to_string(),
                        line2: None,
                        city: "Nairobi".to_string(),
                        region: None,
                        postal_code: None,
                        country: "KE".to_string(),
                    },
                    payment_method: method,
                    client_total: BigDecimal::from(2050),
                },
            )
            .unwrap()
    }

    fn mpesa(reference: &str) -> FakeMpesa {
        FakeMpesa {
            reference: reference.to_string(),
            fail: false,
        }
    }

    #[tokio::test]
    async fn accepted_initiation_records_a_pending_payment() {
        let s = setup(mpesa("ws_CO_1"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Mpesa);

        let initiated = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, Some("+254 712 345 678".to_string()))
            .await
            .unwrap();

        assert_eq!(initiated.provider_reference, "ws_CO_1");
        let payment = s
            .store
            .find_by_reference(PaymentMethod::Mpesa, "ws_CO_1")
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.amount, BigDecimal::from(2050));
        assert_eq!(payment.payer_contact.as_deref(), Some("254712345678"));

        let order = OrderRepository::find_by_id(s.store.as_ref(), order.id).unwrap().unwrap();
        assert_eq!(order.payment_reference.as_deref(), Some("ws_CO_1"));
        assert!(!order.is_paid());
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn provider_outage_records_a_failed_attempt_only() {
        let s = setup(FakeMpesa {
            reference: "unused".to_string(),
            fail: true,
        });
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Mpesa);

        let err = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, None)
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Provider(_)));
        let stored = OrderRepository::find_by_id(s.store.as_ref(), order.id).unwrap().unwrap();
        assert_eq!(stored.payment_status, OrderPaymentStatus::Pending);
        assert_eq!(stored.payment_reference, None);
        assert_eq!(s.store.stock_of(s.product_id), Some(8));

        let attempts = s.store.payments_for(order.id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, PaymentStatus::Failed);
        assert_eq!(attempts[0].provider_reference, format!("failed-{}", attempts[0].id));
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("Payment provider error: 503 Service Unavailable"));
    }

    #[tokio::test]
    async fn webhook_that_beats_the_provider_response_still_pays_the_order() {
        let store = Arc::new(InMemoryStore::new());
        let card = Arc::new(WebhookFirst {
            store: store.clone(),
            seen: std::sync::Mutex::new(None),
        });
        let s = setup_with(store, card.clone());
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Stripe);

        let initiated = s
            .payments
            .initiate(&caller, PaymentMethod::Stripe, order.id, Some("pm_card_visa".to_string()))
            .await
            .unwrap();

        let seen = card.seen.lock().unwrap().clone();
        assert!(matches!(seen, Some(Reconciliation::Completed(ref p)) if p.id == initiated.payment_id));
        let payment = PaymentRepository::find_by_id(s.store.as_ref(), initiated.payment_id)
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.provider_reference, "pi_early");
        assert_eq!(payment.receipt.as_deref(), Some("ch_early"));

        let paid = OrderRepository::find_by_id(s.store.as_ref(), order.id).unwrap().unwrap();
        assert!(paid.is_paid());
        assert_eq!(paid.status, OrderStatus::Confirmed);
        assert_eq!(paid.payment_reference.as_deref(), Some("pi_early"));

        let later = chrono::Utc::now() + chrono::Duration::hours(2);
        assert_eq!(s.orders.expire_unpaid_orders(later, chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(s.store.stock_of(s.product_id), Some(8));
    }

    #[tokio::test]
    async fn cash_on_delivery_reference_is_known_up_front() {
        let s = setup(mpesa("ws_CO_7"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::CashOnDelivery);
        let reference = format!("COD-{}", order.order_number);

        let initiated = s
            .payments
            .initiate(&caller, PaymentMethod::CashOnDelivery, order.id, None)
            .await
            .unwrap();

        assert_eq!(initiated.provider_reference, reference);
        let attempts = s.store.payments_for(order.id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, PaymentStatus::Pending);
        assert_eq!(attempts[0].provider_reference, reference);
    }

    #[tokio::test]
    async fn bad_phone_number_is_a_validation_error() {
        let s = setup(mpesa("ws_CO_2"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Mpesa);
        let err = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, Some("12345".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidPhoneNumber(_)));
        let attempts = s.store.payments_for(order.id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn only_the_owner_can_pay_for_an_order() {
        let s = setup(mpesa("ws_CO_3"));
        let owner = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &owner, PaymentMethod::Mpesa);
        let err = s
            .payments
            .initiate(&Caller::customer(Uuid::new_v4()), PaymentMethod::Mpesa, order.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden));
    }

    #[tokio::test]
    async fn method_must_match_the_order() {
        let s = setup(mpesa("ws_CO_4"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::CashOnDelivery);
        let err = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cancelled_orders_cannot_be_paid() {
        let s = setup(mpesa("ws_CO_5"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Mpesa);
        s.orders.cancel_order(&caller, order.id, None).unwrap();
        let err = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn cash_on_delivery_initiation_is_repeatable() {
        let s = setup(mpesa("unused"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::CashOnDelivery);

        let first = s
            .payments
            .initiate(&caller, PaymentMethod::CashOnDelivery, order.id, None)
            .await
            .unwrap();
        let second = s
            .payments
            .initiate(&caller, PaymentMethod::CashOnDelivery, order.id, None)
            .await
            .unwrap();

        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(first.provider_reference, format!("COD-{}", order.order_number));
    }

    #[tokio::test]
    async fn status_reports_payment_and_order_state() {
        let s = setup(mpesa("ws_CO_6"));
        let caller = Caller::customer(Uuid::new_v4());
        let order = place_order(&s, &caller, PaymentMethod::Mpesa);
        let initiated = s
            .payments
            .initiate(&caller, PaymentMethod::Mpesa, order.id, None)
            .await
            .unwrap();

        let view = s.payments.status(&caller, initiated.payment_id).await.unwrap();
        assert_eq!(view.status, PaymentStatus::Pending);
        assert_eq!(view.order_status, Some(OrderStatus::Pending));
        assert_eq!(view.order_payment_status, Some(OrderPaymentStatus::Pending));

        let stranger = Caller::customer(Uuid::new_v4());
        assert!(matches!(
            s.payments.status(&stranger, initiated.payment_id).await,
            Err(DomainError::Forbidden)
        ));
    }
}
